use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::capabilities::{ValidatedUrl, MAX_TIMEOUT_MS};
use crate::{
    AppError, AppResult, ErrorKind, DEFAULT_API_BASE_URL, DEFAULT_PAGE_SIZE,
    DEFAULT_REQUEST_TIMEOUT, MAX_PAGE_SIZE,
};

pub const ENV_API_BASE_URL: &str = "RIDESHARE_API_BASE_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "RIDESHARE_REQUEST_TIMEOUT_MS";
pub const ENV_PAGE_SIZE: &str = "RIDESHARE_PAGE_SIZE";
pub const ENV_ALLOW_PRIVATE_HOSTS: &str = "RIDESHARE_ALLOW_PRIVATE_HOSTS";

/// Where the API lives and how requests to it behave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Every endpoint is resolved against this one URL.
    pub base_url: ValidatedUrl,
    pub request_timeout_ms: u64,
    pub page_size: u32,
    /// Development servers usually run on localhost or a LAN address.
    pub allow_private_hosts: bool,
    pub user_agent: String,
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> AppResult<Self> {
        let base_url = std::env::var(ENV_API_BASE_URL)
            .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());

        let config = Self {
            request_timeout_ms: env_or(ENV_REQUEST_TIMEOUT_MS, default_timeout_ms())?,
            page_size: env_or(ENV_PAGE_SIZE, DEFAULT_PAGE_SIZE)?,
            allow_private_hosts: env_or(ENV_ALLOW_PRIVATE_HOSTS, false)?,
            ..Self::new(parse_base_url(&base_url)?)
        };

        config.validate()?;
        Ok(config)
    }

    pub fn new(base_url: ValidatedUrl) -> Self {
        Self {
            base_url,
            request_timeout_ms: default_timeout_ms(),
            page_size: DEFAULT_PAGE_SIZE,
            allow_private_hosts: false,
            user_agent: default_user_agent(),
        }
    }

    /// Config for a development server; private addresses are allowed.
    pub fn local(base_url: &str) -> AppResult<Self> {
        let config = Self {
            allow_private_hosts: true,
            ..Self::new(parse_base_url(base_url)?)
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.page_size == 0 {
            return Err(invalid("Page size must be greater than 0"));
        }

        if self.page_size > MAX_PAGE_SIZE {
            return Err(invalid(format!(
                "Page size must not exceed {MAX_PAGE_SIZE}"
            )));
        }

        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(invalid(format!(
                "Request timeout must be between 1 and {MAX_TIMEOUT_MS} ms"
            )));
        }

        if self.base_url.is_private() && !self.allow_private_hosts {
            return Err(invalid(format!(
                "API base URL {} points at a private address; set {ENV_ALLOW_PRIVATE_HOSTS}=true for development servers",
                self.base_url.as_str()
            )));
        }

        if self.user_agent.trim().is_empty() {
            return Err(invalid("User agent cannot be empty"));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Resolves `path` (and optional query pairs) against the base URL.
    pub fn endpoint(&self, path: &str, query: &[(String, String)]) -> AppResult<ValidatedUrl> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');

        let mut url = Url::parse(&format!("{base}/{path}")).map_err(|e| {
            AppError::new(ErrorKind::Internal, "Could not build the request URL")
                .with_internal(e.to_string())
        })?;

        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        ValidatedUrl::new(url.to_string()).map_err(AppError::from)
    }
}

fn default_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_REQUEST_TIMEOUT.as_millis()).unwrap_or(MAX_TIMEOUT_MS)
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn parse_base_url(raw: &str) -> AppResult<ValidatedUrl> {
    ValidatedUrl::new(raw.trim()).map_err(|e| {
        invalid(format!("{ENV_API_BASE_URL} is not a valid URL")).with_internal(e.to_string())
    })
}

fn env_or<T: FromStr>(name: &str, default: T) -> AppResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::new(ErrorKind::Validation, message).with_context("source", "config")
}
