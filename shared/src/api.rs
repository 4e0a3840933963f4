//! Typed requests against the rideshare API and the `{success, ...}` response envelope.
//!
//! [`ApiClient`] attaches the session token and signs out when the server rejects it.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::capabilities::{Capabilities, ContentType, HttpMethod, HttpRequest, HttpResponse};
use crate::config::ClientConfig;
use crate::session::{Bearer, SessionStore};
use crate::{AppError, AppResult, ErrorKind};

/// Where the useful part of a response envelope lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// A single top-level key, e.g. `"ride"`.
    Key(&'static str),
    /// A nested key path, e.g. `["rides", "as_driver"]`.
    Path(&'static [&'static str]),
    /// The whole envelope object.
    Root,
    /// Only `success` matters; decodes into `()`.
    Ignored,
}

/// A typed call against the API. `T` is what the payload decodes into.
pub struct ApiRequest<T> {
    method: HttpMethod,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    payload: Payload,
    requires_auth: bool,
    timeout: Option<Duration>,
    _response: PhantomData<fn() -> T>,
}

impl<T> Clone for ApiRequest<T> {
    fn clone(&self) -> Self {
        Self {
            method: self.method,
            path: self.path.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            payload: self.payload,
            requires_auth: self.requires_auth,
            timeout: self.timeout,
            _response: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ApiRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("payload", &self.payload)
            .field("requires_auth", &self.requires_auth)
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> ApiRequest<T> {
    pub fn new(method: HttpMethod, path: impl Into<String>, payload: Payload) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            payload,
            requires_auth: true,
            timeout: None,
            _response: PhantomData,
        }
    }

    pub fn get(path: impl Into<String>, payload: Payload) -> Self {
        Self::new(HttpMethod::Get, path, payload)
    }

    pub fn post(path: impl Into<String>, payload: Payload) -> Self {
        Self::new(HttpMethod::Post, path, payload)
    }

    pub fn put(path: impl Into<String>, payload: Payload) -> Self {
        Self::new(HttpMethod::Put, path, payload)
    }

    pub fn delete(path: impl Into<String>, payload: Payload) -> Self {
        Self::new(HttpMethod::Delete, path, payload)
    }

    /// Sent without a session; the bearer header is never attached.
    #[must_use]
    pub fn public(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> AppResult<Self> {
        let value = serde_json::to_value(body).map_err(|e| {
            AppError::new(ErrorKind::Serialization, "Could not encode the request")
                .with_internal(e.to_string())
        })?;
        self.body = Some(value);
        Ok(self)
    }

    /// Sets `key`, replacing any earlier value.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        self.query.retain(|(k, _)| *k != key);
        self.query.push((key, value.to_string()));
        self
    }

    #[must_use]
    pub fn with_optional_query(self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.with_query(key, value),
            None => self,
        }
    }

    #[must_use]
    pub fn with_page(self, limit: u32, offset: u32) -> Self {
        self.with_query("limit", limit).with_query("offset", offset)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn payload(&self) -> Payload {
        self.payload
    }

    pub fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    pub fn to_http(
        &self,
        config: &ClientConfig,
        bearer: Option<&SecretString>,
    ) -> AppResult<HttpRequest> {
        let url = config.endpoint(&self.path, &self.query)?;
        let timeout = self.timeout.unwrap_or_else(|| config.request_timeout());

        let mut request = HttpRequest::new(self.method, url)
            .with_timeout(timeout)?
            .with_header("Accept", ContentType::Json.as_str())?;

        if let Some(body) = &self.body {
            request = request.with_json(body)?;
        }

        if let Some(token) = bearer.filter(|_| self.requires_auth) {
            request = request
                .with_header("Authorization", format!("Bearer {}", token.expose_secret()))?;
        }

        Ok(request)
    }

    /// Applies the envelope rules: status first, then `success`, then the payload shape.
    pub fn decode(&self, response: &HttpResponse) -> AppResult<T> {
        if !response.is_success() {
            let mut error = AppError::from_http_status(response.status(), Some(response.body()));
            if let Some(seconds) = response
                .header("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
            {
                error = error.with_retry_after(seconds.saturating_mul(1000));
            }
            return Err(error);
        }

        let envelope: Value = serde_json::from_slice(response.body())
            .map_err(|e| AppError::malformed(format!("body is not JSON: {e}")))?;

        let Value::Object(mut object) = envelope else {
            return Err(AppError::malformed("body is not a JSON object"));
        };

        let message = object
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        match object.get("success").and_then(Value::as_bool) {
            Some(true) => {}
            Some(false) => return Err(AppError::server_rejected(message)),
            None => return Err(AppError::malformed("missing `success` flag")),
        }

        let payload = match self.payload {
            Payload::Key(key) => object
                .remove(key)
                .ok_or_else(|| AppError::malformed(format!("missing `{key}` in response")))?,
            Payload::Path(path) => take_path(object, path)?,
            Payload::Root => Value::Object(object),
            Payload::Ignored => Value::Null,
        };

        serde_json::from_value(payload).map_err(|e| {
            AppError::malformed(format!("unexpected payload for {}: {e}", self.path))
        })
    }
}

fn take_path(mut object: serde_json::Map<String, Value>, path: &[&str]) -> AppResult<Value> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(Value::Object(object));
    };

    for key in parents {
        match object.remove(*key) {
            Some(Value::Object(inner)) => object = inner,
            _ => return Err(AppError::malformed(format!("missing object `{key}` in response"))),
        }
    }

    object
        .remove(*last)
        .ok_or_else(|| AppError::malformed(format!("missing `{last}` in response")))
}

pub(crate) async fn dispatch<T: DeserializeOwned>(
    caps: &Capabilities,
    config: &ClientConfig,
    request: &ApiRequest<T>,
    bearer: Option<&SecretString>,
) -> AppResult<T> {
    let http = request.to_http(config, bearer)?;
    let response = caps.http.execute(http).await?;
    debug!(
        status = response.status(),
        duration_ms = response.duration_ms(),
        "response received"
    );
    request.decode(&response)
}

/// Sends requests with the current session attached.
#[derive(Clone)]
pub struct ApiClient {
    caps: Capabilities,
    config: Arc<ClientConfig>,
    session: SessionStore,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.config.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(caps: Capabilities, config: Arc<ClientConfig>, session: SessionStore) -> Self {
        Self {
            caps,
            config,
            session,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Performs one request, attaching the current token.
    ///
    /// A request that needs auth fails with `Authentication` when signed out,
    /// and nothing is sent. A 401 on a request that carried a token clears
    /// the session, unless the session changed while the request was in flight.
    #[instrument(
        skip(self, request),
        fields(method = request.method().as_str(), path = %request.path())
    )]
    pub async fn send<T: DeserializeOwned>(&self, request: &ApiRequest<T>) -> AppResult<T> {
        let bearer = self.session.bearer().await;
        if request.requires_auth() && bearer.is_none() {
            debug!("no session, request not sent");
            return Err(AppError::new(ErrorKind::Authentication, "Not signed in")
                .with_context("path", request.path()));
        }

        let token = bearer.as_ref().map(Bearer::token);
        let result = dispatch(&self.caps, &self.config, request, token).await;

        if let (Err(error), Some(bearer)) = (&result, &bearer) {
            if request.requires_auth() && error.http_status() == Some(401) {
                warn!("token rejected by server, signing out");
                self.session.expire(bearer.epoch()).await;
            }
        }

        result
    }
}

/// Builders for every endpoint the app consumes.
pub mod endpoints {
    use super::{ApiRequest, Payload};
    use crate::model::{
        Acknowledgement, AdminStats, BadgeCollection, Credentials, Leaderboard,
        LeaderboardPeriod, LoginResponse, Payment, PaymentDraft, PaymentId, PaymentReceipt,
        PoolDecision, PoolRequest, PoolRequestCreated, PoolRequestDraft, ProfileUpdate,
        RatingDraft, RegisterResponse, Registration, RequestId, Ride, RideDraft, RideId,
        RideRequest, RideRequestCreated, RideRequestDraft, RideSearch, UserId, UserProfile,
        UserRatings, UserRides,
    };
    use crate::{AppResult, LOGIN_TIMEOUT, MUTATION_TIMEOUT};

    fn segment(id: &str) -> String {
        url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
    }

    // --- auth ---

    pub fn login(credentials: &Credentials) -> AppResult<ApiRequest<LoginResponse>> {
        Ok(ApiRequest::post("/api/auth/login", Payload::Root)
            .public()
            .with_timeout(LOGIN_TIMEOUT)
            .with_json(credentials)?)
    }

    pub fn register(registration: &Registration) -> AppResult<ApiRequest<RegisterResponse>> {
        Ok(ApiRequest::post("/api/auth/register", Payload::Root)
            .public()
            .with_timeout(LOGIN_TIMEOUT)
            .with_json(registration)?)
    }

    // --- profile ---

    pub fn profile() -> ApiRequest<UserProfile> {
        ApiRequest::get("/api/users/profile", Payload::Key("user"))
    }

    pub fn update_profile(update: &ProfileUpdate) -> AppResult<ApiRequest<UserProfile>> {
        ApiRequest::put("/api/users/profile", Payload::Key("user")).with_json(update)
    }

    pub fn user_ratings(user_id: &UserId) -> ApiRequest<UserRatings> {
        ApiRequest::get(
            format!("/api/users/{}/ratings", segment(user_id.as_str())),
            Payload::Root,
        )
    }

    pub fn submit_rating(rating: &RatingDraft) -> AppResult<ApiRequest<Acknowledgement>> {
        ApiRequest::post("/api/ratings", Payload::Root).with_json(rating)
    }

    // --- rides ---

    /// All three ride lists at once.
    pub fn user_rides(status: Option<&str>) -> ApiRequest<UserRides> {
        ApiRequest::get("/api/users/rides", Payload::Key("rides"))
            .with_optional_query("status", status)
    }

    /// Rides the caller drives, one page at a time.
    pub fn rides_as_driver(status: Option<&str>) -> ApiRequest<Vec<Ride>> {
        ApiRequest::get("/api/users/rides", Payload::Path(&["rides", "as_driver"]))
            .with_query("role", "driver")
            .with_optional_query("status", status)
    }

    /// Rides the caller joined, one page at a time.
    pub fn rides_as_rider(status: Option<&str>) -> ApiRequest<Vec<Ride>> {
        ApiRequest::get("/api/users/rides", Payload::Path(&["rides", "as_rider"]))
            .with_query("role", "rider")
            .with_optional_query("status", status)
    }

    pub fn ride(id: &RideId) -> ApiRequest<Ride> {
        ApiRequest::get(
            format!("/api/rides/{}", segment(id.as_str())),
            Payload::Key("ride"),
        )
    }

    pub fn create_ride(draft: &RideDraft) -> AppResult<ApiRequest<Ride>> {
        Ok(ApiRequest::post("/api/rides", Payload::Key("ride"))
            .with_timeout(MUTATION_TIMEOUT)
            .with_json(draft)?)
    }

    pub fn delete_ride(id: &RideId) -> ApiRequest<Acknowledgement> {
        ApiRequest::delete(format!("/api/rides/{}", segment(id.as_str())), Payload::Root)
    }

    pub fn start_ride(id: &RideId) -> ApiRequest<Acknowledgement> {
        ApiRequest::post(
            format!("/api/rides/{}/start", segment(id.as_str())),
            Payload::Root,
        )
    }

    pub fn complete_ride(id: &RideId) -> ApiRequest<Acknowledgement> {
        ApiRequest::post(
            format!("/api/rides/{}/complete", segment(id.as_str())),
            Payload::Root,
        )
    }

    pub fn search_rides(search: &RideSearch) -> AppResult<ApiRequest<Vec<Ride>>> {
        ApiRequest::post("/api/rides/search", Payload::Key("rides")).with_json(search)
    }

    // --- ride requests ---

    pub fn create_ride_request(
        draft: &RideRequestDraft,
    ) -> AppResult<ApiRequest<RideRequestCreated>> {
        Ok(ApiRequest::post("/api/ride-requests", Payload::Root)
            .with_timeout(MUTATION_TIMEOUT)
            .with_json(draft)?)
    }

    pub fn ride_request(id: &RequestId) -> ApiRequest<RideRequest> {
        ApiRequest::get(
            format!("/api/ride-requests/{}", segment(id.as_str())),
            Payload::Key("request"),
        )
    }

    pub fn accept_match(
        request_id: &RequestId,
        ride_id: &RideId,
    ) -> AppResult<ApiRequest<Acknowledgement>> {
        ApiRequest::post(
            format!("/api/ride-requests/{}/accept-match", segment(request_id.as_str())),
            Payload::Root,
        )
        .with_json(&serde_json::json!({ "ride_id": ride_id }))
    }

    pub fn cancel_ride_request(id: &RequestId) -> ApiRequest<Acknowledgement> {
        ApiRequest::post(
            format!("/api/ride-requests/{}/cancel", segment(id.as_str())),
            Payload::Root,
        )
    }

    // --- pool requests ---

    pub fn request_pool(
        ride_id: &RideId,
        draft: &PoolRequestDraft,
    ) -> AppResult<ApiRequest<PoolRequestCreated>> {
        ApiRequest::post(
            format!("/api/rides/{}/request-pool", segment(ride_id.as_str())),
            Payload::Root,
        )
        .with_json(draft)
    }

    pub fn primary_rider_action(
        request_id: &RequestId,
        decision: &PoolDecision,
    ) -> AppResult<ApiRequest<Acknowledgement>> {
        ApiRequest::post(
            format!(
                "/api/pool-requests/{}/primary-rider-action",
                segment(request_id.as_str())
            ),
            Payload::Root,
        )
        .with_json(decision)
    }

    pub fn driver_action(
        request_id: &RequestId,
        decision: &PoolDecision,
    ) -> AppResult<ApiRequest<Acknowledgement>> {
        ApiRequest::post(
            format!(
                "/api/pool-requests/{}/driver-action",
                segment(request_id.as_str())
            ),
            Payload::Root,
        )
        .with_json(decision)
    }

    pub fn my_pool_requests(status: Option<&str>) -> ApiRequest<Vec<PoolRequest>> {
        ApiRequest::get("/api/users/pool-requests", Payload::Key("requests"))
            .with_optional_query("status", status)
    }

    pub fn incoming_pool_requests(status: Option<&str>) -> ApiRequest<Vec<PoolRequest>> {
        ApiRequest::get("/api/users/incoming-pool-requests", Payload::Key("requests"))
            .with_optional_query("status", status)
    }

    // --- payments ---

    pub fn create_payment(draft: &PaymentDraft) -> AppResult<ApiRequest<PaymentReceipt>> {
        Ok(ApiRequest::post("/api/payments", Payload::Root)
            .with_timeout(MUTATION_TIMEOUT)
            .with_json(draft)?)
    }

    pub fn payment(id: &PaymentId) -> ApiRequest<Payment> {
        ApiRequest::get(
            format!("/api/payments/{}", segment(id.as_str())),
            Payload::Key("payment"),
        )
    }

    /// `role` is `payer`, `receiver` or `all`.
    pub fn payments(status: Option<&str>, role: Option<&str>) -> ApiRequest<Vec<Payment>> {
        ApiRequest::get("/api/users/payments", Payload::Key("payments"))
            .with_optional_query("status", status)
            .with_optional_query("role", role)
    }

    // --- admin and gamification ---

    pub fn admin_stats() -> ApiRequest<AdminStats> {
        ApiRequest::get("/api/admin/stats", Payload::Key("stats"))
    }

    pub fn driver_badges() -> ApiRequest<BadgeCollection> {
        ApiRequest::get("/api/drivers/badges", Payload::Root)
    }

    pub fn leaderboard(period: LeaderboardPeriod, limit: u32) -> ApiRequest<Leaderboard> {
        ApiRequest::get("/api/drivers/leaderboard", Payload::Root)
            .with_query("period", period.as_str())
            .with_query("limit", limit)
    }
}
