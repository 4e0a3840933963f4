mod http;
mod kv;

use std::sync::Arc;

pub use self::http::{
    validate_header_value, ContentType, HttpError, HttpHeaders, HttpMethod,
    HttpRequest, HttpResponse, HttpResult, HttpTransport, ValidatedUrl, MAX_TIMEOUT_MS,
};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, KvOperation, KvOutput, KvResult, KvValue,
    MemoryKvStore, StorageErrorCode, TypedKvStore,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::http::ReqwestTransport;
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;

use crate::{AppError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Storage error: {0}")]
    Kv(#[from] KvError),
}

impl From<HttpError> for AppError {
    fn from(error: HttpError) -> Self {
        let internal = error.to_string();
        match error {
            HttpError::ConnectionError { .. } => {
                AppError::new(ErrorKind::Network, "Unable to reach the server")
            }
            HttpError::Timeout { .. } => {
                AppError::new(ErrorKind::Timeout, "The server did not respond in time")
            }
            HttpError::InvalidResponse { .. } | HttpError::ResponseTooLarge { .. } => {
                return AppError::malformed(internal);
            }
            HttpError::SerializationError { .. } => {
                AppError::new(ErrorKind::Serialization, "Could not encode the request")
            }
            HttpError::BodyTooLarge { .. } => {
                AppError::new(ErrorKind::Validation, "The request is too large")
            }
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::TooManyHeaders { .. }
            | HttpError::InvalidRequest { .. } => {
                AppError::new(ErrorKind::Internal, "Could not build the request")
            }
        }
        .with_internal(internal)
    }
}

impl From<KvError> for AppError {
    fn from(error: KvError) -> Self {
        let kind = match error {
            KvError::Serialization { .. } => ErrorKind::Deserialization,
            _ => ErrorKind::Storage,
        };
        AppError::new(kind, "Local storage failed").with_internal(error.to_string())
    }
}

impl From<CapabilityError> for AppError {
    fn from(error: CapabilityError) -> Self {
        match error {
            CapabilityError::Http(e) => e.into(),
            CapabilityError::Kv(e) => e.into(),
        }
    }
}

/// Platform services the core talks to. Cheap to clone; shared by every controller.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpTransport>,
    pub kv: Arc<dyn KeyValueStore>,
}

impl Capabilities {
    pub fn new(http: Arc<dyn HttpTransport>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { http, kv }
    }

    /// Reqwest transport plus a SQLite store at `db_path`.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn native(
        config: &crate::ClientConfig,
        db_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, CapabilityError> {
        let http = ReqwestTransport::new(&config.user_agent)?;
        let kv = SqliteKvStore::open(db_path)?;
        Ok(Self::new(Arc::new(http), Arc::new(kv)))
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, PoisonError};

    use tokio::sync::{oneshot, watch};

    use super::*;

    enum Reply {
        Ready(HttpResult),
        Gated(oneshot::Receiver<HttpResult>),
    }

    /// Hands out queued replies in call order and records every request it sees.
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<HttpRequest>>,
        calls: watch::Sender<usize>,
    }

    /// Completes one gated reply.
    pub struct Gate(oneshot::Sender<HttpResult>);

    impl Gate {
        pub fn respond(self, result: HttpResult) {
            let _ = self.0.send(result);
        }

        pub fn respond_json(self, status: u16, body: serde_json::Value) {
            self.respond(Ok(HttpResponse::json_body(status, &body)));
        }
    }

    impl ScriptedTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                calls: watch::Sender::new(0),
            })
        }

        pub fn push(&self, result: HttpResult) {
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Reply::Ready(result));
        }

        pub fn push_json(&self, status: u16, body: serde_json::Value) {
            self.push(Ok(HttpResponse::json_body(status, &body)));
        }

        pub fn push_connection_error(&self) {
            self.push(Err(HttpError::ConnectionError {
                host: "scripted".into(),
                message: "connection refused".into(),
            }));
        }

        /// Queues a reply that is held until the returned gate is completed.
        pub fn push_gated(&self) -> Gate {
            let (tx, rx) = oneshot::channel();
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Reply::Gated(rx));
            Gate(tx)
        }

        pub fn call_count(&self) -> usize {
            *self.calls.borrow()
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn last_request(&self) -> Option<HttpRequest> {
            self.requests().pop()
        }

        /// Resolves once at least `count` requests have reached the transport.
        pub async fn wait_for_calls(&self, count: usize) {
            let mut rx = self.calls.subscribe();
            let _ = rx.wait_for(|calls| *calls >= count).await;
        }
    }

    #[async_trait::async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            let reply = {
                self.requests
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(request);
                self.replies
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front()
            };
            self.calls.send_modify(|calls| *calls += 1);

            match reply {
                Some(Reply::Ready(result)) => result,
                Some(Reply::Gated(rx)) => rx.await.unwrap_or_else(|_| {
                    Err(HttpError::ConnectionError {
                        host: "scripted".into(),
                        message: "gate dropped".into(),
                    })
                }),
                None => Err(HttpError::ConnectionError {
                    host: "scripted".into(),
                    message: "no scripted reply".into(),
                }),
            }
        }
    }

    /// Store whose every operation fails with the given code.
    pub struct FailingKvStore(pub StorageErrorCode);

    #[async_trait::async_trait]
    impl KeyValueStore for FailingKvStore {
        async fn execute(&self, _operation: KvOperation) -> KvResult {
            Err(KvError::storage(self.0, "scripted storage failure"))
        }
    }

    pub fn scripted_capabilities() -> (Capabilities, Arc<ScriptedTransport>, Arc<MemoryKvStore>) {
        let transport = ScriptedTransport::new();
        let kv = Arc::new(MemoryKvStore::new());
        let caps = Capabilities::new(transport.clone(), kv.clone());
        (caps, transport, kv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_map_to_connectivity_kinds() {
        let network: AppError = HttpError::ConnectionError {
            host: "api".into(),
            message: "refused".into(),
        }
        .into();
        assert_eq!(network.kind, ErrorKind::Network);
        assert!(network.is_connectivity());

        let timeout: AppError = HttpError::Timeout {
            timeout_ms: 10,
            request_id: "r".into(),
        }
        .into();
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert!(timeout.is_connectivity());
    }

    #[test]
    fn unreadable_response_is_malformed() {
        let error: AppError = HttpError::InvalidResponse {
            reason: "truncated".into(),
            request_id: "r".into(),
        }
        .into();
        assert_eq!(error.kind, ErrorKind::Deserialization);
        assert!(!error.is_connectivity());
    }

    #[test]
    fn storage_errors_map_to_storage_kind() {
        let error: AppError = KvError::storage(StorageErrorCode::DiskFull, "full").into();
        assert_eq!(error.kind, ErrorKind::Storage);
    }
}
