//! Session store: the bearer token, its durable slot and its observers.
//!
//! The token lives in memory as a [`SecretString`] and on disk as one JSON
//! record under `session:current`. Every write to either goes through the
//! writer lock, so the slot and the in-memory state never disagree for
//! longer than one critical section. The network half of `login` runs
//! outside the lock; whichever write completes last wins.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroize;

use crate::api::{dispatch, endpoints};
use crate::capabilities::{
    validate_header_value, Capabilities, KeyNamespace, KvError, TypedKvStore,
};
use crate::config::ClientConfig;
use crate::model::{Credentials, Registration, UserId, UserProfile};
use crate::{AppError, AppResult, ErrorKind, SESSION_SLOT_KEY};

/// In-memory credentials. `Debug` never prints the token.
#[derive(Default)]
pub struct Session {
    token: Option<SecretString>,
    user_id: Option<UserId>,
    user: Option<UserProfile>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("authenticated", &self.is_authenticated())
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Why the session last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionChange {
    Initial,
    Restored,
    LoggedIn,
    LoggedOut,
    /// The server rejected the token (HTTP 401).
    Expired,
}

/// What observers see. Carries no secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub user_id: Option<UserId>,
    pub user: Option<UserProfile>,
    pub last_change: SessionChange,
    pub epoch: u64,
}

impl SessionSnapshot {
    fn initial() -> Self {
        Self {
            authenticated: false,
            user_id: None,
            user: None,
            last_change: SessionChange::Initial,
            epoch: 0,
        }
    }
}

/// A token handed to one request, tagged with the session epoch it came from.
pub struct Bearer {
    token: SecretString,
    epoch: u64,
}

impl Bearer {
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl std::fmt::Debug for Bearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bearer")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    token: String,
    #[serde(default)]
    user_id: Option<UserId>,
}

impl Drop for PersistedSession {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

struct SessionState {
    session: Session,
    epoch: u64,
}

struct Inner {
    caps: Capabilities,
    config: Arc<ClientConfig>,
    slot: TypedKvStore<PersistedSession>,
    state: RwLock<SessionState>,
    writer: Mutex<()>,
    snapshots: watch::Sender<SessionSnapshot>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("snapshot", &*self.inner.snapshots.borrow())
            .finish_non_exhaustive()
    }
}

fn usable_token(token: &str) -> bool {
    !token.trim().is_empty() && validate_header_value(&format!("Bearer {token}")).is_ok()
}

impl SessionStore {
    pub fn new(caps: Capabilities, config: Arc<ClientConfig>) -> Self {
        let slot = TypedKvStore::new(Arc::clone(&caps.kv), KeyNamespace::Session);
        Self {
            inner: Arc::new(Inner {
                caps,
                config,
                slot,
                state: RwLock::new(SessionState {
                    session: Session::default(),
                    epoch: 0,
                }),
                writer: Mutex::new(()),
                snapshots: watch::Sender::new(SessionSnapshot::initial()),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.state.read().await.session.is_authenticated()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.state.read().await.session.user_id.clone()
    }

    /// The current token, if any. Without one, requests that need auth are refused locally.
    pub async fn bearer(&self) -> Option<Bearer> {
        let state = self.inner.state.read().await;
        state.session.token.as_ref().map(|token| Bearer {
            token: SecretString::new(token.expose_secret().clone()),
            epoch: state.epoch,
        })
    }

    /// Restores the token saved by an earlier run.
    ///
    /// Never fails: a missing slot, an unreadable store or a corrupt record
    /// all leave the session unauthenticated. A corrupt record is removed.
    #[instrument(skip(self))]
    pub async fn load_persisted(&self) -> SessionSnapshot {
        let _writer = self.inner.writer.lock().await;

        match self.inner.slot.load(SESSION_SLOT_KEY).await {
            Ok(Some(persisted)) if usable_token(&persisted.token) => {
                let token = SecretString::new(persisted.token.clone());
                let user_id = persisted.user_id.clone();
                let snapshot = self
                    .commit(Some(token), user_id, None, SessionChange::Restored)
                    .await;
                info!("session restored");
                return snapshot;
            }
            Ok(Some(_)) => {
                warn!("persisted session holds an unusable token, discarding");
                self.discard_slot().await;
            }
            Ok(None) => debug!("no persisted session"),
            Err(KvError::Serialization { message, .. }) => {
                warn!(error = %message, "persisted session is corrupt, discarding");
                self.discard_slot().await;
            }
            Err(e) => warn!(error = %e, "could not read persisted session"),
        }

        self.snapshot()
    }

    /// Exchanges credentials for a token, then persists it and publishes the new session.
    ///
    /// On any failure the previous session is left exactly as it was.
    #[instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> AppResult<SessionSnapshot> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AppError::new(
                ErrorKind::Validation,
                "Email and password are required",
            ));
        }

        let request = endpoints::login(&Credentials {
            email: email.trim().to_string(),
            password: password.to_string(),
        })?;

        let response = dispatch(&self.inner.caps, &self.inner.config, &request, None)
            .await
            .map_err(|e| match e.http_status() {
                Some(401) => AppError::new(ErrorKind::InvalidCredentials, e.message.clone())
                    .with_context("http_status", "401"),
                _ => e,
            })?;

        if !usable_token(&response.token) {
            return Err(AppError::malformed("login response carried an unusable token"));
        }

        let _writer = self.inner.writer.lock().await;

        let user_id = response.user.as_ref().map(|user| user.id.clone());
        let record = PersistedSession {
            token: response.token.clone(),
            user_id: user_id.clone(),
        };
        self.inner
            .slot
            .save(SESSION_SLOT_KEY, &record)
            .await
            .map_err(|e| {
                warn!(error = %e, "could not persist session");
                AppError::from(e)
            })?;

        let snapshot = self
            .commit(
                Some(SecretString::new(response.token.clone())),
                user_id,
                response.user.clone(),
                SessionChange::LoggedIn,
            )
            .await;
        info!(user_id = ?snapshot.user_id, "logged in");
        Ok(snapshot)
    }

    /// Creates an account. Does not sign in.
    #[instrument(skip_all)]
    pub async fn register(&self, registration: &Registration) -> AppResult<UserId> {
        if let Some(field) = registration.missing_field() {
            return Err(AppError::new(
                ErrorKind::Validation,
                format!("Missing required field: {field}"),
            ));
        }

        let request = endpoints::register(registration)?;
        let response = dispatch(&self.inner.caps, &self.inner.config, &request, None).await?;
        info!(user_id = %response.user_id, "account registered");
        Ok(response.user_id)
    }

    /// Clears the durable slot and the in-memory session. Idempotent.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> SessionSnapshot {
        let _writer = self.inner.writer.lock().await;
        self.discard_slot().await;

        if !self.is_authenticated().await {
            return self.snapshot();
        }

        let snapshot = self
            .commit(None, None, None, SessionChange::LoggedOut)
            .await;
        info!("logged out");
        snapshot
    }

    /// Signs out because the server rejected the token issued at `epoch`.
    ///
    /// Ignored when the session has changed since, so a late 401 cannot undo a fresh login.
    pub async fn expire(&self, epoch: u64) -> bool {
        let _writer = self.inner.writer.lock().await;

        {
            let state = self.inner.state.read().await;
            if state.epoch != epoch || !state.session.is_authenticated() {
                debug!(epoch, current = state.epoch, "stale expiry ignored");
                return false;
            }
        }

        self.discard_slot().await;
        self.commit(None, None, None, SessionChange::Expired).await;
        warn!("session expired");
        true
    }

    async fn discard_slot(&self) {
        if let Err(e) = self.inner.slot.remove(SESSION_SLOT_KEY).await {
            warn!(error = %e, "could not remove persisted session");
        }
    }

    // Caller holds the writer lock.
    async fn commit(
        &self,
        token: Option<SecretString>,
        user_id: Option<UserId>,
        user: Option<UserProfile>,
        change: SessionChange,
    ) -> SessionSnapshot {
        let mut state = self.inner.state.write().await;
        state.epoch += 1;
        state.session = Session {
            token,
            user_id: user_id.clone(),
            user: user.clone(),
        };

        let snapshot = SessionSnapshot {
            authenticated: state.session.is_authenticated(),
            user_id,
            user,
            last_change: change,
            epoch: state.epoch,
        };
        self.inner.snapshots.send_replace(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{scripted_capabilities, FailingKvStore};
    use crate::capabilities::{KeyValueStore, KvKey, StorageErrorCode, ValidatedUrl};
    use serde_json::json;

    fn config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new(
            ValidatedUrl::new("https://api.example.com").unwrap(),
        ))
    }

    fn login_ok(token: &str) -> serde_json::Value {
        json!({
            "success": true,
            "message": "Login successful!",
            "token": token,
            "user": {
                "id": "u1",
                "name": "Ana",
                "email": "user@example.com",
                "phone_number": "555-0100",
                "user_type": "rider",
                "profile_picture": "",
                "rating": 5.0
            }
        })
    }

    fn slot_key() -> KvKey {
        KvKey::new(KeyNamespace::Session, SESSION_SLOT_KEY).unwrap()
    }

    #[tokio::test]
    async fn test_login_persists_and_publishes() {
        let (caps, transport, kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());
        let mut updates = store.subscribe();

        transport.push_json(200, login_ok("abc123"));
        let snapshot = store.login("user@example.com", "secret").await.unwrap();

        assert!(snapshot.authenticated);
        assert_eq!(snapshot.user_id, Some(UserId::new("u1")));
        assert_eq!(snapshot.last_change, SessionChange::LoggedIn);
        assert_eq!(store.bearer().await.unwrap().token().expose_secret(), "abc123");

        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().authenticated);

        let stored = kv.get(&slot_key()).await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(stored.data()).unwrap();
        assert_eq!(record["token"], "abc123");

        let sent = transport.last_request().unwrap();
        assert_eq!(sent.header("authorization"), None);
    }

    #[tokio::test]
    async fn test_rejected_credentials_leave_state_untouched() {
        let (caps, transport, kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());

        transport.push_json(
            401,
            json!({"success": false, "message": "Invalid email or password!"}),
        );
        let error = store.login("user@example.com", "wrong").await.unwrap_err();

        assert_eq!(error.kind, ErrorKind::InvalidCredentials);
        assert_eq!(error.user_facing_message(), "Invalid email or password!");
        assert!(!error.is_connectivity());
        assert!(!store.is_authenticated().await);
        assert!(kv.is_empty().await);
        assert_eq!(store.snapshot().last_change, SessionChange::Initial);
    }

    #[tokio::test]
    async fn test_login_connectivity_failure_is_distinguishable() {
        let (caps, transport, _kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());

        transport.push_json(200, login_ok("first"));
        store.login("user@example.com", "secret").await.unwrap();

        transport.push_connection_error();
        let error = store.login("other@example.com", "secret").await.unwrap_err();

        assert_eq!(error.kind, ErrorKind::Network);
        assert!(error.is_connectivity());
        assert_eq!(store.bearer().await.unwrap().token().expose_secret(), "first");
    }

    #[tokio::test]
    async fn test_login_without_user_object() {
        let (caps, transport, _kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());

        transport.push_json(200, json!({"success": true, "token": "abc123"}));
        let snapshot = store.login("user@example.com", "secret").await.unwrap();

        assert!(snapshot.authenticated);
        assert_eq!(snapshot.user_id, None);
        assert_eq!(store.bearer().await.unwrap().token().expose_secret(), "abc123");
    }

    #[tokio::test]
    async fn test_login_rejects_unusable_token() {
        let (caps, transport, kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());

        transport.push_json(200, login_ok(""));
        let error = store.login("user@example.com", "secret").await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Deserialization);

        transport.push_json(200, login_ok("abc\r\nX-Evil: 1"));
        assert!(store.login("user@example.com", "secret").await.is_err());

        assert!(!store.is_authenticated().await);
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_login_requires_both_fields_locally() {
        let (caps, transport, _kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());

        let error = store.login("  ", "secret").await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_load_persisted_restores_token() {
        let (caps, _transport, kv) = scripted_capabilities();
        kv.set(
            &slot_key(),
            serde_json::to_vec(&json!({"token": "abc123", "user_id": "u1"})).unwrap(),
        )
        .await
        .unwrap();

        let store = SessionStore::new(caps, config());
        let snapshot = store.load_persisted().await;

        assert!(snapshot.authenticated);
        assert_eq!(snapshot.last_change, SessionChange::Restored);
        assert_eq!(store.user_id().await, Some(UserId::new("u1")));
        assert_eq!(store.bearer().await.unwrap().token().expose_secret(), "abc123");
    }

    #[tokio::test]
    async fn test_load_persisted_discards_corrupt_slot() {
        let (caps, _transport, kv) = scripted_capabilities();
        kv.set(&slot_key(), b"{\"tok".to_vec()).await.unwrap();

        let store = SessionStore::new(caps, config());
        let snapshot = store.load_persisted().await;

        assert!(!snapshot.authenticated);
        assert!(kv.get(&slot_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_persisted_with_empty_slot_or_broken_store() {
        let (caps, _transport, _kv) = scripted_capabilities();
        let store = SessionStore::new(caps.clone(), config());
        assert!(!store.load_persisted().await.authenticated);

        let broken = Capabilities::new(
            caps.http.clone(),
            Arc::new(FailingKvStore(StorageErrorCode::IoError)),
        );
        let store = SessionStore::new(broken, config());
        assert!(!store.load_persisted().await.authenticated);
        assert!(store.bearer().await.is_none());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (caps, transport, kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());
        transport.push_json(200, login_ok("abc123"));
        store.login("user@example.com", "secret").await.unwrap();

        let first = store.logout().await;
        let second = store.logout().await;

        assert!(!first.authenticated);
        assert!(!second.authenticated);
        assert_eq!(first, second);
        assert!(kv.is_empty().await);
        assert!(store.bearer().await.is_none());
    }

    #[tokio::test]
    async fn test_logout_survives_storage_failure() {
        let (caps, _transport, _kv) = scripted_capabilities();
        let broken = Capabilities::new(
            caps.http.clone(),
            Arc::new(FailingKvStore(StorageErrorCode::DiskFull)),
        );
        let store = SessionStore::new(broken, config());
        assert!(!store.logout().await.authenticated);
    }

    #[tokio::test]
    async fn test_stale_expiry_does_not_clear_newer_session() {
        let (caps, transport, _kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());

        transport.push_json(200, login_ok("old"));
        store.login("user@example.com", "secret").await.unwrap();
        let old_epoch = store.bearer().await.unwrap().epoch();

        transport.push_json(200, login_ok("new"));
        store.login("user@example.com", "secret").await.unwrap();

        assert!(!store.expire(old_epoch).await);
        assert_eq!(store.bearer().await.unwrap().token().expose_secret(), "new");

        let current = store.bearer().await.unwrap().epoch();
        assert!(store.expire(current).await);
        assert_eq!(store.snapshot().last_change, SessionChange::Expired);
        assert!(!store.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_register_returns_new_user_without_signing_in() {
        let (caps, transport, _kv) = scripted_capabilities();
        let store = SessionStore::new(caps, config());

        transport.push_json(
            201,
            json!({"success": true, "message": "User registered successfully!", "user_id": "u9"}),
        );
        let registration = Registration {
            email: "new@example.com".into(),
            password: "pw".into(),
            name: "New".into(),
            phone_number: "555".into(),
            user_type: crate::model::UserType::Rider,
            license_number: None,
            vehicle_info: None,
        };
        assert_eq!(store.register(&registration).await.unwrap(), UserId::new("u9"));
        assert!(!store.is_authenticated().await);

        let incomplete = Registration {
            phone_number: String::new(),
            ..registration
        };
        let error = store.register(&incomplete).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(transport.call_count(), 1);
    }
}
