use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::Zeroize;

use crate::get_current_time_ms;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be only whitespace".to_string(),
            });
        }

        if key.contains('\0') {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key cannot contain null bytes".to_string(),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control() && c != '\t') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Session,
    Cache,
    Settings,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Session => "session",
            KeyNamespace::Cache => "cache",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace exceeds maximum length of {MAX_PREFIX_LENGTH} bytes"
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

/// Stored bytes plus bookkeeping. The bytes are wiped when the value is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvValue {
    data: Vec<u8>,
    version: u64,
    created_at: u64,
    updated_at: u64,
}

impl KvValue {
    pub fn new(data: Vec<u8>, now_ms: u64) -> Result<Self, KvError> {
        check_value_size(&data)?;
        Ok(Self {
            data,
            version: 1,
            created_at: now_ms,
            updated_at: now_ms,
        })
    }

    pub fn from_serializable<T: Serialize>(value: &T, now_ms: u64) -> Result<Self, KvError> {
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: None,
        })?;
        Self::new(data, now_ms)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, KvError> {
        serde_json::from_slice(&self.data).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: None,
        })
    }

    pub fn increment_version(&mut self, now_ms: u64) {
        self.version = self.version.saturating_add(1);
        self.updated_at = now_ms;
    }

    pub fn update_data(&mut self, data: Vec<u8>, now_ms: u64) -> Result<(), KvError> {
        check_value_size(&data)?;
        self.data.zeroize();
        self.data = data;
        self.increment_version(now_ms);
        Ok(())
    }
}

impl Drop for KvValue {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

fn check_value_size(data: &[u8]) -> Result<(), KvError> {
    if data.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: data.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvOperation {
    Get {
        key: KvKey,
    },
    Set {
        key: KvKey,
        value: Vec<u8>,
        if_version: Option<u64>,
    },
    Delete {
        key: KvKey,
        if_version: Option<u64>,
    },
    Exists {
        key: KvKey,
    },
}

impl KvOperation {
    pub fn get(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        Ok(Self::Get {
            key: KvKey::new(namespace, key)?,
        })
    }

    pub fn set(
        namespace: KeyNamespace,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<Self, KvError> {
        check_value_size(&value)?;
        Ok(Self::Set {
            key: KvKey::new(namespace, key)?,
            value,
            if_version: None,
        })
    }

    pub fn set_if_version(
        namespace: KeyNamespace,
        key: impl Into<String>,
        value: Vec<u8>,
        expected_version: u64,
    ) -> Result<Self, KvError> {
        check_value_size(&value)?;
        Ok(Self::Set {
            key: KvKey::new(namespace, key)?,
            value,
            if_version: Some(expected_version),
        })
    }

    pub fn delete(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        Ok(Self::Delete {
            key: KvKey::new(namespace, key)?,
            if_version: None,
        })
    }

    pub fn exists(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        Ok(Self::Exists {
            key: KvKey::new(namespace, key)?,
        })
    }

    pub fn key(&self) -> &KvKey {
        match self {
            KvOperation::Get { key }
            | KvOperation::Set { key, .. }
            | KvOperation::Delete { key, .. }
            | KvOperation::Exists { key } => key,
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },

    #[error("operation timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            KvError::Timeout { .. } | KvError::VersionMismatch { .. } => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound { .. })
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }

    fn unexpected_output(output: &KvOutput) -> Self {
        Self::storage(
            StorageErrorCode::Unknown,
            format!("unexpected output type: {output:?}"),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    ConnectionLost,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed
                | StorageErrorCode::ConnectionLost
                | StorageErrorCode::Busy
                | StorageErrorCode::Locked
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvOutput {
    Value(Option<KvValue>),
    Written { version: u64 },
    Deleted { existed: bool },
    Exists(bool),
}

pub type KvResult = Result<KvOutput, KvError>;

/// Durable key-value storage. Each operation is applied atomically.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn execute(&self, operation: KvOperation) -> KvResult;

    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError> {
        match self.execute(KvOperation::Get { key: key.clone() }).await? {
            KvOutput::Value(value) => Ok(value),
            other => Err(KvError::unexpected_output(&other)),
        }
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<u64, KvError> {
        check_value_size(&value)?;
        let operation = KvOperation::Set {
            key: key.clone(),
            value,
            if_version: None,
        };
        match self.execute(operation).await? {
            KvOutput::Written { version } => Ok(version),
            other => Err(KvError::unexpected_output(&other)),
        }
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let operation = KvOperation::Delete {
            key: key.clone(),
            if_version: None,
        };
        match self.execute(operation).await? {
            KvOutput::Deleted { existed } => Ok(existed),
            other => Err(KvError::unexpected_output(&other)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, KvValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn execute(&self, operation: KvOperation) -> KvResult {
        let now = get_current_time_ms();
        match operation {
            KvOperation::Get { key } => {
                let entries = self.entries.read().await;
                Ok(KvOutput::Value(entries.get(&key.raw()).cloned()))
            }
            KvOperation::Exists { key } => {
                let entries = self.entries.read().await;
                Ok(KvOutput::Exists(entries.contains_key(&key.raw())))
            }
            KvOperation::Set {
                key,
                value,
                if_version,
            } => {
                let mut entries = self.entries.write().await;
                let raw = key.raw();
                let current = entries.get(&raw).map_or(0, KvValue::version);
                if let Some(expected) = if_version {
                    if expected != current {
                        return Err(KvError::VersionMismatch {
                            expected,
                            found: current,
                        });
                    }
                }

                let version = match entries.get_mut(&raw) {
                    Some(existing) => {
                        existing.update_data(value, now)?;
                        existing.version()
                    }
                    None => {
                        let fresh = KvValue::new(value, now)?;
                        let version = fresh.version();
                        entries.insert(raw, fresh);
                        version
                    }
                };
                Ok(KvOutput::Written { version })
            }
            KvOperation::Delete { key, if_version } => {
                let mut entries = self.entries.write().await;
                let raw = key.raw();
                if let Some(expected) = if_version {
                    let current = entries.get(&raw).map_or(0, KvValue::version);
                    if expected != current {
                        return Err(KvError::VersionMismatch {
                            expected,
                            found: current,
                        });
                    }
                }
                Ok(KvOutput::Deleted {
                    existed: entries.remove(&raw).is_some(),
                })
            }
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use std::path::Path;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
    use tracing::{debug, instrument};

    use super::{
        KeyValueStore, KvError, KvOperation, KvOutput, KvResult, KvValue, StorageErrorCode,
    };
    use crate::get_current_time_ms;

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS kv_entries (
            key TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
    ";

    /// SQLite-backed store. Writes run inside a transaction, so a crash never leaves a torn value.
    ///
    /// Every statement runs on the blocking pool; the async executor never waits on disk.
    pub struct SqliteKvStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl std::fmt::Debug for SqliteKvStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqliteKvStore").finish_non_exhaustive()
        }
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(storage_error)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(storage_error)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.busy_timeout(Duration::from_secs(5))
                .map_err(storage_error)?;
            conn.execute_batch(SCHEMA).map_err(storage_error)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        fn current_version(
            conn: &Connection,
            raw: &str,
        ) -> Result<Option<u64>, rusqlite::Error> {
            conn.query_row(
                "SELECT version FROM kv_entries WHERE key = ?1",
                params![raw],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|version| version.map(from_sql_int))
        }
    }

    #[async_trait::async_trait]
    impl KeyValueStore for SqliteKvStore {
        #[instrument(skip(self, operation), fields(key = %operation.key().raw()))]
        async fn execute(&self, operation: KvOperation) -> KvResult {
            let now = get_current_time_ms();
            let conn = Arc::clone(&self.conn);

            tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                SqliteKvStore::apply(&mut conn, operation, now)
            })
            .await
            .map_err(|e| {
                KvError::storage(
                    StorageErrorCode::Unknown,
                    format!("storage task failed: {e}"),
                )
            })?
        }
    }

    impl SqliteKvStore {
        fn apply(conn: &mut Connection, operation: KvOperation, now: u64) -> KvResult {
            match operation {
                KvOperation::Get { key } => {
                    let value = conn
                        .query_row(
                            "SELECT data, version, created_at, updated_at FROM kv_entries WHERE key = ?1",
                            params![key.raw()],
                            |row| {
                                Ok(KvValue {
                                    data: row.get(0)?,
                                    version: from_sql_int(row.get(1)?),
                                    created_at: from_sql_int(row.get(2)?),
                                    updated_at: from_sql_int(row.get(3)?),
                                })
                            },
                        )
                        .optional()
                        .map_err(storage_error)?;
                    Ok(KvOutput::Value(value))
                }
                KvOperation::Exists { key } => {
                    let version =
                        Self::current_version(conn, &key.raw()).map_err(storage_error)?;
                    Ok(KvOutput::Exists(version.is_some()))
                }
                KvOperation::Set {
                    key,
                    value,
                    if_version,
                } => {
                    let raw = key.raw();
                    let tx = conn.transaction().map_err(storage_error)?;
                    let current = Self::current_version(&tx, &raw).map_err(storage_error)?;

                    if let Some(expected) = if_version {
                        let found = current.unwrap_or(0);
                        if expected != found {
                            return Err(KvError::VersionMismatch { expected, found });
                        }
                    }

                    let version = current.map_or(1, |v| v.saturating_add(1));
                    tx.execute(
                        "INSERT INTO kv_entries (key, data, version, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?4)
                         ON CONFLICT(key) DO UPDATE SET
                             data = excluded.data,
                             version = excluded.version,
                             updated_at = excluded.updated_at",
                        params![raw, value, to_sql_int(version), to_sql_int(now)],
                    )
                    .map_err(storage_error)?;
                    tx.commit().map_err(storage_error)?;

                    debug!(version, "value written");
                    Ok(KvOutput::Written { version })
                }
                KvOperation::Delete { key, if_version } => {
                    let raw = key.raw();
                    let tx = conn.transaction().map_err(storage_error)?;

                    if let Some(expected) = if_version {
                        let found = Self::current_version(&tx, &raw)
                            .map_err(storage_error)?
                            .unwrap_or(0);
                        if expected != found {
                            return Err(KvError::VersionMismatch { expected, found });
                        }
                    }

                    let removed = tx
                        .execute("DELETE FROM kv_entries WHERE key = ?1", params![raw])
                        .map_err(storage_error)?;
                    tx.commit().map_err(storage_error)?;

                    Ok(KvOutput::Deleted {
                        existed: removed > 0,
                    })
                }
            }
        }
    }

    fn to_sql_int(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    fn from_sql_int(value: i64) -> u64 {
        u64::try_from(value).unwrap_or(0)
    }

    fn storage_error(error: rusqlite::Error) -> KvError {
        let code = match &error {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                ErrorCode::SystemIoFailure => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, error.to_string())
    }
}

/// JSON view over one namespace of a store.
pub struct TypedKvStore<T> {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedKvStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedKvStore<T> {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: KeyNamespace) -> Self {
        Self {
            store,
            namespace,
            _phantom: PhantomData,
        }
    }

    pub fn key(&self, key: &str) -> Result<KvKey, KvError> {
        KvKey::new(self.namespace.clone(), key)
    }

    /// `Err(KvError::Serialization)` means the stored bytes are not a `T`.
    pub async fn load(&self, key: &str) -> Result<Option<T>, KvError> {
        let key = self.key(key)?;
        match self.store.get(&key).await? {
            Some(value) => value.deserialize().map(Some).map_err(|e| match e {
                KvError::Serialization { message, .. } => KvError::Serialization {
                    message,
                    key: Some(key.raw()),
                },
                other => other,
            }),
            None => Ok(None),
        }
    }

    pub async fn save(&self, key: &str, value: &T) -> Result<u64, KvError> {
        let key = self.key(key)?;
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.raw()),
        })?;
        self.store.set(&key, data).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, KvError> {
        let key = self.key(key)?;
        self.store.delete(&key).await
    }
}
