use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;
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
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_debug().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        if key.contains(':') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain the namespace separator".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Session,
    Settings,
    Cache,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Session => "session",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Cache => "cache",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace must be 1..={} bytes",
                    MAX_PREFIX_LENGTH
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

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("value under '{key}' is not valid UTF-8")]
    Encoding { key: String },
}

impl KvError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Durable key-value storage supplied by the shell (localStorage on the web,
/// SQLite on device).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> KvResult<bool>;
    /// Removes every key in `namespace`, returning how many were removed.
    async fn clear_namespace(&self, namespace: &KeyNamespace) -> KvResult<usize>;

    async fn get_string(&self, key: &KvKey) -> KvResult<Option<String>> {
        match self.get(key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| KvError::Encoding { key: key.raw() }),
            None => Ok(None),
        }
    }
}

fn check_value_size(value: &[u8]) -> KvResult<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
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

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
        check_value_size(&value)?;
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> KvResult<bool> {
        Ok(self.entries.write().await.remove(&key.raw()).is_some())
    }

    async fn clear_namespace(&self, namespace: &KeyNamespace) -> KvResult<usize> {
        let prefix = format!("{}:", namespace.prefix());
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(&prefix));
        Ok(before - entries.len())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    /// SQLite-backed store. Statements are short, so the connection lives
    /// behind a plain mutex that is never held across an await.
    pub struct SqliteKvStore {
        conn: Mutex<Connection>,
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
            let conn = Connection::open(path).map_err(|e| KvError::storage(e.to_string()))?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> KvResult<Self> {
            let conn = Connection::open_in_memory().map_err(|e| KvError::storage(e.to_string()))?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> KvResult<Self> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    namespace TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value BLOB NOT NULL,
                    PRIMARY KEY (namespace, key)
                );
                "#,
            )
            .map_err(|e| KvError::storage(e.to_string()))?;

            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> KvResult<T> {
            let conn = self.conn.lock().map_err(|_| KvError::Storage {
                message: "connection lock poisoned".to_string(),
                retryable: false,
            })?;
            f(&*conn).map_err(|e| {
                let retryable = matches!(
                    e.sqlite_error_code(),
                    Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
                );
                KvError::Storage {
                    message: e.to_string(),
                    retryable,
                }
            })
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    params![key.namespace().prefix(), key.key()],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
            })
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
            check_value_size(&value)?;
            self.with_conn(|conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv_entries (namespace, key, value) VALUES (?1, ?2, ?3)
                    ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value
                    "#,
                    params![key.namespace().prefix(), key.key(), value],
                )
            })?;
            Ok(())
        }

        async fn delete(&self, key: &KvKey) -> KvResult<bool> {
            let removed = self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    params![key.namespace().prefix(), key.key()],
                )
            })?;
            Ok(removed > 0)
        }

        async fn clear_namespace(&self, namespace: &KeyNamespace) -> KvResult<usize> {
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM kv_entries WHERE namespace = ?1",
                    params![namespace.prefix()],
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_key(key: &str) -> KvKey {
        KvKey::new(KeyNamespace::Session, key).unwrap()
    }

    #[test]
    fn test_key_validation() {
        assert!(KvKey::new(KeyNamespace::Cache, "").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "   ").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "key\0value").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "key\x01value").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "a:b").is_err());
        assert!(KvKey::new(KeyNamespace::Cache, "a".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(KvKey::new(KeyNamespace::Session, "accessToken").is_ok());
    }

    #[test]
    fn test_key_namespace_prefix() {
        assert_eq!(session_key("accessToken").raw(), "session:accessToken");
    }

    #[test]
    fn test_custom_namespace() {
        assert_eq!(KeyNamespace::custom("myapp").unwrap().prefix(), "myapp");
        assert!(KeyNamespace::custom("").is_err());
        assert!(KeyNamespace::custom("invalid namespace!").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip_and_delete() {
        let store = MemoryKvStore::new();
        let key = session_key("accessToken");

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, b"at-1".to_vec()).await.unwrap();
        assert_eq!(store.get_string(&key).await.unwrap().as_deref(), Some("at-1"));
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_clear_namespace_is_scoped() {
        let store = MemoryKvStore::new();
        store.set(&session_key("accessToken"), b"a".to_vec()).await.unwrap();
        store.set(&session_key("refreshToken"), b"r".to_vec()).await.unwrap();
        let settings = KvKey::new(KeyNamespace::Settings, "radius").unwrap();
        store.set(&settings, b"500".to_vec()).await.unwrap();

        let removed = store.clear_namespace(&KeyNamespace::Session).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len().await, 1);
        assert!(store.get(&settings).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_value_size_limit() {
        let store = MemoryKvStore::new();
        let result = store
            .set(&session_key("big"), vec![0u8; MAX_VALUE_SIZE + 1])
            .await;
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_non_utf8_value_reports_encoding_error() {
        let store = MemoryKvStore::new();
        let key = session_key("accessToken");
        store.set(&key, vec![0xff, 0xfe]).await.unwrap();
        assert!(matches!(
            store.get_string(&key).await,
            Err(KvError::Encoding { .. })
        ));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.db");
        let key = session_key("refreshToken");

        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.set(&key, b"rt-1".to_vec()).await.unwrap();
            store.set(&key, b"rt-2".to_vec()).await.unwrap();
        }

        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(store.get_string(&key).await.unwrap().as_deref(), Some("rt-2"));
        assert_eq!(store.clear_namespace(&KeyNamespace::Session).await.unwrap(), 1);
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_sqlite_store_delete() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let key = session_key("accessToken");
        store.set(&key, b"at".to_vec()).await.unwrap();
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
    }
}
