use async_trait::async_trait;
use crux_kv::KeyValue;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 128;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Namespaced storage key. The raw form is `<namespace>:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    name: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, name: impl Into<String>) -> Result<Self, KvError> {
        let name = name.into();
        let reason = if name.trim().is_empty() {
            Some("empty")
        } else if name.len() > MAX_KEY_LENGTH {
            Some("too long")
        } else if name.contains(':') || name.chars().any(char::is_control) {
            Some("contains a separator or control character")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(KvError::InvalidKey {
                key: name.escape_default().take(64).collect(),
                reason: reason.to_string(),
            }),
            None => Ok(Self { namespace, name }),
        }
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.name)
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    /// Tokens and the cached user.
    Session,
    /// Shell-owned preferences that survive sign-out.
    Settings,
}

impl KeyNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            KeyNamespace::Session => "session",
            KeyNamespace::Settings => "settings",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error ({code:?}): {message}")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },

    #[error("could not decode '{key}': {message}")]
    Serialization { key: String, message: String },
}

impl KvError {
    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }
}

/// Coarse failure class reported by the shell's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Locked,
}

/// Persistent key-value storage provided by the shell
/// (Keychain/Keystore, `SharedPreferences`, `localStorage`, ...).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
}

/// In-process store for shells without persistence, and for tests.
#[derive(Debug, Default)]
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

    pub async fn contains(&self, key: &KvKey) -> bool {
        self.entries.read().await.contains_key(&key.raw())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.entries.write().await.remove(&key.raw()).is_some())
    }
}

/// [`KeyValueStore`] over the shell's `crux_kv` capability.
pub struct ShellKvStore<Ev> {
    kv: KeyValue<Ev>,
}

impl<Ev> ShellKvStore<Ev> {
    pub fn new(kv: KeyValue<Ev>) -> Self {
        Self { kv }
    }
}

fn shell_error(err: impl std::fmt::Display) -> KvError {
    KvError::storage(StorageErrorCode::Unknown, err.to_string())
}

#[async_trait]
impl<Ev> KeyValueStore for ShellKvStore<Ev>
where
    Ev: Send + 'static,
{
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        self.kv.get_async(key.raw()).await.map_err(shell_error)
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.kv
            .set_async(key.raw(), value)
            .await
            .map(|_previous| ())
            .map_err(shell_error)
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        self.kv
            .delete_async(key.raw())
            .await
            .map(|previous| previous.is_some())
            .map_err(shell_error)
    }
}

/// JSON-encoded values of one type under one namespace.
#[derive(Debug)]
pub struct TypedKvStore<T> {
    namespace: KeyNamespace,
    _value: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> TypedKvStore<T> {
    pub fn new(namespace: KeyNamespace) -> Self {
        Self {
            namespace,
            _value: PhantomData,
        }
    }

    pub fn key(&self, name: &str) -> Result<KvKey, KvError> {
        KvKey::new(self.namespace, name)
    }

    pub async fn load(&self, store: &dyn KeyValueStore, name: &str) -> Result<Option<T>, KvError> {
        let key = self.key(name)?;
        let Some(bytes) = store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| KvError::Serialization {
                key: key.raw(),
                message: e.to_string(),
            })
    }

    pub async fn save(&self, store: &dyn KeyValueStore, name: &str, value: &T) -> Result<(), KvError> {
        let key = self.key(name)?;
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            key: key.raw(),
            message: e.to_string(),
        })?;
        store.set(&key, data).await
    }

    pub async fn remove(&self, store: &dyn KeyValueStore, name: &str) -> Result<bool, KvError> {
        store.delete(&self.key(name)?).await
    }
}
