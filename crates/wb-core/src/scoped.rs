use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Key-value persistence bound to one opaque scope key. The session engine
/// never builds scope keys itself; callers hand it an already-scoped handle.
pub trait ScopedStorage: Send + Sync {
    fn scope(&self) -> &str;

    fn get_value(&self) -> Result<Option<Value>, StorageError>;

    fn set_value(&self, value: &Value) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;
}

pub trait ScopedStorageExt: ScopedStorage {
    fn get<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        match self.get_value()? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StorageError::Serialization(err.to_string())),
            None => Ok(None),
        }
    }

    fn set<T: Serialize>(&self, value: &T) -> Result<(), StorageError> {
        let value =
            serde_json::to_value(value).map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.set_value(&value)
    }
}

impl<S: ScopedStorage + ?Sized> ScopedStorageExt for S {}
