use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::CacheError;

/// Byte encoding for values of type `T` stored in an [`FsCache`](super::FsCache).
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, CacheError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T, CacheError>;
    fn content_type(&self) -> &'static str;
}

/// JSON encoding for any serde type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// Identity encoding: the stored bytes are the string's UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> Result<Vec<u8>, CacheError> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, CacheError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "text/plain"
    }
}
