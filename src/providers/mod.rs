//! External collaborator contracts: credentials and binary data
//!
//! The engine only passes opaque identifiers and references across these
//! boundaries. Decryption and payload storage belong to the implementations.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::data::BinaryRef;

/// Decrypted credential fields
pub type CredentialData = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend temporarily unreachable
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get(&self, credential_id: &str) -> Result<CredentialData, ProviderError>;
}

/// Metadata supplied when storing a binary payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryMeta {
    pub mime_type: String,
    pub file_name: Option<String>,
}

#[async_trait]
pub trait BinaryDataProvider: Send + Sync {
    async fn store(&self, data: Bytes, meta: BinaryMeta) -> Result<BinaryRef, ProviderError>;

    async fn fetch(&self, reference: &BinaryRef) -> Result<Bytes, ProviderError>;
}

/// Fixed credential set, keyed by credential id
#[derive(Debug, Default)]
pub struct StaticCredentials {
    credentials: HashMap<String, CredentialData>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.credentials.insert(id.into(), data);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get(&self, credential_id: &str) -> Result<CredentialData, ProviderError> {
        self.credentials
            .get(credential_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("credential '{credential_id}'")))
    }
}

/// Process-local binary store; payloads live until the store is dropped
#[derive(Debug, Default)]
pub struct MemoryBinaryStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBinaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BinaryDataProvider for MemoryBinaryStore {
    async fn store(&self, data: Bytes, meta: BinaryMeta) -> Result<BinaryRef, ProviderError> {
        let id = format!("mem:{}", uuid::Uuid::new_v4());
        let reference = BinaryRef {
            id: id.clone(),
            mime_type: meta.mime_type,
            file_name: meta.file_name,
            size: data.len() as u64,
        };
        self.blobs.write().insert(id, data);
        Ok(reference)
    }

    async fn fetch(&self, reference: &BinaryRef) -> Result<Bytes, ProviderError> {
        self.blobs
            .read()
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("binary '{}'", reference.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn binary_round_trip() {
        let store = MemoryBinaryStore::new();
        let reference = store
            .store(
                Bytes::from_static(b"hello"),
                BinaryMeta {
                    mime_type: "text/plain".into(),
                    file_name: Some("hello.txt".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(reference.size, 5);
        assert_eq!(store.fetch(&reference).await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let creds = StaticCredentials::new().with("pg", json!({"password": "secret"}));
        assert_eq!(creds.get("pg").await.unwrap()["password"], json!("secret"));
        assert!(matches!(creds.get("other").await, Err(ProviderError::NotFound(_))));
    }
}
