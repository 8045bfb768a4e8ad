//! # Document Store Boundary
//!
//! The registry persists everything through a small document-oriented
//! interface: records are addressed by a type tag plus a composite string id
//! and carry a store-assigned revision. Nothing above this trait knows which
//! technology sits underneath.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::core::error::GatewayError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the call
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// A stored record could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::store(err.to_string())
    }
}

/// Record type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentType {
    Service,
    Application,
    ServiceContract,
    DataVersion,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Service => "service",
            DocumentType::Application => "application",
            DocumentType::ServiceContract => "serviceContract",
            DocumentType::DataVersion => "dataVersion",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Store-assigned revision, strictly increasing across writes
    pub version: u64,
    pub source: Value,
}

/// Equality filter on a field addressed by JSON pointer (e.g. `/application/organizationId`)
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub pointer: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn new<P: Into<String>, V: Into<Value>>(pointer: P, value: V) -> Self {
        Self {
            pointer: pointer.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, source: &Value) -> bool {
        source.pointer(&self.pointer) == Some(&self.value)
    }
}

/// Durable store consumed by the registry
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a record by id
    async fn get(&self, doc_type: DocumentType, id: &str) -> StoreResult<Option<StoredDocument>>;

    /// Create-only write. Returns `false` without touching the existing
    /// record when the id is already taken.
    async fn create(&self, doc_type: DocumentType, id: &str, source: Value) -> StoreResult<bool>;

    /// Create or replace a record, returning its new revision
    async fn put(&self, doc_type: DocumentType, id: &str, source: Value) -> StoreResult<u64>;

    /// Delete by id. Returns `false` when nothing was there.
    async fn delete(&self, doc_type: DocumentType, id: &str) -> StoreResult<bool>;

    /// Delete every record of a type matching all filters, returning how many were removed
    async fn delete_by_query(&self, doc_type: DocumentType, filters: &[FieldFilter]) -> StoreResult<usize>;
}
