//! # In-Memory Document Store
//!
//! Process-local store backed by a `DashMap`. Several registry instances can
//! share one `Arc<InMemoryStore>` to behave like gateway nodes in front of a
//! common durable store.

use crate::registry::store::{DocumentStore, DocumentType, FieldFilter, StoreError, StoreResult, StoredDocument};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// In-memory store implementation
#[derive(Debug)]
pub struct InMemoryStore {
    /// Records keyed by (type, id)
    documents: DashMap<(DocumentType, String), StoredDocument>,

    /// Last revision handed out
    revision: AtomicU64,

    /// When false every call fails with `StoreError::Unavailable`
    available: AtomicBool,

    /// Number of calls received, including failed ones
    operations: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            revision: AtomicU64::new(0),
            available: AtomicBool::new(true),
            operations: AtomicUsize::new(0),
        }
    }

    /// Simulate the backend going away (or coming back)
    pub fn set_available(&self, available: bool) {
        debug!(available, "In-memory store availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of store calls made so far
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// Number of records of a given type
    pub fn count(&self, doc_type: DocumentType) -> usize {
        self.documents.iter().filter(|entry| entry.key().0 == doc_type).count()
    }

    fn begin(&self) -> StoreResult<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                message: "in-memory store marked unavailable".to_string(),
            })
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, doc_type: DocumentType, id: &str) -> StoreResult<Option<StoredDocument>> {
        self.begin()?;
        Ok(self
            .documents
            .get(&(doc_type, id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn create(&self, doc_type: DocumentType, id: &str, source: Value) -> StoreResult<bool> {
        self.begin()?;
        match self.documents.entry((doc_type, id.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                let version = self.next_revision();
                vacant.insert(StoredDocument { version, source });
                Ok(true)
            }
        }
    }

    async fn put(&self, doc_type: DocumentType, id: &str, source: Value) -> StoreResult<u64> {
        self.begin()?;
        let version = self.next_revision();
        self.documents
            .insert((doc_type, id.to_string()), StoredDocument { version, source });
        Ok(version)
    }

    async fn delete(&self, doc_type: DocumentType, id: &str) -> StoreResult<bool> {
        self.begin()?;
        Ok(self.documents.remove(&(doc_type, id.to_string())).is_some())
    }

    async fn delete_by_query(&self, doc_type: DocumentType, filters: &[FieldFilter]) -> StoreResult<usize> {
        self.begin()?;
        let mut removed = 0;
        self.documents.retain(|(kind, _), document| {
            let matched = *kind == doc_type && filters.iter().all(|filter| filter.matches(&document.source));
            if matched {
                removed += 1;
            }
            !matched
        });
        Ok(removed)
    }
}
