//! # Redis Document Store
//!
//! Registry records shared by every gateway node. Each record is a JSON
//! envelope `{"version": <rev>, "source": {...}}` stored under
//! `{prefix}{type}:{id}`. Revisions come from one `INCR` counter, and a set
//! per type tracks ids so delete-by-query can scan a single type.

use crate::registry::store::{DocumentStore, DocumentType, FieldFilter, StoreResult, StoredDocument};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde_json::Value;
use tracing::{debug, info};

/// Redis store implementation
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (reconnects on its own)
    connection: ConnectionManager,

    /// Key prefix for all registry records
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(url: &str, key_prefix: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!("Redis registry store connected to {}", url);

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn document_key(&self, doc_type: DocumentType, id: &str) -> String {
        format!("{}{}:{}", self.key_prefix, doc_type, id)
    }

    fn ids_key(&self, doc_type: DocumentType) -> String {
        format!("{}{}:_ids", self.key_prefix, doc_type)
    }

    fn revision_key(&self) -> String {
        format!("{}_revision", self.key_prefix)
    }

    async fn next_revision(&self, conn: &mut ConnectionManager) -> StoreResult<u64> {
        let revision: u64 = conn.incr(self.revision_key(), 1u64).await?;
        Ok(revision)
    }
}

fn encode(version: u64, source: Value) -> StoreResult<String> {
    Ok(serde_json::to_string(&StoredDocument { version, source })?)
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn get(&self, doc_type: DocumentType, id: &str) -> StoreResult<Option<StoredDocument>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.document_key(doc_type, id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, doc_type: DocumentType, id: &str, source: Value) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let revision = self.next_revision(&mut conn).await?;
        let payload = encode(revision, source)?;

        let created: bool = conn.set_nx(self.document_key(doc_type, id), payload).await?;
        if created {
            let _: () = conn.sadd(self.ids_key(doc_type), id).await?;
        }
        Ok(created)
    }

    async fn put(&self, doc_type: DocumentType, id: &str, source: Value) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        let revision = self.next_revision(&mut conn).await?;
        let payload = encode(revision, source)?;

        let _: () = conn.set(self.document_key(doc_type, id), payload).await?;
        let _: () = conn.sadd(self.ids_key(doc_type), id).await?;
        Ok(revision)
    }

    async fn delete(&self, doc_type: DocumentType, id: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let removed: u64 = conn.del(self.document_key(doc_type, id)).await?;
        let _: () = conn.srem(self.ids_key(doc_type), id).await?;
        Ok(removed > 0)
    }

    async fn delete_by_query(&self, doc_type: DocumentType, filters: &[FieldFilter]) -> StoreResult<usize> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(self.ids_key(doc_type)).await?;

        let mut removed = 0;
        for id in ids {
            let key = self.document_key(doc_type, &id);
            let raw: Option<String> = conn.get(&key).await?;
            let Some(raw) = raw else {
                let _: () = conn.srem(self.ids_key(doc_type), &id).await?;
                continue;
            };

            let document: StoredDocument = serde_json::from_str(&raw)?;
            if filters.iter().all(|filter| filter.matches(&document.source)) {
                let deleted: u64 = conn.del(&key).await?;
                let _: () = conn.srem(self.ids_key(doc_type), &id).await?;
                removed += deleted as usize;
            }
        }

        debug!(doc_type = %doc_type, removed, "Redis delete-by-query completed");
        Ok(removed)
    }
}
