//! In-memory document store.
//!
//! Deterministic, process-local implementation of `DocumentStore` used by
//! tests and by the demo binary. Conditional updates hold the collection
//! write lock while evaluating conditions, which gives the per-document
//! atomicity the claim protocol needs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{compare_documents, Document, DocumentStore, Filter, OrderBy, StoreFuture};
use crate::error::CoreError;

type Collection = BTreeMap<String, Document>;

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    /// `insert` calls.
    pub inserts: u64,
    /// `batch_insert` calls.
    pub batch_inserts: u64,
    /// `conditional_update` calls.
    pub updates: u64,
    /// `query` calls.
    pub queries: u64,
    /// `batch_delete` calls.
    pub deletes: u64,
}

impl OperationCounts {
    /// Number of calls that write to the store.
    pub fn writes(&self) -> u64 {
        self.inserts + self.batch_inserts + self.updates + self.deletes
    }
}

/// Process-local `DocumentStore`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
    inserts: AtomicU64,
    batch_inserts: AtomicU64,
    updates: AtomicU64,
    queries: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches a document by id.
    pub async fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections.read().await.get(collection).and_then(|c| c.get(id)).cloned()
    }

    /// Number of documents in a collection.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections.read().await.get(collection).map_or(0, BTreeMap::len)
    }

    /// Overwrites a document unconditionally.
    ///
    /// Test-only escape hatch for arranging states the engine would not
    /// produce on its own, such as a job left active by a crashed worker.
    pub async fn put(&self, collection: &str, id: &str, document: Document) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
    }

    /// Snapshot of operation counters.
    pub fn operation_counts(&self) -> OperationCounts {
        OperationCounts {
            inserts: self.inserts.load(Ordering::Relaxed),
            batch_inserts: self.batch_inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

fn assign_id(document: &mut Document) -> Result<String, CoreError> {
    match document.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            let id = Uuid::new_v4().to_string();
            document.insert("id".to_string(), Value::String(id.clone()));
            Ok(id)
        },
        Some(other) => Err(CoreError::InvalidInput(format!("document id must be a string, got {other}"))),
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn insert(&self, collection: &str, mut document: Document) -> StoreFuture<'_, String> {
        let collection = collection.to_string();
        self.inserts.fetch_add(1, Ordering::Relaxed);

        Box::pin(async move {
            let id = assign_id(&mut document)?;
            let mut collections = self.collections.write().await;
            let docs = collections.entry(collection.clone()).or_default();

            if docs.contains_key(&id) {
                debug!(collection = %collection, id = %id, "duplicate document id rejected");
                return Err(CoreError::ConstraintViolation(format!(
                    "document {collection}/{id} already exists"
                )));
            }
            docs.insert(id.clone(), document);
            Ok(id)
        })
    }

    fn batch_insert(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreFuture<'_, Vec<String>> {
        let collection = collection.to_string();
        self.batch_inserts.fetch_add(1, Ordering::Relaxed);

        Box::pin(async move {
            let mut prepared = Vec::with_capacity(documents.len());
            for mut document in documents {
                let id = assign_id(&mut document)?;
                prepared.push((id, document));
            }

            let mut collections = self.collections.write().await;
            let docs = collections.entry(collection.clone()).or_default();

            if let Some((id, _)) = prepared.iter().find(|(id, _)| docs.contains_key(id)) {
                debug!(collection = %collection, id = %id, "batch rejected on duplicate id");
                return Err(CoreError::ConstraintViolation(format!(
                    "document {collection}/{id} already exists"
                )));
            }

            let ids = prepared.iter().map(|(id, _)| id.clone()).collect();
            docs.extend(prepared);
            Ok(ids)
        })
    }

    fn conditional_update(
        &self,
        collection: &str,
        id: &str,
        conditions: Vec<Filter>,
        fields: Document,
    ) -> StoreFuture<'_, bool> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.updates.fetch_add(1, Ordering::Relaxed);

        Box::pin(async move {
            let mut collections = self.collections.write().await;
            let Some(document) = collections.get_mut(&collection).and_then(|c| c.get_mut(&id))
            else {
                trace!(collection = %collection, id = %id, "conditional update on missing document");
                return Ok(false);
            };

            if !conditions.iter().all(|condition| condition.matches(document)) {
                trace!(collection = %collection, id = %id, "conditional update not applied");
                return Ok(false);
            }

            document.extend(fields);
            Ok(true)
        })
    }

    fn query(
        &self,
        collection: &str,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<Document>> {
        let collection = collection.to_string();
        self.queries.fetch_add(1, Ordering::Relaxed);

        Box::pin(async move {
            let collections = self.collections.read().await;
            let Some(docs) = collections.get(&collection) else {
                return Ok(Vec::new());
            };

            let mut matched: Vec<Document> = docs
                .values()
                .filter(|document| filters.iter().all(|filter| filter.matches(document)))
                .cloned()
                .collect();
            drop(collections);

            if !order_by.is_empty() {
                matched.sort_by(|a, b| compare_documents(a, b, &order_by));
            }
            if let Some(limit) = limit {
                matched.truncate(limit);
            }
            Ok(matched)
        })
    }

    fn batch_delete(&self, collection: &str, ids: Vec<String>) -> StoreFuture<'_, usize> {
        let collection = collection.to_string();
        self.deletes.fetch_add(1, Ordering::Relaxed);

        Box::pin(async move {
            let mut collections = self.collections.write().await;
            let Some(docs) = collections.get_mut(&collection) else {
                return Ok(0);
            };
            Ok(ids.iter().filter(|id| docs.remove(id.as_str()).is_some()).count())
        })
    }
}
