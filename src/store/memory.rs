use super::{DocumentBackend, Result, Selector, StorageError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process document backend with couchdb-style revisions.
/// Used by the tests and by `DATABASE_URL=memory:` for local runs; nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    docs: Arc<RwLock<HashMap<String, StoredDoc>>>,
}

struct StoredDoc {
    generation: u64,
    rev: String,
    body: Value,
}

impl StoredDoc {
    fn new(generation: u64, body: Value) -> Self {
        Self {
            generation,
            rev: format!("{}-{}", generation, Uuid::new_v4().simple()),
            body,
        }
    }

    fn with_meta(&self, id: &str) -> Value {
        let mut doc = self.body.clone();
        if let Some(fields) = doc.as_object_mut() {
            fields.insert("_id".to_string(), json!(id));
            fields.insert("_rev".to_string(), json!(self.rev));
        }
        doc
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn strip_meta(mut doc: Value) -> Value {
    if let Some(fields) = doc.as_object_mut() {
        fields.remove("_id");
        fields.remove("_rev");
    }
    doc
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn get(&self, id: &str) -> Result<Option<Value>> {
        let docs = self.docs.read().await;
        Ok(docs.get(id).map(|stored| stored.with_meta(id)))
    }

    async fn insert(&self, id: &str, doc: Value) -> Result<()> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(id) {
            return Err(StorageError::Conflict(format!("document {} already exists", id)));
        }
        docs.insert(id.to_string(), StoredDoc::new(1, strip_meta(doc)));
        Ok(())
    }

    async fn update(&self, id: &str, rev: &str, doc: Value) -> Result<bool> {
        let mut docs = self.docs.write().await;
        match docs.get_mut(id) {
            Some(stored) if stored.rev == rev => {
                *stored = StoredDoc::new(stored.generation + 1, strip_meta(doc));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &str, rev: &str) -> Result<bool> {
        let mut docs = self.docs.write().await;
        match docs.get(id) {
            Some(stored) if stored.rev == rev => {
                docs.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find(&self, selector: &Selector) -> Result<Vec<Value>> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|(_, stored)| selector.matches(&stored.body))
            .map(|(id, stored)| stored.with_meta(id))
            .collect())
    }
}

/// Hands control back to the scheduler before every call, so joined futures
/// interleave their reads and writes. Counts `access:` inserts.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct InterleavingBackend {
    inner: MemoryBackend,
    access_inserts: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl InterleavingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    pub fn access_inserts(&self) -> usize {
        self.access_inserts
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl DocumentBackend for InterleavingBackend {
    async fn get(&self, id: &str) -> Result<Option<Value>> {
        tokio::task::yield_now().await;
        self.inner.get(id).await
    }

    async fn insert(&self, id: &str, doc: Value) -> Result<()> {
        tokio::task::yield_now().await;
        if id.starts_with("access:") {
            self.access_inserts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        self.inner.insert(id, doc).await
    }

    async fn update(&self, id: &str, rev: &str, doc: Value) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.update(id, rev, doc).await
    }

    async fn delete(&self, id: &str, rev: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.delete(id, rev).await
    }

    async fn find(&self, selector: &Selector) -> Result<Vec<Value>> {
        tokio::task::yield_now().await;
        self.inner.find(selector).await
    }
}
