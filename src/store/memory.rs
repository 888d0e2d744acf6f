use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{generate_id, get_path, Document, FindOptions, Predicate, UpdateCommand, PHYSICAL_KEY};
use crate::store::matcher::DocumentMatcher;
use crate::store::traits::{DocumentStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Collection {
    /// Documents in insertion order
    documents: Vec<Document>,
    unique_indexes: Vec<Vec<String>>,
}

impl Collection {
    /// Find an index violated by `candidate`, ignoring the document at `skip`.
    fn violated_index(&self, candidate: &Document, skip: Option<usize>) -> Option<String> {
        let physical = vec![PHYSICAL_KEY.to_string()];
        std::iter::once(&physical)
            .chain(self.unique_indexes.iter())
            .find(|fields| {
                let key: Vec<Option<&Value>> = fields.iter().map(|f| get_path(candidate, f)).collect();
                if key.iter().all(|v| v.map_or(true, Value::is_null)) {
                    return false;
                }
                self.documents.iter().enumerate().any(|(position, other)| {
                    Some(position) != skip
                        && fields
                            .iter()
                            .zip(&key)
                            .all(|(field, value)| normalize(get_path(other, field)) == normalize(*value))
                })
            })
            .map(|fields| fields.join(", "))
    }
}

fn normalize(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Document store kept entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<HashMap<String, Collection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held in `collection`, deleted or not.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |c| c.documents.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn update_matching(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
        first_only: bool,
    ) -> StoreResult<Vec<Document>> {
        let mut collections = self.collections.write();
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(Vec::new());
        };

        let positions: Vec<usize> = entry
            .documents
            .iter()
            .enumerate()
            .filter(|(_, doc)| DocumentMatcher::matches(doc, predicate))
            .map(|(position, _)| position)
            .take(if first_only { 1 } else { usize::MAX })
            .collect();

        let mut updated = Vec::with_capacity(positions.len());
        for position in positions {
            let mut document = entry.documents[position].clone();
            DocumentMatcher::apply_update(&mut document, update)?;
            if let Some(index) = entry.violated_index(&document, Some(position)) {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    index,
                });
            }
            entry.documents[position] = document.clone();
            updated.push(document);
        }
        Ok(updated)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_unique_index(&self, collection: &str, fields: &[String]) -> StoreResult<()> {
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        if !entry.unique_indexes.iter().any(|existing| existing == fields) {
            entry.unique_indexes.push(fields.to_vec());
        }
        Ok(())
    }

    async fn insert(&self, collection: &str, mut document: Document) -> StoreResult<Document> {
        if document.get(PHYSICAL_KEY).map_or(true, Value::is_null) {
            document.insert(PHYSICAL_KEY.to_string(), Value::String(generate_id()));
        }
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        if let Some(index) = entry.violated_index(&document, None) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                index,
            });
        }
        entry.documents.push(document.clone());
        Ok(document)
    }

    async fn find(
        &self,
        collection: &str,
        predicate: &Predicate,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let documents = self
            .collections
            .read()
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default();
        Ok(DocumentMatcher::select(documents, predicate, options))
    }

    async fn count(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64> {
        let collections = self.collections.read();
        Ok(collections.get(collection).map_or(0, |c| {
            c.documents
                .iter()
                .filter(|doc| DocumentMatcher::matches(doc, predicate))
                .count() as u64
        }))
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
    ) -> StoreResult<Option<Document>> {
        Ok(self
            .update_matching(collection, predicate, update, true)?
            .into_iter()
            .next())
    }

    async fn update_many(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
    ) -> StoreResult<u64> {
        Ok(self.update_matching(collection, predicate, update, false)?.len() as u64)
    }

    async fn delete_many(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64> {
        let mut collections = self.collections.write();
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = entry.documents.len();
        entry.documents.retain(|doc| !DocumentMatcher::matches(doc, predicate));
        Ok((before - entry.documents.len()) as u64)
    }
}
