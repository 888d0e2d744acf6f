use anyhow::anyhow;
use thiserror::Error as ThisError;

use crate::model::{Document, FindOptions, Predicate, UpdateCommand};

#[derive(Debug, ThisError)]
pub enum StoreError {
    /// A write collided with a unique index.
    #[error("duplicate key in collection '{collection}' on index ({index})")]
    DuplicateKey { collection: String, index: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn backend(message: impl std::fmt::Display) -> Self {
        StoreError::Backend(anyhow!("{}", message))
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }
}

/// Physical document storage. Collections are created on first write.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Declare a unique index; documents missing every indexed field are exempt.
    async fn ensure_unique_index(&self, collection: &str, fields: &[String]) -> StoreResult<()>;

    /// Insert a document, assigning `_id` when absent.
    async fn insert(&self, collection: &str, document: Document) -> StoreResult<Document>;

    async fn find(
        &self,
        collection: &str,
        predicate: &Predicate,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>>;

    async fn count(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64>;

    /// Update the first match and return it as it is after the update.
    async fn find_one_and_update(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
    ) -> StoreResult<Option<Document>>;

    /// Update every match, returning how many documents were modified.
    async fn update_many(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
    ) -> StoreResult<u64>;

    async fn delete_many(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64>;

    async fn find_one(&self, collection: &str, predicate: &Predicate) -> StoreResult<Option<Document>> {
        let mut found = self.find(collection, predicate, &FindOptions::limit(1)).await?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }
}
