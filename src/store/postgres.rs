use anyhow::{Context, Result};
use log::{debug, info};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, Row, Transaction};

use crate::model::{generate_id, Document, FindOptions, Predicate, UpdateCommand, PHYSICAL_KEY};
use crate::store::matcher::DocumentMatcher;
use crate::store::traits::{DocumentStore, StoreError, StoreResult};

const UNIQUE_VIOLATION: &str = "23505";

/// Documents stored as JSONB rows in a single `documents` table.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the documents table if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                body JSONB NOT NULL,
                seq BIGSERIAL,
                PRIMARY KEY (collection, key)
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create documents table")?;
        info!("Documents table ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load(&self, collection: &str) -> StoreResult<Vec<Document>> {
        let rows = sqlx::query("SELECT body FROM documents WHERE collection = $1 ORDER BY seq")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(collection, e))?;
        rows.into_iter().map(|row| decode_body(collection, &row)).collect()
    }

    /// Lock and load every document of a collection inside a transaction.
    async fn load_for_update(
        tx: &mut Transaction<'_, Postgres>,
        collection: &str,
    ) -> StoreResult<Vec<Document>> {
        let rows = sqlx::query("SELECT body FROM documents WHERE collection = $1 ORDER BY seq FOR UPDATE")
            .bind(collection)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| storage_error(collection, e))?;
        rows.into_iter().map(|row| decode_body(collection, &row)).collect()
    }

    async fn update_matching(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
        first_only: bool,
    ) -> StoreResult<Vec<Document>> {
        let mut tx = self.pool.begin().await.map_err(|e| storage_error(collection, e))?;
        let documents = Self::load_for_update(&mut tx, collection).await?;

        let mut updated = Vec::new();
        for mut document in documents
            .into_iter()
            .filter(|doc| DocumentMatcher::matches(doc, predicate))
            .take(if first_only { 1 } else { usize::MAX })
        {
            let key = physical_key(&document)?;
            DocumentMatcher::apply_update(&mut document, update)?;
            sqlx::query("UPDATE documents SET body = $3 WHERE collection = $1 AND key = $2")
                .bind(collection)
                .bind(&key)
                .bind(Json(Value::Object(document.clone())))
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_error(collection, e))?;
            updated.push(document);
        }

        tx.commit().await.map_err(|e| storage_error(collection, e))?;
        debug!("Updated {} document(s) in '{}'", updated.len(), collection);
        Ok(updated)
    }
}

fn decode_body(collection: &str, row: &sqlx::postgres::PgRow) -> StoreResult<Document> {
    let Json(body): Json<Value> = row
        .try_get("body")
        .map_err(|e| storage_error(collection, e))?;
    match body {
        Value::Object(document) => Ok(document),
        other => Err(StoreError::backend(format!(
            "collection '{}' holds a non-object document: {}",
            collection, other
        ))),
    }
}

fn physical_key(document: &Document) -> StoreResult<String> {
    document
        .get(PHYSICAL_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::backend("document is missing its physical key"))
}

fn storage_error(collection: &str, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: db_error.constraint().unwrap_or("primary key").to_string(),
            };
        }
    }
    StoreError::Backend(anyhow::Error::new(error).context(format!("collection '{}'", collection)))
}

/// Identifiers are interpolated into DDL, so only a safe subset is kept.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[async_trait::async_trait]
impl DocumentStore for PostgresStore {
    async fn ensure_unique_index(&self, collection: &str, fields: &[String]) -> StoreResult<()> {
        let paths: Vec<String> = fields
            .iter()
            .map(|field| format!("{{{}}}", field.split('.').map(sanitize).collect::<Vec<_>>().join(",")))
            .collect();
        let expressions = paths
            .iter()
            .map(|path| format!("COALESCE(body #>> '{}', '')", path))
            .collect::<Vec<_>>()
            .join(", ");
        let presence = paths
            .iter()
            .map(|path| format!("body #> '{}' IS NOT NULL", path))
            .collect::<Vec<_>>()
            .join(" OR ");
        let name = format!(
            "documents_{}_{}_unique",
            sanitize(collection),
            fields.iter().map(|f| sanitize(f)).collect::<Vec<_>>().join("_")
        );
        let statement = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON documents ({}) WHERE collection = '{}' AND ({})",
            name,
            expressions,
            sanitize(collection),
            presence
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(collection, e))?;
        Ok(())
    }

    async fn insert(&self, collection: &str, mut document: Document) -> StoreResult<Document> {
        if document.get(PHYSICAL_KEY).map_or(true, Value::is_null) {
            document.insert(PHYSICAL_KEY.to_string(), Value::String(generate_id()));
        }
        let key = physical_key(&document)?;
        sqlx::query("INSERT INTO documents (collection, key, body) VALUES ($1, $2, $3)")
            .bind(collection)
            .bind(&key)
            .bind(Json(Value::Object(document.clone())))
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(collection, e))?;
        Ok(document)
    }

    async fn find(
        &self,
        collection: &str,
        predicate: &Predicate,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let documents = self.load(collection).await?;
        Ok(DocumentMatcher::select(documents, predicate, options))
    }

    async fn count(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64> {
        let documents = self.load(collection).await?;
        Ok(documents
            .iter()
            .filter(|doc| DocumentMatcher::matches(doc, predicate))
            .count() as u64)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
    ) -> StoreResult<Option<Document>> {
        Ok(self
            .update_matching(collection, predicate, update, true)
            .await?
            .into_iter()
            .next())
    }

    async fn update_many(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
    ) -> StoreResult<u64> {
        Ok(self
            .update_matching(collection, predicate, update, false)
            .await?
            .len() as u64)
    }

    async fn delete_many(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64> {
        let keys = self
            .load(collection)
            .await?
            .iter()
            .filter(|doc| DocumentMatcher::matches(doc, predicate))
            .map(physical_key)
            .collect::<StoreResult<Vec<String>>>()?;
        if keys.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND key = ANY($2)")
            .bind(collection)
            .bind(&keys)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(collection, e))?;
        Ok(result.rows_affected())
    }
}
