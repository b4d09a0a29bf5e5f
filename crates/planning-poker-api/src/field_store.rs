use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use planning_poker_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub use planning_poker_store_sqlite::WriteOutcome;

/// A stored JSON value together with the revision it was read at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredField {
    pub value: serde_json::Value,
    pub revision: u64,
}

/// Extension-scoped key/value collaborator.
///
/// Reads and writes always move the whole value. `write_if_revision` is the
/// conditional form used for optimistic concurrency; `expected_revision = None`
/// means the field must not exist yet.
#[async_trait]
pub trait FieldStore: Send + Sync {
    async fn read(&self, extension_id: &str, field_key: &str) -> Result<Option<StoredField>>;

    async fn write(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
    ) -> Result<u64>;

    async fn write_if_revision(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
        expected_revision: Option<u64>,
    ) -> Result<WriteOutcome>;
}

#[derive(Debug, Default)]
pub struct InMemoryFieldStore {
    fields: Mutex<BTreeMap<(String, String), StoredField>>,
}

impl InMemoryFieldStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FieldStore for InMemoryFieldStore {
    async fn read(&self, extension_id: &str, field_key: &str) -> Result<Option<StoredField>> {
        let fields = self.fields.lock().await;
        Ok(fields.get(&(extension_id.to_string(), field_key.to_string())).cloned())
    }

    async fn write(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
    ) -> Result<u64> {
        let mut fields = self.fields.lock().await;
        let key = (extension_id.to_string(), field_key.to_string());
        let revision = fields.get(&key).map_or(1, |field| field.revision + 1);
        fields.insert(key, StoredField { value, revision });
        Ok(revision)
    }

    async fn write_if_revision(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
        expected_revision: Option<u64>,
    ) -> Result<WriteOutcome> {
        let mut fields = self.fields.lock().await;
        let key = (extension_id.to_string(), field_key.to_string());
        let current_revision = fields.get(&key).map(|field| field.revision);
        if current_revision != expected_revision {
            return Ok(WriteOutcome::Conflict { current_revision });
        }

        let revision = current_revision.map_or(1, |rev| rev + 1);
        fields.insert(key, StoredField { value, revision });
        Ok(WriteOutcome::Written { revision })
    }
}

/// SQLite-backed collaborator. Each call opens the database on a blocking
/// thread and migrates it before touching the field table.
#[derive(Debug, Clone)]
pub struct SqliteFieldStore {
    db_path: PathBuf,
}

impl SqliteFieldStore {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            op(&mut store)
        })
        .await
        .context("sqlite field store task did not complete")?
    }
}

#[async_trait]
impl FieldStore for SqliteFieldStore {
    async fn read(&self, extension_id: &str, field_key: &str) -> Result<Option<StoredField>> {
        let extension_id = extension_id.to_string();
        let field_key = field_key.to_string();
        self.with_store(move |store| {
            let record = store.read_field(&extension_id, &field_key)?;
            Ok(record.map(|record| StoredField { value: record.value, revision: record.revision }))
        })
        .await
    }

    async fn write(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
    ) -> Result<u64> {
        let extension_id = extension_id.to_string();
        let field_key = field_key.to_string();
        self.with_store(move |store| store.write_field(&extension_id, &field_key, &value)).await
    }

    async fn write_if_revision(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
        expected_revision: Option<u64>,
    ) -> Result<WriteOutcome> {
        let extension_id = extension_id.to_string();
        let field_key = field_key.to_string();
        self.with_store(move |store| {
            store.write_field_if_revision(&extension_id, &field_key, &value, expected_revision)
        })
        .await
    }
}
