use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use planning_poker_core::Participant;

use crate::field_store::{FieldStore, InMemoryFieldStore, StoredField, WriteOutcome};

pub fn alice() -> Participant {
    Participant::new("a1", "Alice", "https://avatars.example/a1.png")
}

pub fn bob() -> Participant {
    Participant::new("b2", "Bob", "https://avatars.example/b2.png")
}

/// A collaborator whose every call is rejected.
pub struct FailingFieldStore;

#[async_trait]
impl FieldStore for FailingFieldStore {
    async fn read(&self, _extension_id: &str, _field_key: &str) -> Result<Option<StoredField>> {
        Err(anyhow!("collaborator unavailable"))
    }

    async fn write(
        &self,
        _extension_id: &str,
        _field_key: &str,
        _value: serde_json::Value,
    ) -> Result<u64> {
        Err(anyhow!("collaborator unavailable"))
    }

    async fn write_if_revision(
        &self,
        _extension_id: &str,
        _field_key: &str,
        _value: serde_json::Value,
        _expected_revision: Option<u64>,
    ) -> Result<WriteOutcome> {
        Err(anyhow!("collaborator unavailable"))
    }
}

/// An in-memory collaborator whose reads and writes can be switched off
/// mid-test. Counts every read it is asked for.
#[derive(Default)]
pub struct SwitchableFieldStore {
    inner: InMemoryFieldStore,
    reads_fail: AtomicBool,
    writes_fail: AtomicBool,
    reads: AtomicU32,
}

impl SwitchableFieldStore {
    pub fn fail_reads(&self, fail: bool) {
        self.reads_fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.writes_fail.store(fail, Ordering::SeqCst);
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FieldStore for SwitchableFieldStore {
    async fn read(&self, extension_id: &str, field_key: &str) -> Result<Option<StoredField>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.reads_fail.load(Ordering::SeqCst) {
            bail!("read rejected");
        }
        self.inner.read(extension_id, field_key).await
    }

    async fn write(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
    ) -> Result<u64> {
        if self.writes_fail.load(Ordering::SeqCst) {
            bail!("write rejected");
        }
        self.inner.write(extension_id, field_key, value).await
    }

    async fn write_if_revision(
        &self,
        extension_id: &str,
        field_key: &str,
        value: serde_json::Value,
        expected_revision: Option<u64>,
    ) -> Result<WriteOutcome> {
        if self.writes_fail.load(Ordering::SeqCst) {
            bail!("write rejected");
        }
        self.inner.write_if_revision(extension_id, field_key, value, expected_revision).await
    }
}
