use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use planning_poker_core::{
    tally_report, Estimate, EstimateOptions, Participant, ParticipantId, RecordId, TallyReport,
    VoteCollection,
};
use planning_poker_store_sqlite::{FieldRecord, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

mod field_store;
mod session;
#[cfg(test)]
mod test_support;
mod vote_store;

pub use field_store::{FieldStore, InMemoryFieldStore, SqliteFieldStore, StoredField, WriteOutcome};
pub use session::{SessionView, VotingSession};
pub use vote_store::{
    VoteStore, VoteStoreConfig, WriteConflictError, WriteMode, DEFAULT_EXTENSION_ID,
    DEFAULT_FIELD_KEY, DEFAULT_MAX_WRITE_ATTEMPTS,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CastVoteRequest {
    pub participant: Participant,
    /// `null` casts the unknown card.
    pub estimate: Estimate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordVotes {
    pub record_id: RecordId,
    pub votes: VoteCollection,
}

/// Facade over one SQLite database and one estimate configuration.
#[derive(Debug, Clone)]
pub struct PokerApi {
    db_path: PathBuf,
    options: EstimateOptions,
    votes: VoteStore,
}

impl PokerApi {
    #[must_use]
    pub fn new(db_path: PathBuf, options: EstimateOptions, config: VoteStoreConfig) -> Self {
        let fields = Arc::new(SqliteFieldStore::new(db_path.clone()));
        Self { db_path, options, votes: VoteStore::new(fields, config) }
    }

    #[must_use]
    pub fn options(&self) -> &EstimateOptions {
        &self.options
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup is missing or cannot be restored.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    /// Raw stored fields for the configured extension.
    ///
    /// # Errors
    /// Returns an error when the database cannot be migrated or read.
    pub fn list_fields(&self) -> Result<Vec<FieldRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_fields(Some(&self.votes.config().extension_id))
    }

    /// # Errors
    /// Returns an error when the stored voting records cannot be read.
    pub async fn fetch_votes(&self, record_id: &RecordId) -> Result<RecordVotes> {
        let votes = self.votes.fetch_votes(record_id).await?;
        Ok(RecordVotes { record_id: record_id.clone(), votes })
    }

    /// Cast a vote after checking it against the configured cards.
    ///
    /// # Errors
    /// Returns an error for an unconfigured estimate, a blank participant id,
    /// or a storage failure.
    pub async fn cast_vote(
        &self,
        record_id: &RecordId,
        request: CastVoteRequest,
    ) -> Result<RecordVotes> {
        self.options.validate(request.estimate)?;
        let votes = self.votes.cast_vote(record_id, &request.participant, request.estimate).await?;
        Ok(RecordVotes { record_id: record_id.clone(), votes })
    }

    /// # Errors
    /// Returns an error for a blank participant id or a storage failure.
    pub async fn withdraw_vote(
        &self,
        record_id: &RecordId,
        participant_id: &ParticipantId,
    ) -> Result<RecordVotes> {
        let votes = self.votes.withdraw_vote(record_id, participant_id).await?;
        Ok(RecordVotes { record_id: record_id.clone(), votes })
    }

    /// Summary plus display-ordered votes for one record.
    ///
    /// # Errors
    /// Returns an error when the stored voting records cannot be read.
    pub async fn tally(&self, record_id: &RecordId) -> Result<TallyReport> {
        let votes = self.votes.fetch_votes(record_id).await?;
        Ok(tally_report(&votes, &self.options))
    }

    #[must_use]
    pub fn session(&self, record_id: RecordId, participant: Participant) -> VotingSession {
        VotingSession::new(self.votes.clone(), self.options.clone(), record_id, participant)
    }
}
