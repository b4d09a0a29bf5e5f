use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use planning_poker_core::{
    Estimate, Participant, ParticipantId, PokerError, RecordId, VoteCollection, VoteIntent,
    VotingRecordsTable,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::field_store::{FieldStore, WriteOutcome};

pub const DEFAULT_EXTENSION_ID: &str = "planning-poker";
pub const DEFAULT_FIELD_KEY: &str = "voting_records";
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 5;

/// How a merged table is written back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// Conditional write on the revision that was read; the whole
    /// read-merge-write cycle is retried on conflict.
    #[default]
    Optimistic,
    /// Unconditional overwrite of the whole table.
    LastWriterWins,
}

impl WriteMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::LastWriterWins => "last-writer-wins",
        }
    }
}

impl Display for WriteMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteMode {
    type Err = PokerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "optimistic" => Ok(Self::Optimistic),
            "last-writer-wins" => Ok(Self::LastWriterWins),
            other => Err(PokerError::Config(format!(
                "unsupported write mode `{other}`; expected optimistic or last-writer-wins"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteStoreConfig {
    pub extension_id: String,
    pub field_key: String,
    pub write_mode: WriteMode,
    pub max_write_attempts: u32,
}

impl Default for VoteStoreConfig {
    fn default() -> Self {
        Self {
            extension_id: DEFAULT_EXTENSION_ID.to_string(),
            field_key: DEFAULT_FIELD_KEY.to_string(),
            write_mode: WriteMode::Optimistic,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("voting records for `{record_id}` kept changing; gave up after {attempts} write attempts")]
pub struct WriteConflictError {
    pub record_id: RecordId,
    pub attempts: u32,
}

/// Translates single-participant intents into whole-table read-merge-write
/// cycles. Nothing is cached between calls; every operation re-reads.
#[derive(Clone)]
pub struct VoteStore {
    fields: Arc<dyn FieldStore>,
    config: VoteStoreConfig,
}

impl std::fmt::Debug for VoteStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteStore").field("config", &self.config).finish_non_exhaustive()
    }
}

impl VoteStore {
    #[must_use]
    pub fn new(fields: Arc<dyn FieldStore>, config: VoteStoreConfig) -> Self {
        Self { fields, config }
    }

    #[must_use]
    pub fn config(&self) -> &VoteStoreConfig {
        &self.config
    }

    async fn read_table(&self) -> Result<(VotingRecordsTable, Option<u64>)> {
        let stored = self.fields.read(&self.config.extension_id, &self.config.field_key).await?;
        let revision = stored.as_ref().map(|field| field.revision);
        let table = VotingRecordsTable::from_stored(stored.map(|field| field.value))?;
        Ok((table, revision))
    }

    /// Current votes for `record_id`. A missing table or record is an empty
    /// collection.
    ///
    /// # Errors
    /// Returns an error when the collaborator read fails or the stored table is malformed.
    pub async fn fetch_votes(&self, record_id: &RecordId) -> Result<VoteCollection> {
        let (table, revision) = self.read_table().await?;
        let votes = table.collection(record_id);
        debug!(record_id = %record_id, ?revision, vote_count = votes.len(), "fetched votes");
        Ok(votes)
    }

    /// Replace `participant`'s vote on `record_id` with `estimate`.
    ///
    /// # Errors
    /// Returns an error on a blank participant id, a collaborator failure, or
    /// (optimistic mode) repeated write conflicts.
    pub async fn cast_vote(
        &self,
        record_id: &RecordId,
        participant: &Participant,
        estimate: Estimate,
    ) -> Result<VoteCollection> {
        let votes =
            self.apply(record_id, &VoteIntent::cast(participant.clone(), estimate)).await?;
        info!(
            record_id = %record_id,
            participant_id = %participant.id,
            %estimate,
            vote_count = votes.len(),
            "vote cast"
        );
        Ok(votes)
    }

    /// Remove any vote by `participant_id` on `record_id`. Withdrawing a vote
    /// that does not exist still writes the table back.
    ///
    /// # Errors
    /// Returns an error on a blank participant id, a collaborator failure, or
    /// (optimistic mode) repeated write conflicts.
    pub async fn withdraw_vote(
        &self,
        record_id: &RecordId,
        participant_id: &ParticipantId,
    ) -> Result<VoteCollection> {
        let votes = self.apply(record_id, &VoteIntent::withdraw(participant_id.clone())).await?;
        info!(
            record_id = %record_id,
            participant_id = %participant_id,
            vote_count = votes.len(),
            "vote withdrawn"
        );
        Ok(votes)
    }

    async fn apply(&self, record_id: &RecordId, intent: &VoteIntent) -> Result<VoteCollection> {
        intent.validate()?;
        match self.config.write_mode {
            WriteMode::LastWriterWins => {
                let (mut table, _) = self.read_table().await?;
                let votes = table.apply(record_id, intent).clone();
                self.fields
                    .write(&self.config.extension_id, &self.config.field_key, table.to_stored()?)
                    .await?;
                Ok(votes)
            }
            WriteMode::Optimistic => self.apply_optimistic(record_id, intent).await,
        }
    }

    async fn apply_optimistic(
        &self,
        record_id: &RecordId,
        intent: &VoteIntent,
    ) -> Result<VoteCollection> {
        let attempts = self.config.max_write_attempts.max(1);
        for attempt in 1..=attempts {
            let (mut table, revision) = self.read_table().await?;
            let votes = table.apply(record_id, intent).clone();
            let outcome = self
                .fields
                .write_if_revision(
                    &self.config.extension_id,
                    &self.config.field_key,
                    table.to_stored()?,
                    revision,
                )
                .await?;

            match outcome {
                WriteOutcome::Written { .. } => return Ok(votes),
                WriteOutcome::Conflict { current_revision } => {
                    warn!(
                        record_id = %record_id,
                        attempt,
                        expected_revision = ?revision,
                        ?current_revision,
                        "voting records changed during write; retrying"
                    );
                }
            }
        }

        Err(WriteConflictError { record_id: record_id.clone(), attempts }.into())
    }
}
