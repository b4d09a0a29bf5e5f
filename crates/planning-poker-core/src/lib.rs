use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod options;
mod session;
mod tally;

pub use options::{EstimateOptions, RawEstimateOptions};
pub use session::{SessionEvent, SessionState};
pub use tally::{
    compare_for_display, order_for_display, rank_of, summarize, tally_report, RankedVote,
    TallyReport, TallySummary,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PokerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid transition: `{event}` is not allowed while {state}")]
    InvalidTransition { state: SessionState, event: SessionEvent },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the viewer, supplied by the host environment as
/// `{ "id", "name", "avatarUrl" }`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    #[serde(alias = "avatarUrl")]
    pub avatar_url: String,
}

impl Participant {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        avatar_url: impl Into<String>,
    ) -> Self {
        Self { id: ParticipantId::new(id), name: name.into(), avatar_url: avatar_url.into() }
    }
}

/// A single estimate card. `Unknown` is the "?" card, which is a real vote and
/// never the same thing as withdrawing.
///
/// On the wire an estimate is a nullable integer: `null` is the unknown card.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum Estimate {
    Points(i64),
    Unknown,
}

impl Estimate {
    #[must_use]
    pub fn points(self) -> Option<i64> {
        match self {
            Self::Points(value) => Some(value),
            Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl From<Option<i64>> for Estimate {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Self::Unknown, Self::Points)
    }
}

impl From<Estimate> for Option<i64> {
    fn from(value: Estimate) -> Self {
        value.points()
    }
}

impl Display for Estimate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Points(value) => write!(f, "{value}"),
            Self::Unknown => f.write_str("?"),
        }
    }
}

/// One participant's vote for one record.
///
/// `is_unknown()` is derived from `estimate`, so the two can never disagree in
/// memory. Stored shapes where they disagree are normalized on read with the
/// `estimate` field taken as authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "StoredVote", into = "StoredVote")]
pub struct Vote {
    pub participant_id: ParticipantId,
    pub name: String,
    pub avatar: String,
    pub estimate: Estimate,
}

impl Vote {
    #[must_use]
    pub fn new(participant: &Participant, estimate: Estimate) -> Self {
        Self {
            participant_id: participant.id.clone(),
            name: participant.name.clone(),
            avatar: participant.avatar_url.clone(),
            estimate,
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.estimate.is_unknown()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVote {
    id: ParticipantId,
    name: String,
    #[serde(default)]
    avatar: String,
    estimate: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    unknown: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl From<StoredVote> for Vote {
    fn from(stored: StoredVote) -> Self {
        Self {
            participant_id: stored.id,
            name: stored.name,
            avatar: stored.avatar,
            estimate: Estimate::from(stored.estimate),
        }
    }
}

impl From<Vote> for StoredVote {
    fn from(vote: Vote) -> Self {
        let unknown = vote.is_unknown();
        Self {
            id: vote.participant_id,
            name: vote.name,
            avatar: vote.avatar,
            estimate: vote.estimate.points(),
            unknown,
        }
    }
}

/// What a participant wants done with their entry in a record's collection.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum VoteIntent {
    Cast { participant: Participant, estimate: Estimate },
    Withdraw { participant_id: ParticipantId },
}

impl VoteIntent {
    #[must_use]
    pub fn cast(participant: Participant, estimate: Estimate) -> Self {
        Self::Cast { participant, estimate }
    }

    #[must_use]
    pub fn withdraw(participant_id: ParticipantId) -> Self {
        Self::Withdraw { participant_id }
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        match self {
            Self::Cast { participant, .. } => &participant.id,
            Self::Withdraw { participant_id } => participant_id,
        }
    }

    /// # Errors
    /// Returns [`PokerError::Validation`] when the participant id is blank.
    pub fn validate(&self) -> Result<(), PokerError> {
        if self.participant_id().as_str().trim().is_empty() {
            return Err(PokerError::Validation(
                "participant id MUST be provided for every vote change".to_string(),
            ));
        }
        Ok(())
    }
}

/// Votes for exactly one record, at most one per participant.
///
/// Storage order carries no meaning; use [`order_for_display`] for the list view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "Vec<Vote>", into = "Vec<Vote>")]
pub struct VoteCollection {
    votes: Vec<Vote>,
}

impl VoteCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert-or-remove: any existing entry for the intent's participant is
    /// dropped, then a cast appends the new vote. Returns the replaced entry.
    pub fn merge(&mut self, intent: &VoteIntent) -> Option<Vote> {
        let previous = self.remove(intent.participant_id());
        if let VoteIntent::Cast { participant, estimate } = intent {
            self.votes.push(Vote::new(participant, *estimate));
        }
        previous
    }

    fn remove(&mut self, participant_id: &ParticipantId) -> Option<Vote> {
        let index = self.votes.iter().position(|vote| &vote.participant_id == participant_id)?;
        Some(self.votes.remove(index))
    }

    #[must_use]
    pub fn get(&self, participant_id: &ParticipantId) -> Option<&Vote> {
        self.votes.iter().find(|vote| &vote.participant_id == participant_id)
    }

    #[must_use]
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.get(participant_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vote> {
        self.votes.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Vote] {
        &self.votes
    }
}

impl From<Vec<Vote>> for VoteCollection {
    /// Collapses duplicate participants, keeping the last occurrence.
    fn from(votes: Vec<Vote>) -> Self {
        let mut collection = Self::new();
        for vote in votes {
            collection.remove(&vote.participant_id);
            collection.votes.push(vote);
        }
        collection
    }
}

impl From<VoteCollection> for Vec<Vote> {
    fn from(collection: VoteCollection) -> Self {
        collection.votes
    }
}

impl<'a> IntoIterator for &'a VoteCollection {
    type Item = &'a Vote;
    type IntoIter = std::slice::Iter<'a, Vote>;

    fn into_iter(self) -> Self::IntoIter {
        self.votes.iter()
    }
}

/// The persisted aggregate: every record that has ever been voted on.
///
/// A touched record keeps its entry even when its last vote is withdrawn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct VotingRecordsTable {
    records: BTreeMap<RecordId, VoteCollection>,
}

impl VotingRecordsTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a stored blob. An absent value is an empty table.
    ///
    /// # Errors
    /// Returns [`PokerError::Validation`] when the stored value is not a
    /// mapping of record id to vote list.
    pub fn from_stored(value: Option<serde_json::Value>) -> Result<Self, PokerError> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Self::new()),
            Some(value) => serde_json::from_value(value).map_err(|err| {
                PokerError::Validation(format!("stored voting records are malformed: {err}"))
            }),
        }
    }

    /// # Errors
    /// Returns [`PokerError::Validation`] if the table cannot be encoded.
    pub fn to_stored(&self) -> Result<serde_json::Value, PokerError> {
        serde_json::to_value(self).map_err(|err| {
            PokerError::Validation(format!("failed to encode voting records: {err}"))
        })
    }

    #[must_use]
    pub fn get(&self, record_id: &RecordId) -> Option<&VoteCollection> {
        self.records.get(record_id)
    }

    /// The record's votes, or an empty collection for an untouched record.
    #[must_use]
    pub fn collection(&self, record_id: &RecordId) -> VoteCollection {
        self.records.get(record_id).cloned().unwrap_or_default()
    }

    /// Apply one intent, creating the record entry on first touch.
    pub fn apply(&mut self, record_id: &RecordId, intent: &VoteIntent) -> &VoteCollection {
        let collection = self.records.entry(record_id.clone()).or_default();
        collection.merge(intent);
        collection
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }
}
