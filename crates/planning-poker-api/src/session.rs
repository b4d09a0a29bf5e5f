use anyhow::Result;
use planning_poker_core::{
    order_for_display, summarize, Estimate, EstimateOptions, Participant, ParticipantId,
    PokerError, RankedVote, RecordId, SessionEvent, SessionState, TallySummary, VoteCollection,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::vote_store::VoteStore;

/// What one viewer is allowed to see right now.
///
/// Other participants' votes and the summary are only present once the
/// session is revealed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionView {
    pub record_id: RecordId,
    pub participant_id: ParticipantId,
    pub state: SessionState,
    /// Always false while awaiting a vote.
    pub has_voted: bool,
    /// `None` when `has_voted` is false.
    pub own_vote: Option<Estimate>,
    /// The session is awaiting a vote but the store still holds this
    /// participant's earlier vote, because a `change_vote` withdrawal failed.
    pub withdrawal_pending: bool,
    pub choices: Vec<Estimate>,
    pub votes: Vec<RankedVote>,
    pub summary: Option<TallySummary>,
    pub last_failure: Option<String>,
}

/// Per-viewer driver of the voting state machine for one record.
///
/// Calls are issued one at a time (`&mut self`). Dropping a pending call is
/// safe: every transition except `change_vote` is committed only after its
/// store call resolves, so an abandoned future leaves the session in its
/// pre-transition state.
#[derive(Debug)]
pub struct VotingSession {
    store: VoteStore,
    options: EstimateOptions,
    record_id: RecordId,
    participant: Participant,
    state: SessionState,
    votes: VoteCollection,
    last_failure: Option<String>,
}

impl VotingSession {
    #[must_use]
    pub fn new(
        store: VoteStore,
        options: EstimateOptions,
        record_id: RecordId,
        participant: Participant,
    ) -> Self {
        Self {
            store,
            options,
            record_id,
            participant,
            state: SessionState::Loading,
            votes: VoteCollection::new(),
            last_failure: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn votes(&self) -> &VoteCollection {
        &self.votes
    }

    #[must_use]
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// Fetch the record's votes and branch on whether this participant has
    /// already voted. Membership is checked against the fetched collection.
    ///
    /// # Errors
    /// Returns an error when the session has already loaded (nothing is
    /// fetched) or the fetch fails (the session stays `Loading`).
    pub async fn load(&mut self) -> Result<SessionState> {
        if self.state != SessionState::Loading {
            return Err(PokerError::InvalidTransition {
                state: self.state,
                event: SessionEvent::Loaded { has_voted: false },
            }
            .into());
        }

        let votes = match self.store.fetch_votes(&self.record_id).await {
            Ok(votes) => votes,
            Err(err) => return Err(self.record_failure("load", err)),
        };
        let has_voted = votes.contains(&self.participant.id);
        self.state = self.state.apply(SessionEvent::Loaded { has_voted })?;
        self.votes = votes;
        self.last_failure = None;
        info!(
            record_id = %self.record_id,
            participant_id = %self.participant.id,
            state = %self.state,
            "voting session loaded"
        );
        Ok(self.state)
    }

    /// Cast `estimate` and reveal.
    ///
    /// # Errors
    /// Returns an error when the session is not awaiting a vote, the estimate
    /// is not one of the configured cards, or the store call fails (the session
    /// then stays `AwaitingVote` with `last_failure` set).
    pub async fn submit(&mut self, estimate: Estimate) -> Result<SessionState> {
        let next = self.state.apply(SessionEvent::VoteCast)?;
        self.options.validate(estimate)?;

        match self.store.cast_vote(&self.record_id, &self.participant, estimate).await {
            Ok(votes) => {
                self.votes = votes;
                self.state = next;
                self.last_failure = None;
                Ok(self.state)
            }
            Err(err) => Err(self.record_failure("submit", err)),
        }
    }

    /// View results without voting.
    ///
    /// # Errors
    /// Returns [`PokerError::InvalidTransition`] unless the session is awaiting a vote.
    pub fn reveal_without_voting(&mut self) -> Result<SessionState, PokerError> {
        self.state = self.state.apply(SessionEvent::RevealRequested)?;
        Ok(self.state)
    }

    /// Withdraw this participant's vote and go back to voting.
    ///
    /// The session moves to `AwaitingVote` before the withdrawal is sent and
    /// stays there even if the withdrawal fails; the view then reports
    /// `withdrawal_pending` until a later submit replaces the stored vote.
    ///
    /// # Errors
    /// Returns an error when the session is not revealed or the withdrawal fails.
    pub async fn change_vote(&mut self) -> Result<SessionState> {
        self.state = self.state.apply(SessionEvent::ChangeVoteRequested)?;

        match self.store.withdraw_vote(&self.record_id, &self.participant.id).await {
            Ok(votes) => {
                self.votes = votes;
                self.last_failure = None;
                Ok(self.state)
            }
            Err(err) => Err(self.record_failure("change_vote", err)),
        }
    }

    /// Re-fetch the record's votes without changing state. A session that has
    /// not loaded yet is loaded instead.
    ///
    /// # Errors
    /// Returns an error when the fetch fails; the last confirmed votes are kept.
    pub async fn refresh(&mut self) -> Result<SessionState> {
        if self.state == SessionState::Loading {
            return self.load().await;
        }

        match self.store.fetch_votes(&self.record_id).await {
            Ok(votes) => {
                self.votes = votes;
                self.last_failure = None;
                Ok(self.state)
            }
            Err(err) => Err(self.record_failure("refresh", err)),
        }
    }

    #[must_use]
    pub fn view(&self) -> SessionView {
        let revealed = self.state == SessionState::Revealed;
        let awaiting = self.state == SessionState::AwaitingVote;
        let stored_vote = self.votes.get(&self.participant.id).map(|vote| vote.estimate);
        let own_vote = if awaiting { None } else { stored_vote };
        SessionView {
            record_id: self.record_id.clone(),
            participant_id: self.participant.id.clone(),
            state: self.state,
            has_voted: own_vote.is_some(),
            own_vote,
            withdrawal_pending: awaiting && stored_vote.is_some(),
            choices: if awaiting { self.options.choices() } else { Vec::new() },
            votes: if revealed {
                order_for_display(&self.votes, &self.options)
            } else {
                Vec::new()
            },
            summary: revealed.then(|| summarize(&self.votes)),
            last_failure: self.last_failure.clone(),
        }
    }

    fn record_failure(&mut self, operation: &'static str, err: anyhow::Error) -> anyhow::Error {
        let message = format!("{operation} failed: {err:#}");
        warn!(
            record_id = %self.record_id,
            participant_id = %self.participant.id,
            state = %self.state,
            error = %message,
            "voting session store call failed"
        );
        self.last_failure = Some(message);
        err
    }
}
