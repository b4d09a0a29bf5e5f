use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::PokerError;

/// Per-viewer widget state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Loading,
    AwaitingVote,
    Revealed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::AwaitingVote => "awaiting_vote",
            Self::Revealed => "revealed",
        }
    }

    /// The state reached by `event`, or `None` when the event is not allowed.
    #[must_use]
    pub fn next(self, event: SessionEvent) -> Option<Self> {
        match (self, event) {
            (Self::Loading, SessionEvent::Loaded { has_voted: true })
            | (Self::AwaitingVote, SessionEvent::VoteCast | SessionEvent::RevealRequested) => {
                Some(Self::Revealed)
            }
            (Self::Loading, SessionEvent::Loaded { has_voted: false })
            | (Self::Revealed, SessionEvent::ChangeVoteRequested) => Some(Self::AwaitingVote),
            _ => None,
        }
    }

    /// # Errors
    /// Returns [`PokerError::InvalidTransition`] when `event` is not allowed
    /// from this state.
    pub fn apply(self, event: SessionEvent) -> Result<Self, PokerError> {
        self.next(event).ok_or(PokerError::InvalidTransition { state: self, event })
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The authoritative fetch resolved; `has_voted` is the membership check
    /// against the fetched collection.
    Loaded { has_voted: bool },
    VoteCast,
    RevealRequested,
    ChangeVoteRequested,
}

impl Display for SessionEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Loaded { .. } => "loaded",
            Self::VoteCast => "vote_cast",
            Self::RevealRequested => "reveal_requested",
            Self::ChangeVoteRequested => "change_vote_requested",
        };
        f.write_str(label)
    }
}
