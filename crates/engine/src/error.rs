use crate::model::{DealId, SessionId, UserId};
use std::fmt;
use thiserror::Error;
use types::auction::CallError;
use types::call::ParseCallError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Session(SessionId),
    Deal(DealId),
    Node(String),
    Sequence { deal: DealId, user: UserId },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Session(id) => write!(f, "session {} not found", id),
            Missing::Deal(id) => write!(f, "deal {} not found", id),
            Missing::Node(label) => write!(f, "node {} not found", label),
            Missing::Sequence { deal, user } => {
                write!(f, "no bidding sequence for user {} in deal {}", user, deal)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or illegal call. Recoverable; reported with a specific
    /// reason and never logged as a failure.
    #[error("illegal call: {0}")]
    Validation(#[from] CallError),
    #[error("{0}")]
    NotFound(Missing),
    /// Lost a race for a deal lock after retries. Retryable by the caller.
    #[error("deal {0} is busy with another operation; retry")]
    Conflict(DealId),
    #[error("confirm must be set to perform a rewind")]
    ConfirmRequired,
    #[error("no active responses to undo")]
    NoActiveResponses,
    #[error("cannot undo a response made at the root")]
    CannotUndoRoot,
    /// Data-integrity or programming bug. The operation is aborted with no
    /// partial writes.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<ParseCallError> for EngineError {
    fn from(err: ParseCallError) -> Self {
        EngineError::Validation(CallError::from(err))
    }
}
