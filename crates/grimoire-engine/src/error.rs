//! Engine error taxonomy.
//!
//! The engine is a library: nothing here ever aborts the process. Every
//! error carries a kind tag so hosts can decide what reaches users and what
//! only reaches observability.

use grimoire_proto::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the Annotation Collaboration Engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller fault: a highlight or selection range with `start > end`.
    #[error("invalid range: start {start} exceeds end {end}")]
    InvalidRange { start: u64, end: u64 },

    /// Caller fault: a tag that cannot identify anything.
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Caller fault: the document exceeds the configured ingestion limit.
    #[error("document too large: {size} bytes (limit {limit})")]
    DocumentTooLarge { size: usize, limit: usize },

    /// A CRDT update blob that does not decode or apply.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    /// An operation referenced a highlight that does not exist.
    #[error("unknown highlight: {0}")]
    UnknownHighlight(String),

    /// A message that makes no sense in the current connection state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transient persistence failure; the document stays dirty and the
    /// flush is retried.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Cold load failed; the connection is refused until the store recovers.
    #[error("document load failed: {0}")]
    Load(String),

    /// A send to a client failed; the connection is torn down.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An invariant the engine repairs or reports, never panics over.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The wire-level error category for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidRange { .. } => ErrorCode::InvalidRange,
            EngineError::InvalidTag(_) => ErrorCode::InvalidTag,
            EngineError::DocumentTooLarge { .. } => ErrorCode::DocumentTooLarge,
            EngineError::MalformedUpdate(_) => ErrorCode::MalformedUpdate,
            EngineError::UnknownHighlight(_) => ErrorCode::UnknownHighlight,
            EngineError::Protocol(_) => ErrorCode::Protocol,
            EngineError::Persistence(_) | EngineError::Load(_) => ErrorCode::Persistence,
            EngineError::Transport(_) | EngineError::Internal(_) => ErrorCode::Internal,
        }
    }
}
