//! Error taxonomy for the reconstruction run.
//!
//! Only configuration problems are errors in the `Result` sense: a stage
//! that was never initialized, a missing collaborator, an unreadable
//! table. Per-event rejection is data (`RejectionReason` on the raw
//! event) and never travels through these types.

use thiserror::Error;

/// Fatal configuration errors. Any of these aborts the run.
#[derive(Debug, Clone, Error)]
pub enum SetupError {
    #[error("stage not initialized: {0} (configuration changed without re-running pre_analysis)")]
    StageNotInitialized(&'static str),

    #[error("geometry carries no absorption cross sections, required by {0}")]
    CrossSectionsMissing(&'static str),

    #[error("unknown algorithm selector: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to load {what}: {detail}")]
    TableLoad { what: &'static str, detail: String },
}

/// Errors raised by an output sink while persisting a physical event.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("failed to write event: {0}")]
    Write(String),

    #[error("sink closed")]
    Closed,
}
