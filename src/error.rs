//! Error taxonomy shared by every stage of the ingest pipeline.
//!
//! | Variant | Raised when | Retried |
//! |---------|-------------|---------|
//! | [`Config`](IngestError::Config) | unknown registry tag, malformed options | never |
//! | [`SourceConnection`](IngestError::SourceConnection) | auth, missing resource, bad query | never |
//! | [`SourceConnectionNetwork`](IngestError::SourceConnectionNetwork) | transient network failure, timeout | yes, bounded |
//! | [`DestinationConnection`](IngestError::DestinationConnection) | destination precheck fails | never, aborts the run |
//! | [`Write`](IngestError::Write) | one upload batch fails | never inside the uploader |
//!
//! Errors raised while a unit is in flight are caught at the unit
//! boundary by the pipeline and recorded in the run summary. Only
//! precheck failures abort a run.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("source connection error: {0}")]
    SourceConnection(String),

    #[error("source network error: {0}")]
    SourceConnectionNetwork(String),

    #[error("destination connection error: {0}")]
    DestinationConnection(String),

    #[error("write error: {0}")]
    Write(String),

    /// Malformed persisted data (e.g. a FileData document missing a required key).
    #[error("invalid value: {0}")]
    Value(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A task on the blocking pool panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// Whether a call that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::SourceConnectionNetwork(_))
    }

    /// Convert an exhausted transient failure into a permanent one.
    ///
    /// Non-network errors are returned unchanged.
    pub fn escalate(self, attempts: u32) -> Self {
        match self {
            IngestError::SourceConnectionNetwork(msg) => IngestError::SourceConnection(format!(
                "giving up after {} attempts: {}",
                attempts, msg
            )),
            other => other,
        }
    }

    /// Classify an I/O error raised while reading from a source.
    ///
    /// Missing or forbidden objects are permanent, interrupted or timed-out
    /// reads are transient, anything else stays an I/O error.
    pub fn from_source_io(err: std::io::Error, what: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                IngestError::SourceConnection(format!("{}: {}", what, err))
            }
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => {
                IngestError::SourceConnectionNetwork(format!("{}: {}", what, err))
            }
            _ => IngestError::Io(err),
        }
    }

    /// Short machine-readable name of the variant, used in failure logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Config(_) => "config",
            IngestError::SourceConnection(_) => "source_connection",
            IngestError::SourceConnectionNetwork(_) => "source_connection_network",
            IngestError::DestinationConnection(_) => "destination_connection",
            IngestError::Write(_) => "write",
            IngestError::Value(_) => "value",
            IngestError::Io(_) => "io",
            IngestError::Json(_) => "json",
            IngestError::Task(_) => "task",
        }
    }
}
