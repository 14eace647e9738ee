//! Error types for the scan pipeline.
//!
//! The orchestrator needs to tell apart failures that abort a scan without
//! advancing the cursor (store unavailable, classifier network/parse failure)
//! from failures that only affect one item or one sink. Each failure domain
//! gets its own enum so callers match on the condition, not on strings.

use thiserror::Error;

/// Failures raised by the message store reader.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened: missing file, permission denied
    /// (typically Full Disk Access has not been granted), or a corrupt file.
    #[error("message store unavailable: {0}")]
    Unavailable(String),

    /// The database opened but a query failed (schema mismatch, bad SQL).
    #[error("message store query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Failures raised by the classifier. Both variants abort the whole
/// classify call; per-item problems are validation warnings, not errors.
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// The HTTP call to the model endpoint failed or timed out.
    #[error("classifier request failed: {0}")]
    Network(String),

    /// The response body was not the expected JSON envelope.
    #[error("classifier returned unparseable output: {0}")]
    Parse(String),
}

/// Failures raised by an individual sink attempt. One sink failing never
/// blocks other sinks or other items.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The OS denied access to the underlying store (calendar, reminders).
    #[error("sink access denied: {0}")]
    AccessDenied(String),

    /// The sink was reachable but the write itself failed.
    #[error("sink write failed: {0}")]
    WriteFailed(String),
}
