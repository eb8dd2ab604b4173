//! Error abstractions.

// Error messages.
pub const ERR_OUTCOME_CHANNEL_CLOSED: &str = "election outcome channel closed unexpectedly";

/// The error type used to indicate that an instance shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
