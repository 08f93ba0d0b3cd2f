//! Error taxonomy for the memory engine.
//!
//! Mirrors the propagation policy from the design notes: input errors
//! surface synchronously, capability errors degrade a retrieval path
//! instead of failing it, adapter errors are fatal only for the tier write
//! that hit them, and cancellation/timeout are distinct from both.

/// Crate-wide error type.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid input at a construction boundary (empty user_id, content, etc.)
    #[error("invalid input: {0}")]
    Input(String),

    /// The text/embedding capability failed or returned malformed data.
    #[error("capability error: {0}")]
    Capability(String),

    /// A tier adapter's backing store failed.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A background task exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(feature = "sqlite-archive")]
impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Adapter(e.to_string())
    }
}
