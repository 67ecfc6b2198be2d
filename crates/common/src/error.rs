use thiserror::Error;

/// Canonical Capstan error taxonomy used across crates.
///
/// Classification guidance:
/// - [`CapstanError::InvalidConfig`]: configuration/initialization contract violations
/// - [`CapstanError::Codec`]: record framing, serialization, and truncation failures
/// - [`CapstanError::Fetch`]: connection-level fetch failures, retryable per producer
/// - [`CapstanError::Execution`]: other runtime failures
/// - [`CapstanError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum CapstanError {
    /// Invalid or inconsistent configuration/initialization state.
    ///
    /// Examples:
    /// - zero block size or connection budget
    /// - local shuffle directory creation exhausted its retries
    /// - unparseable environment-variable values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Record framing or serialization failures.
    ///
    /// Examples:
    /// - stream truncated inside a length prefix or payload
    /// - undecodable record bytes
    #[error("codec error: {0}")]
    Codec(String),

    /// Connection-level fetch failures.
    ///
    /// These are recoverable at the fetcher: the producer's in-flight slot is
    /// released and it becomes eligible for re-selection.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Runtime failures outside the other categories.
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard Capstan result alias.
pub type Result<T> = std::result::Result<T, CapstanError>;
