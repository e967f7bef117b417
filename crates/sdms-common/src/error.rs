//! Error types for SDMS
//!
//! The variants follow the operational taxonomy: transient tool failures,
//! data inconsistencies, resource exhaustion, configuration errors.
//! Lock contention is not an error and has no variant.

use thiserror::Error;

/// Common result type for SDMS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SDMS
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // External tools
    #[error("tool `{tool}` failed: {message}")]
    Tool { tool: String, message: String },

    #[error("tool `{tool}` timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("malformed tool output: {0}")]
    MalformedOutput(String),

    // Data
    #[error("path does not follow the catalog naming convention: {0}")]
    PathParse(String),

    #[error("data inconsistency: {0}")]
    Inconsistency(String),

    #[error("store error: {0}")]
    Store(String),

    // Configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown target class: {0}")]
    UnknownTarget(String),

    #[error("unknown stage target: {0}")]
    UnknownStageTarget(String),

    #[error("invalid staging request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Create a tool failure error
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Transient failures: the unit of work is left for a later attempt
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Tool { .. } | Self::Timeout { .. } | Self::MalformedOutput(_) | Self::Io(_)
        )
    }

    /// Configuration errors are the only ones allowed to end a run early
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnknownTarget(_)
                | Self::UnknownStageTarget(_)
                | Self::InvalidRequest(_)
        )
    }
}
