//! Central error handling for the guiding cache.
//!
//! Provides a unified GuidingError enum with consistent categorization.

/// Centralized error type for all guiding-cache operations
#[derive(thiserror::Error, Debug)]
pub enum GuidingError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuidingError {
    /// Convenience constructor for configuration errors
    pub fn config<T: ToString>(msg: T) -> Self {
        GuidingError::Config(msg.to_string())
    }
}

/// Result type alias for guiding-cache operations
pub type GuidingResult<T> = Result<T, GuidingError>;
