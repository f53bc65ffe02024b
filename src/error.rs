//! Error handling for frameline
//!
//! This module defines the crate-level error type and a Result alias used by
//! configuration loading, chain construction and the command line front-end.
//! Runtime errors raised while building or executing a pipeline live in
//! [`crate::pipeline::PipelineError`] and convert into [`FramelineError`].

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for frameline operations
#[derive(Error, Debug)]
pub enum FramelineError {
    /// Errors raised by the pipeline runtime
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FramelineError>,
    },
}

impl FramelineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FramelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<toml::de::Error> for FramelineError {
    fn from(err: toml::de::Error) -> Self {
        FramelineError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for FramelineError {
    fn from(err: toml::ser::Error) -> Self {
        FramelineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for FramelineError {
    fn from(err: serde_json::Error) -> Self {
        FramelineError::Serialization(err.to_string())
    }
}

/// Result type alias for frameline operations
pub type Result<T> = std::result::Result<T, FramelineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<FramelineError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FramelineError::Config("stage count mismatch".to_string());
        assert_eq!(err.to_string(), "Configuration error: stage count mismatch");
    }

    #[test]
    fn test_error_with_context() {
        let err = FramelineError::Config("test".to_string());
        let with_ctx = err.with_context("Failed to load chain");
        assert!(with_ctx.to_string().contains("Failed to load chain"));
    }

    #[test]
    fn test_pipeline_error_converts() {
        let res: std::result::Result<(), PipelineError> =
            Err(PipelineError::Config("bad".to_string()));
        let err = res.context("building pipeline").unwrap_err();
        assert!(err.to_string().starts_with("building pipeline"));
    }
}
