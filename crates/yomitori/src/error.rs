//! Error types for Yomitori.
//!
//! All fallible operations return [`Result`]. The taxonomy follows the
//! pipeline's propagation policy:
//!
//! - `Io` (from `std::io::Error`) always bubbles up unchanged — system
//!   errors need user reports.
//! - `Render` and `Engine` abort a page job when they occur during a
//!   mandatory stage (rasterization, primary OCR). The same `Engine` error
//!   raised inside a recovery or chunk sub-call is logged and swallowed by
//!   the stage that issued the sub-call.
//! - `Canceled` is not a failure: it signals clean teardown of a page job.
//!   No cache write happens after it is observed.
//! - `Cache` is non-fatal everywhere; the background flush task retries.
use thiserror::Error;

/// Result type alias using `YomitoriError`.
pub type Result<T> = std::result::Result<T, YomitoriError>;

/// Main error type for all Yomitori operations.
#[derive(Debug, Error)]
pub enum YomitoriError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Render error: {message}")]
    Render {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("OCR engine error: {message}")]
    Engine {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("job canceled")]
    Canceled,

    #[error("{0}")]
    Other(String),
}

impl YomitoriError {
    /// Create a Render error
    pub fn render<S: Into<String>>(message: S) -> Self {
        Self::Render {
            message: message.into(),
            source: None,
        }
    }

    /// Create an Engine error
    pub fn engine<S: Into<String>>(message: S) -> Self {
        Self::Engine {
            message: message.into(),
            source: None,
        }
    }

    /// Create an Engine error with source
    pub fn engine_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Engine {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a Cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a Serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a Validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            source: None,
        }
    }

    /// True when the error signals cooperative cancellation rather than a
    /// genuine failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<serde_json::Error> for YomitoriError {
    fn from(err: serde_json::Error) -> Self {
        YomitoriError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<rmp_serde::encode::Error> for YomitoriError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        YomitoriError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<rmp_serde::decode::Error> for YomitoriError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        YomitoriError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
