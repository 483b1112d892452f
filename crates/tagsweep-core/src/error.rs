//! Error types for cache backend operations.

/// Errors a cache backend can report while being swept.
///
/// None of these abort a sweep; the executor logs them, counts them in the
/// report and moves on to the next key or backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// A stored value could not be decoded into a cache item.
    #[error("Invalid item at {key}: {message}")]
    InvalidItem {
        /// Key of the undecodable item.
        key: String,
        /// Why decoding failed.
        message: String,
    },

    /// Any other backend failure.
    #[error("Backend error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl BackendError {
    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidItem` error.
    #[must_use]
    pub fn invalid_item(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidItem {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {e}"))
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
