//! Error types for nwb-stream.

use thiserror::Error;

/// Main error type for session loading and analysis.
#[derive(Error, Debug)]
pub enum Error {
    /// Locator matches neither the reference-descriptor nor the direct-object pattern
    #[error("Unrecognized locator: {0:?}")]
    UnrecognizedLocator(String),

    /// Remote byte source unreachable, or the requested range does not exist
    #[error("Remote fetch failed for {resource}: {reason}")]
    RemoteFetch { resource: String, reason: String },

    /// Bytes do not parse as a valid hierarchical container
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// Well-known substructure requested but absent from this file
    #[error("Missing substructure: {0}")]
    MissingSubstructure(String),

    /// Path does not name a node in the container
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node exists but is of the wrong kind or type
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Local cache store failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a malformed-container error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedContainer(msg.into())
    }

    /// Create a remote fetch error for a resource.
    pub fn fetch(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RemoteFetch {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing-substructure error.
    pub fn missing(what: impl Into<String>) -> Self {
        Self::MissingSubstructure(what.into())
    }

    /// Create a type mismatch error.
    pub fn mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// True for transport-level failures a caller may choose to retry.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteFetch { .. })
    }
}

/// Result type alias for nwb-stream operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::UnrecognizedLocator("foo.txt".into());
        assert!(e.to_string().contains("foo.txt"));

        let e = Error::fetch("https://example.org/a.nwb", "connection refused");
        assert!(e.to_string().contains("example.org"));
        assert!(e.to_string().contains("connection refused"));
        assert!(e.is_remote());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_remote());
    }
}
