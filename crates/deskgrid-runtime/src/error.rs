//! Runtime client error types.
//!
//! Transport failures of every kind (connect, TLS, timeout, non-2xx) are
//! folded into [`RuntimeError::Unavailable`] at the client boundary so
//! callers never match on transport-specific errors.

use thiserror::Error;

/// Errors surfaced by the runtime client pool.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Bad or missing server configuration. Fatal at construction; never
    /// produced by a network failure.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server's runtime daemon could not serve the request. Transient
    /// and safe to retry against a different server.
    #[error("runtime unavailable on server {server_id}: {cause}")]
    Unavailable { server_id: String, cause: String },
}

impl RuntimeError {
    pub fn unavailable(server_id: &str, cause: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            server_id: server_id.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Originating server, for `Unavailable` errors.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Unavailable { server_id, .. } => Some(server_id),
            Self::Configuration(_) => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
