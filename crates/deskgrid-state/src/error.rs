//! Error types for the deskgrid state store and registry.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Errors raised by the in-memory registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server already registered: {0}")]
    DuplicateServer(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server {server_id} still hosts {count} workspace(s); migrate them first")]
    ServerHasWorkspaces { server_id: String, count: u32 },

    #[error("server {0} has no residual capacity for this allocation")]
    CapacityExhausted(String),

    #[error("reservation {0} is not pending")]
    ReservationNotFound(u64),

    #[error("counter {field} on server {server_id} would underflow")]
    CounterUnderflow {
        server_id: String,
        field: &'static str,
    },

    #[error("state store error: {0}")]
    Store(#[from] StateError),
}
