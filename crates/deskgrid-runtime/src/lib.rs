//! deskgrid-runtime — one long-lived client per workspace server.
//!
//! Each server exposes a Docker-compatible Engine API, reachable over plain
//! HTTP or mutually-authenticated TLS. The [`ClientPool`] hides that
//! difference behind [`RuntimeBackend`].
//!
//! # Architecture
//!
//! ```text
//! ClientPool (server_id → Arc<dyn RuntimeBackend>)
//!   └── DockerClient
//!         ├── reqwest::Client (keep-alive, per-call timeout)
//!         ├── Semaphore (bounded calls in flight per daemon)
//!         └── TlsBundle (ca.pem / cert.pem / key.pem, validated up front)
//! ```
//!
//! Construction errors are [`RuntimeError::Configuration`]; everything that
//! goes wrong on the wire is [`RuntimeError::Unavailable`].

pub mod client;
pub mod error;
pub mod pool;
pub mod tls;
pub mod types;

pub use client::{DockerClient, RuntimeBackend};
pub use error::{RuntimeError, RuntimeResult};
pub use pool::{ClientPool, PoolConfig, duration_str};
pub use tls::TlsBundle;
pub use types::{ContainerSpec, ContainerStats, DaemonInfo, ExecResult};
