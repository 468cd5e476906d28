//! Database connection pool and query pipeline.
//!
//! The pool owns a fixed number of connections per alias, admits queries,
//! packs statements into bulk sends and drives one state machine per
//! connection over a pluggable [`backend::ConnectionBackend`]. The pool
//! never inspects backend internals; everything backend-specific happens
//! inside the backend's `step`.
//!
//! Registries of pools are owned by the application context (see
//! [`pool::PoolRegistry`]); there is no process-wide singleton.

pub mod backend;
pub mod conn;
pub mod pool;
pub mod query;

#[cfg(test)]
pub(crate) mod testutil;

use thiserror::Error;

pub use backend::{ConnEvent, ConnState, ConnectionBackend, StepDirective};
pub use conn::{CloseOutcome, Connection, PackOutcome};
pub use pool::{Pool, PoolConfig, PoolRegistry};
pub use query::{Query, QueryCallbacks, QueryConfig, QueryResult, query_start};

/// Uniform per-operation result codes of the DB layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbError {
    /// Caller contract breach: missing field, oversized statement, misuse.
    #[error("invalid argument")]
    Arg,

    /// Allocation failure or duplicate-key insertion into a unique registry.
    #[error("memory error or duplicate registry key")]
    Memory,

    /// The pool is closing or has no free connection.
    #[error("pool busy")]
    PoolBusy,

    /// The connection cannot change state right now.
    #[error("connection busy")]
    ConnectionBusy,

    /// Syscall or driver-level failure.
    #[error("os error")]
    Os,
}
