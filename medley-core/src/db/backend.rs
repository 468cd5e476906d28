//! Backend contract of the connection state machine.
//!
//! A backend owns the driver-specific connection state (socket, handshake,
//! wire protocol) and advances it one transition at a time through
//! [`ConnectionBackend::step`]. The pool and the connection object never
//! look inside; they only schedule steps and carry the packed statement
//! bytes back and forth.

use std::os::fd::RawFd;
use std::sync::Arc;

use tokio::io::Interest;

use super::DbError;
use super::query::Query;

/// States a connection moves through. `ResultReady` repeats once per result
/// set of the current bulk send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Initialized,
    Connecting,
    Idle,
    Querying,
    ResultReady,
    /// The remote end dropped; in-flight queries are surfaced through their
    /// error callback and re-issue is the caller's decision.
    ReconnectPending,
    Closing,
    Closed,
}

/// What triggered the current transition. The same `step` entry point serves
/// I/O wakes, timer expiry, application pokes and close requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// The fused timer-poll reported readiness on the backend socket.
    Io,
    /// Application-internal call (no I/O happened).
    AppPoke,
    /// The fused timer-poll expired before the socket became ready.
    Timeout,
    /// Advance toward `Closed` regardless of queued work.
    Close,
}

/// What the connection driver should do after a transition returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirective {
    /// Another internal transition is pending; step again immediately.
    Continue,
    /// Arm the fused timer-poll for the given interest on the backend
    /// socket and feed the outcome back as `Io` or `Timeout`.
    WaitIo(Interest),
    /// The connection is idle; the driver re-checks for pending queries.
    Yield,
    /// The state machine reached `Closed`.
    Closed,
}

/// Queue operations a backend may perform mid-transition. Implemented by the
/// connection object; handed to `step` so the backend can consume packed
/// statements and publish result sets without owning the queues.
pub trait StepQueues: Send + Sync {
    /// The packed statement bytes of the current bulk send (`wr_sz` bytes,
    /// NUL terminator excluded).
    fn packed_statements(&self) -> Vec<u8>;

    /// Head of the processing list, if any.
    fn current_query(&self) -> Option<Arc<Query>>;

    /// Decrement the current query's remaining-result-set counter, detaching
    /// it from the processing list when the counter reaches zero.
    fn evict_current_processing_query(&self) -> Result<(), DbError>;
}

/// Driver-specific half of a pooled connection.
pub trait ConnectionBackend: Send + std::fmt::Debug {
    /// Prepare driver state. Called once per connection at pool init.
    fn conn_init(&mut self) -> Result<(), DbError>;

    /// Release driver state. Called at pool teardown.
    fn conn_deinit(&mut self) -> Result<(), DbError>;

    /// Whether a transition may be started right now (no other transition
    /// in flight inside the driver).
    fn can_change_state(&self) -> bool;

    /// Current machine state.
    fn state(&self) -> ConnState;

    /// True once the machine reached `Closed`.
    fn is_conn_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Per-operation I/O timeout.
    fn timeout_ms(&self) -> u64;

    /// Socket to arm the fused timer-poll against. Only meaningful while
    /// the machine is past `Connecting`.
    fn sock_fd(&self) -> RawFd;

    /// A query was appended to the pending list while the machine was busy;
    /// backends may use this to coalesce wakeups.
    fn notify_query(&mut self, _query: &Arc<Query>) {}

    /// Advance the machine one transition.
    fn step(&mut self, queues: &dyn StepQueues, event: ConnEvent) -> Result<StepDirective, DbError>;
}
