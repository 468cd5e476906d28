//! Shared backend doubles for the pool and connection unit tests.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::DbError;
use super::backend::{ConnEvent, ConnState, ConnectionBackend, StepDirective, StepQueues};

/// A backend that connects instantly, never touches a socket and closes on
/// request. Enough to exercise queue packing and lifecycle paths.
#[derive(Debug)]
pub(crate) struct NullBackend {
    state: ConnState,
    pub(crate) steps: Arc<AtomicUsize>,
}

impl NullBackend {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnState::Initialized,
            steps: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ConnectionBackend for NullBackend {
    fn conn_init(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn conn_deinit(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn can_change_state(&self) -> bool {
        true
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_ms(&self) -> u64 {
        50
    }

    fn sock_fd(&self) -> RawFd {
        -1
    }

    fn step(&mut self, queues: &dyn StepQueues, event: ConnEvent) -> Result<StepDirective, DbError> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        if event == ConnEvent::Close {
            self.state = ConnState::Closed;
            return Ok(StepDirective::Closed);
        }
        let directive = match self.state {
            ConnState::Initialized => {
                self.state = ConnState::Connecting;
                StepDirective::Continue
            }
            ConnState::Connecting => {
                self.state = ConnState::Idle;
                StepDirective::Yield
            }
            ConnState::Idle => {
                // a packed batch means the driver asked us to send it;
                // resolve it instantly with one empty result set per query
                let packed = queues.packed_statements();
                if packed.is_empty() {
                    StepDirective::Yield
                } else {
                    while let Some(query) = queues.current_query() {
                        while query.num_result_sets_remaining() > 0 {
                            query.dispatch_result(Default::default());
                            queues.evict_current_processing_query()?;
                        }
                        if queues
                            .current_query()
                            .is_some_and(|next| Arc::ptr_eq(&next, &query))
                        {
                            // zero-result-set query: evict detaches directly
                            queues.evict_current_processing_query()?;
                        }
                    }
                    StepDirective::Yield
                }
            }
            ConnState::Closed => StepDirective::Closed,
            _ => StepDirective::Yield,
        };
        Ok(directive)
    }
}
