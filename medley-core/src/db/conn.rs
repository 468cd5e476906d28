//! Pooled connection: query queues, bulk-statement packing and the driver
//! loop around the backend state machine.
//!
//! One lock guards both the pending and the processing queue together with
//! the bulk buffer; the `has_ready_query_to_process` flag is release-stored
//! under that lock so fast-path readers may check it lock-free.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::DbError;
use super::backend::{ConnEvent, ConnectionBackend, StepDirective, StepQueues};
use super::query::Query;
use crate::timer_poll::{PollOutcome, TimerPoll};

/// Outcome of one bulk-pack attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    /// `moved` queries migrated from pending to processing; their statement
    /// bytes occupy `wr_sz` bytes of the bulk buffer.
    Packed { wr_sz: usize, moved: usize },
    /// Nothing to do: the processing list is still busy, or pending is empty.
    Skipped,
}

/// Outcome of a close attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The state machine was poked toward `Closed`.
    Closing,
    /// The connection was already closed; nothing was mutated.
    Skipped,
}

#[derive(Debug)]
struct ConnQueues {
    pending: VecDeque<Arc<Query>>,
    processing: VecDeque<Arc<Query>>,
    /// Concatenated statement bytes of the processing batch plus a trailing
    /// NUL. The NUL is never counted in `wr_sz`.
    bulk: Box<[u8]>,
    wr_sz: usize,
}

/// One pooled connection. Cheap to share; every mutating entry point locks
/// internally.
#[derive(Debug)]
pub struct Connection {
    queues: Mutex<ConnQueues>,
    backend: Mutex<Box<dyn ConnectionBackend>>,
    timer_poll: tokio::sync::Mutex<TimerPoll>,
    state_changing: AtomicBool,
    has_ready_query_to_process: AtomicBool,
    bulk_limit_bytes: usize,
}

struct QueuesView<'a>(&'a Connection);

impl StepQueues for QueuesView<'_> {
    fn packed_statements(&self) -> Vec<u8> {
        let q = self.0.queues.lock().unwrap();
        q.bulk[..q.wr_sz].to_vec()
    }

    fn current_query(&self) -> Option<Arc<Query>> {
        self.0.queues.lock().unwrap().processing.front().cloned()
    }

    fn evict_current_processing_query(&self) -> Result<(), DbError> {
        self.0.try_evict_current_processing_query()
    }
}

impl Connection {
    pub(crate) fn new(
        bulk_limit_bytes: usize,
        backend: Box<dyn ConnectionBackend>,
    ) -> Result<Self, DbError> {
        if bulk_limit_bytes == 0 {
            return Err(DbError::Arg);
        }
        let mut backend = backend;
        backend.conn_init()?;
        Ok(Self {
            queues: Mutex::new(ConnQueues {
                pending: VecDeque::new(),
                processing: VecDeque::new(),
                // one extra byte reserved for the NUL terminator
                bulk: vec![0u8; bulk_limit_bytes + 1].into_boxed_slice(),
                wr_sz: 0,
            }),
            backend: Mutex::new(backend),
            timer_poll: tokio::sync::Mutex::new(TimerPoll::default()),
            state_changing: AtomicBool::new(false),
            has_ready_query_to_process: AtomicBool::new(false),
            bulk_limit_bytes,
        })
    }

    /// Append a query to the tail of the pending list.
    pub fn append_pending_query(&self, query: Arc<Query>) {
        let mut q = self.queues.lock().unwrap();
        q.pending.push_back(Arc::clone(&query));
        drop(q);
        self.backend.lock().unwrap().notify_query(&query);
    }

    /// Move a prefix of the pending list into the processing list and pack
    /// the concatenation of their statements into the bulk buffer.
    ///
    /// Skips when the processing list has not drained yet; the state driver
    /// re-checks pending work once the current batch completes. The walk is
    /// FIFO and stops at the first query whose inclusion would meet or
    /// exceed the byte limit - the final byte of the buffer is reserved for
    /// the NUL terminator, which is appended but never counted in `wr_sz`.
    pub fn update_ready_queries(&self) -> Result<PackOutcome, DbError> {
        let mut q = self.queues.lock().unwrap();
        if !q.processing.is_empty() {
            return Ok(PackOutcome::Skipped);
        }
        let limit = self.bulk_limit_bytes;
        let mut total = 0usize;
        let mut take = 0usize;
        for query in q.pending.iter() {
            let sz = query.statement().len();
            debug_assert!(sz <= limit);
            if total + sz >= limit {
                break;
            }
            total += sz;
            take += 1;
        }
        q.wr_sz = 0;
        for _ in 0..take {
            let Some(query) = q.pending.pop_front() else {
                break;
            };
            let stmt = query.statement();
            let at = q.wr_sz;
            q.bulk[at..at + stmt.len()].copy_from_slice(stmt);
            q.wr_sz += stmt.len();
            q.processing.push_back(query);
        }
        let at = q.wr_sz;
        q.bulk[at] = 0x0;
        let has_work = !q.processing.is_empty();
        // release-store pairs with the relaxed fast-path load in
        // try_process_queries
        self.has_ready_query_to_process
            .store(has_work, Ordering::Release);
        drop(q);
        if has_work {
            Ok(PackOutcome::Packed {
                wr_sz: total,
                moved: take,
            })
        } else {
            Ok(PackOutcome::Skipped)
        }
    }

    /// Head of the processing list, falling back to the pending head.
    pub fn first_query(&self) -> Option<Arc<Query>> {
        let q = self.queues.lock().unwrap();
        q.processing.front().or_else(|| q.pending.front()).cloned()
    }

    /// Decrement the remaining-result-set counter of the processing head,
    /// detaching the head once it reaches zero. Fails with
    /// [`DbError::Memory`] when the processing list is empty.
    pub fn try_evict_current_processing_query(&self) -> Result<(), DbError> {
        let head = {
            let q = self.queues.lock().unwrap();
            q.processing.front().cloned().ok_or(DbError::Memory)?
        };
        if head.consume_result_set() == 0 {
            let mut q = self.queues.lock().unwrap();
            let still_head = q
                .processing
                .front()
                .is_some_and(|curr| Arc::ptr_eq(curr, &head));
            if still_head {
                q.processing.pop_front();
            }
        }
        Ok(())
    }

    /// Depths of the (pending, processing) queues.
    pub fn queue_depths(&self) -> (usize, usize) {
        let q = self.queues.lock().unwrap();
        (q.pending.len(), q.processing.len())
    }

    /// Copy of the packed statement bytes and their size.
    pub fn bulk_snapshot(&self) -> (Vec<u8>, usize) {
        let q = self.queues.lock().unwrap();
        (q.bulk[..=q.wr_sz].to_vec(), q.wr_sz)
    }

    /// Whether a state transition may be started right now.
    pub fn can_change_state(&self) -> bool {
        !self.state_changing.load(Ordering::Acquire) && self.backend.lock().unwrap().can_change_state()
    }

    /// Whether the connection is fully down: the backend state machine
    /// reports `Closed` and the fused timer-poll has released its handles.
    pub fn is_closed(&self) -> bool {
        let backend_closed = self.backend.lock().unwrap().is_conn_closed();
        let tp_down = match self.timer_poll.try_lock() {
            Ok(tp) => !tp.is_armed() && !tp.is_closing(),
            Err(_) => false,
        };
        backend_closed && tp_down
    }

    /// Kick the connection so pending queries get processed.
    ///
    /// Fast path: when the ready flag is already set the state driver is
    /// guaranteed to pick pending work up on its own, so this returns
    /// without doing anything. Otherwise it yields briefly until the fused
    /// timer-poll is fully down, then drives the state machine in
    /// application-call mode.
    pub async fn try_process_queries(self: &Arc<Self>) -> Result<(), DbError> {
        if self.has_ready_query_to_process.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.yield_until_timer_poll_down().await;
        if self.can_change_state() {
            self.run_state_machine(ConnEvent::AppPoke).await?;
        }
        Ok(())
    }

    /// Advance the state machine toward `Closed`. Returns
    /// [`CloseOutcome::Skipped`] without mutating anything when the
    /// connection is already down.
    pub async fn try_close(self: &Arc<Self>) -> Result<CloseOutcome, DbError> {
        if self.is_closed() {
            return Ok(CloseOutcome::Skipped);
        }
        if !self.can_change_state() {
            return Err(DbError::ConnectionBusy);
        }
        self.run_state_machine(ConnEvent::Close).await?;
        Ok(CloseOutcome::Closing)
    }

    /// Release driver state. The caller closes the connection first; tearing
    /// down with queued queries is refused.
    pub fn deinit(&self) -> Result<(), DbError> {
        {
            let q = self.queues.lock().unwrap();
            if !q.pending.is_empty() || !q.processing.is_empty() {
                return Err(DbError::ConnectionBusy);
            }
        }
        self.backend.lock().unwrap().conn_deinit()
    }

    async fn yield_until_timer_poll_down(&self) {
        loop {
            let down = match self.timer_poll.try_lock() {
                Ok(tp) => !tp.is_armed() && !tp.is_closing(),
                Err(_) => false,
            };
            if down {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn run_state_machine(self: &Arc<Self>, first: ConnEvent) -> Result<(), DbError> {
        if self
            .state_changing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // another task is already driving; it will observe our work
            return Ok(());
        }
        let result = self.drive(first).await;
        // release the watcher whatever happened, so the next
        // application-mode call observes a closed timer-poll
        {
            let mut tp = self.timer_poll.lock().await;
            if tp.is_armed() {
                let _ = tp.deinit();
            }
        }
        self.has_ready_query_to_process
            .store(false, Ordering::Release);
        self.state_changing.store(false, Ordering::Release);
        result
    }

    async fn drive(self: &Arc<Self>, first: ConnEvent) -> Result<(), DbError> {
        let mut event = first;
        loop {
            let directive = {
                let view = QueuesView(self.as_ref());
                self.backend.lock().unwrap().step(&view, event)?
            };
            match directive {
                StepDirective::Continue => event = ConnEvent::AppPoke,
                StepDirective::WaitIo(interest) => {
                    let (fd, timeout_ms) = {
                        let b = self.backend.lock().unwrap();
                        (b.sock_fd(), b.timeout_ms())
                    };
                    let mut tp = self.timer_poll.lock().await;
                    if !tp.is_armed() {
                        tp.rearm(fd).map_err(|e| {
                            warn!(error = %e, "failed to arm timer-poll on backend socket");
                            DbError::Os
                        })?;
                    }
                    let outcome = tp
                        .wait(Duration::from_millis(timeout_ms), interest)
                        .await
                        .map_err(|_| DbError::Os)?;
                    drop(tp);
                    event = match outcome {
                        PollOutcome::Ready(()) => ConnEvent::Io,
                        PollOutcome::TimedOut => ConnEvent::Timeout,
                    };
                }
                StepDirective::Yield => match self.update_ready_queries()? {
                    PackOutcome::Packed { wr_sz, moved } => {
                        debug!(wr_sz, moved, "packed next query batch");
                        event = ConnEvent::AppPoke;
                    }
                    PackOutcome::Skipped => break,
                },
                StepDirective::Closed => {
                    let mut tp = self.timer_poll.lock().await;
                    if tp.is_armed() {
                        let _ = tp.stop();
                        let _ = tp.deinit();
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query::{Query, QueryConfig};
    use crate::db::testutil::NullBackend;

    const ONE_KIB: usize = 1024;

    fn conn_1kib() -> Connection {
        Connection::new(ONE_KIB, Box::new(NullBackend::new())).unwrap()
    }

    fn push_query(conn: &Connection, statement: Vec<u8>, num_rs: usize) -> Arc<Query> {
        let query = Arc::new(Query::new(QueryConfig {
            statement,
            num_result_sets: num_rs,
            ..Default::default()
        }));
        conn.append_pending_query(Arc::clone(&query));
        query
    }

    #[test]
    fn pack_stops_strictly_below_limit() {
        // eleven identical 95-byte statements against a 1 KiB buffer: ten
        // fit below the limit, the eleventh stays pending
        let conn = conn_1kib();
        let stmt = vec![b'q'; 95];
        for _ in 0..11 {
            push_query(&conn, stmt.clone(), 1);
        }
        let outcome = conn.update_ready_queries().unwrap();
        assert_eq!(
            outcome,
            PackOutcome::Packed {
                wr_sz: 950,
                moved: 10
            }
        );
        assert_eq!(conn.queue_depths(), (1, 10));

        // processing still busy: a second pack attempt skips
        assert_eq!(conn.update_ready_queries().unwrap(), PackOutcome::Skipped);

        // drain the batch, then the lone leftover packs
        for _ in 0..10 {
            conn.try_evict_current_processing_query().unwrap();
        }
        assert_eq!(conn.queue_depths(), (1, 0));
        let outcome = conn.update_ready_queries().unwrap();
        assert_eq!(outcome, PackOutcome::Packed { wr_sz: 95, moved: 1 });
        assert_eq!(conn.queue_depths(), (0, 1));
    }

    #[test]
    fn pack_concatenates_in_submission_order() {
        let conn = conn_1kib();
        let statements: Vec<Vec<u8>> = [95usize, 71, 51, 37]
            .iter()
            .enumerate()
            .map(|(i, sz)| vec![b'a' + i as u8; *sz])
            .collect();
        for stmt in &statements {
            push_query(&conn, stmt.clone(), 1);
        }
        let outcome = conn.update_ready_queries().unwrap();
        assert_eq!(outcome, PackOutcome::Packed { wr_sz: 254, moved: 4 });

        let (bulk, wr_sz) = conn.bulk_snapshot();
        assert_eq!(wr_sz, 254);
        let expected: Vec<u8> = statements.concat();
        assert_eq!(&bulk[..wr_sz], &expected[..]);
        // the NUL terminator sits past the packed bytes and is not counted
        assert_eq!(bulk[wr_sz], 0x0);
    }

    #[test]
    fn evict_detaches_only_at_zero_remaining() {
        let conn = conn_1kib();
        let query = push_query(&conn, b"SELECT 1;".to_vec(), 5);
        assert!(matches!(
            conn.update_ready_queries().unwrap(),
            PackOutcome::Packed { moved: 1, .. }
        ));

        for expected_remaining in [4usize, 3, 2, 1] {
            conn.try_evict_current_processing_query().unwrap();
            assert_eq!(query.num_result_sets_remaining(), expected_remaining);
            let head = conn.first_query().unwrap();
            assert!(Arc::ptr_eq(&head, &query));
            assert_eq!(conn.queue_depths(), (0, 1));
        }
        conn.try_evict_current_processing_query().unwrap();
        assert_eq!(conn.queue_depths(), (0, 0));

        // eviction against an empty processing list is a memory error
        assert_eq!(
            conn.try_evict_current_processing_query(),
            Err(DbError::Memory)
        );
    }

    #[test]
    fn pack_with_empty_pending_skips() {
        let conn = conn_1kib();
        assert_eq!(conn.update_ready_queries().unwrap(), PackOutcome::Skipped);
    }

    #[test]
    fn statement_just_below_limit_packs() {
        let conn = conn_1kib();
        push_query(&conn, vec![b'x'; ONE_KIB - 1], 1);
        let outcome = conn.update_ready_queries().unwrap();
        assert_eq!(
            outcome,
            PackOutcome::Packed {
                wr_sz: ONE_KIB - 1,
                moved: 1
            }
        );
        let (bulk, wr_sz) = conn.bulk_snapshot();
        assert_eq!(wr_sz, ONE_KIB - 1);
        assert_eq!(bulk[wr_sz], 0x0);
    }

    #[test]
    fn statement_meeting_limit_stops_the_pack() {
        // the walk stops strictly below the limit, reserving room for the
        // NUL terminator; equality is treated the same as overflow
        let conn = conn_1kib();
        push_query(&conn, vec![b'x'; ONE_KIB], 1);
        assert_eq!(conn.update_ready_queries().unwrap(), PackOutcome::Skipped);
        assert_eq!(conn.queue_depths(), (1, 0));
    }

    #[tokio::test]
    async fn try_close_is_idempotent() {
        let conn = Arc::new(conn_1kib());
        assert_eq!(conn.try_close().await.unwrap(), CloseOutcome::Closing);
        assert!(conn.is_closed());
        // a second close must not mutate anything
        assert_eq!(conn.try_close().await.unwrap(), CloseOutcome::Skipped);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn process_drains_pending_batches() {
        let conn = Arc::new(conn_1kib());
        let query = push_query(&conn, b"SELECT col FROM t;".to_vec(), 2);
        conn.try_process_queries().await.unwrap();
        assert_eq!(conn.queue_depths(), (0, 0));
        assert_eq!(query.num_result_sets_remaining(), 0);
    }
}
