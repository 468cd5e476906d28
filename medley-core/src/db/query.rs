//! Query objects and submission.
//!
//! A query carries immutable parameters (statement bytes, expected number of
//! result sets, user data, completion callbacks) plus a mutable result-set
//! FIFO guarded by its own lock, so result delivery never contends with the
//! connection's queue lock.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::DbError;
use super::pool::Pool;

/// One remote result set (or a remote error) delivered to a query.
#[derive(Debug, Default, Clone)]
pub struct QueryResult {
    /// True on the last result set of the statement batch.
    pub is_final: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Remote diagnostic detail; presence routes the result through the
    /// `error` callback instead of `result_ready`.
    pub error: Option<String>,
}

type QueryCb = Box<dyn Fn(&Query, &QueryResult) + Send + Sync>;

/// Completion callbacks of a query. All of them run on the connection's
/// driver task.
pub struct QueryCallbacks {
    pub result_ready: QueryCb,
    pub row_fetched: QueryCb,
    pub result_free: QueryCb,
    pub error: QueryCb,
}

impl fmt::Debug for QueryCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCallbacks").finish_non_exhaustive()
    }
}

impl Default for QueryCallbacks {
    fn default() -> Self {
        Self {
            result_ready: Box::new(|_, _| {}),
            row_fetched: Box::new(|_, _| {}),
            result_free: Box::new(|_, _| {}),
            error: Box::new(|_, _| {}),
        }
    }
}

/// Immutable submission parameters.
#[derive(Default)]
pub struct QueryConfig {
    /// Raw SQL bytes of one or more `;`-separated statements. Stored
    /// NUL-free; the connection appends the terminator when packing.
    pub statement: Vec<u8>,
    /// Number of result sets the statements are expected to produce.
    pub num_result_sets: usize,
    /// Opaque user data threaded through to the callbacks.
    pub user_data: Vec<Arc<dyn Any + Send + Sync>>,
    pub callbacks: QueryCallbacks,
}

impl fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("statement_len", &self.statement.len())
            .field("num_result_sets", &self.num_result_sets)
            .field("user_data_len", &self.user_data.len())
            .finish_non_exhaustive()
    }
}

/// A submitted query. Owned by the connection queues until evicted.
#[derive(Debug)]
pub struct Query {
    cfg: QueryConfig,
    result_queue: Mutex<VecDeque<QueryResult>>,
    num_rs_remain: AtomicUsize,
}

impl Query {
    pub(crate) fn new(cfg: QueryConfig) -> Self {
        let num_rs = cfg.num_result_sets;
        Self {
            cfg,
            result_queue: Mutex::new(VecDeque::new()),
            num_rs_remain: AtomicUsize::new(num_rs),
        }
    }

    pub fn statement(&self) -> &[u8] {
        &self.cfg.statement
    }

    pub fn user_data(&self) -> &[Arc<dyn Any + Send + Sync>] {
        &self.cfg.user_data
    }

    pub fn num_result_sets_remaining(&self) -> usize {
        self.num_rs_remain.load(Ordering::Acquire)
    }

    /// Decrement the remaining-result-set counter, saturating at zero.
    /// Returns the new value.
    pub(crate) fn consume_result_set(&self) -> usize {
        let mut curr = self.num_rs_remain.load(Ordering::Acquire);
        loop {
            if curr == 0 {
                return 0;
            }
            match self.num_rs_remain.compare_exchange(
                curr,
                curr - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return curr - 1,
                Err(seen) => curr = seen,
            }
        }
    }

    /// Append a result set to the FIFO.
    pub fn enqueue_result_set(&self, rs: QueryResult) {
        self.result_queue.lock().unwrap().push_back(rs);
    }

    /// Pop the oldest queued result set.
    pub fn dequeue_result_set(&self) -> Option<QueryResult> {
        self.result_queue.lock().unwrap().pop_front()
    }

    /// Deliver a result set through the query's callbacks: `result_ready`
    /// first, `row_fetched` per row, then `result_free` - or `error` when
    /// the set carries remote diagnostic detail.
    pub fn dispatch_result(&self, rs: QueryResult) {
        if rs.error.is_some() {
            (self.cfg.callbacks.error)(self, &rs);
            return;
        }
        (self.cfg.callbacks.result_ready)(self, &rs);
        for _ in &rs.rows {
            (self.cfg.callbacks.row_fetched)(self, &rs);
        }
        (self.cfg.callbacks.result_free)(self, &rs);
    }
}

/// Submit a query to a pool.
///
/// Acquires one free connection, validates the statement against the
/// connection's pre-sized bulk buffer, appends a query node to the pending
/// list under the connection lock, then kicks the connection outside the
/// lock. Fails with [`DbError::PoolBusy`] while the pool is closing or
/// saturated, and with [`DbError::Arg`] when the statement would not fit the
/// bulk buffer (statements whose size meets or exceeds the limit are
/// rejected here, not at pack time).
pub async fn query_start(pool: &Arc<Pool>, cfg: QueryConfig) -> Result<Arc<Query>, DbError> {
    if cfg.statement.is_empty() {
        return Err(DbError::Arg);
    }
    if pool.is_closing() {
        return Err(DbError::PoolBusy);
    }
    let conn = pool.acquire_free_conn().ok_or(DbError::PoolBusy)?;
    let limit = pool.bulk_query_limit_bytes();
    if cfg.statement.len() >= limit {
        pool.release_used_conn(&conn);
        return Err(DbError::Arg);
    }
    let query = Arc::new(Query::new(cfg));
    conn.append_pending_query(Arc::clone(&query));
    pool.release_used_conn(&conn);
    conn.try_process_queries().await?;
    Ok(query)
}
