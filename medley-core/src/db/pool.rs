//! Connection pools and the application-owned pool registry.
//!
//! The registry keeps its pools sorted by strictly descending alias length
//! (ties in insertion order). Clients that resolve a pool by table-name
//! prefix rely on that ordering: the first alias that prefixes the name is
//! the longest one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use super::DbError;
use super::backend::ConnectionBackend;
use super::conn::{CloseOutcome, Connection};

/// Connectivity detail of a pool. The concrete driver interprets it; the
/// pool only validates presence.
#[derive(Debug, Clone, Default)]
pub struct DbCredentials {
    pub db_name: String,
    pub db_user: String,
    pub db_passwd: String,
    pub db_host: String,
    pub db_port: u16,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Unique key of the pool in its registry.
    pub alias: String,
    /// Number of connections created eagerly at init.
    pub capacity: usize,
    pub idle_timeout: Duration,
    /// Upper bound (KiB) of one bulk statement send per connection.
    pub bulk_query_limit_kb: usize,
    pub credentials: DbCredentials,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            capacity: 1,
            idle_timeout: Duration::from_secs(60),
            bulk_query_limit_kb: 4,
            credentials: DbCredentials::default(),
        }
    }
}

/// Produces the driver half of each pooled connection.
pub type BackendFactory = dyn Fn(&PoolConfig) -> Box<dyn ConnectionBackend> + Send + Sync;

/// Outcome of a registry-wide teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinitOutcome {
    Done,
    /// The registry was already empty.
    Skipped,
}

/// A fixed set of connections sharing one alias.
#[derive(Debug)]
pub struct Pool {
    cfg: PoolConfig,
    closing: AtomicBool,
    conns: Vec<Arc<Connection>>,
    free: Mutex<VecDeque<usize>>,
}

impl Pool {
    fn init(cfg: PoolConfig, factory: &BackendFactory) -> Result<Arc<Self>, DbError> {
        let cred = &cfg.credentials;
        if cfg.alias.is_empty()
            || cfg.capacity == 0
            || cfg.idle_timeout.is_zero()
            || cfg.bulk_query_limit_kb == 0
            || cred.db_name.is_empty()
            || cred.db_user.is_empty()
            || cred.db_host.is_empty()
            || cred.db_port == 0
        {
            return Err(DbError::Arg);
        }
        let mut conns: Vec<Arc<Connection>> = Vec::with_capacity(cfg.capacity);
        for _ in 0..cfg.capacity {
            match Connection::new(cfg.bulk_query_limit_kb << 10, factory(&cfg)) {
                Ok(conn) => conns.push(Arc::new(conn)),
                Err(err) => {
                    // roll back the connections created so far
                    for conn in &conns {
                        let _ = conn.deinit();
                    }
                    return Err(err);
                }
            }
        }
        let free = (0..cfg.capacity).collect();
        Ok(Arc::new(Self {
            cfg,
            closing: AtomicBool::new(false),
            conns,
            free: Mutex::new(free),
        }))
    }

    pub fn alias(&self) -> &str {
        &self.cfg.alias
    }

    pub fn bulk_query_limit_bytes(&self) -> usize {
        self.cfg.bulk_query_limit_kb << 10
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.conns
    }

    /// Refuse new queries from now on.
    pub fn signal_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Reserve a connection for one submission. `None` when every
    /// connection is reserved by a concurrent submitter.
    pub fn acquire_free_conn(&self) -> Option<Arc<Connection>> {
        let idx = self.free.lock().unwrap().pop_front()?;
        Some(Arc::clone(&self.conns[idx]))
    }

    /// Return a reserved connection to the free set.
    pub fn release_used_conn(&self, conn: &Arc<Connection>) {
        let idx = self
            .conns
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, conn));
        if let Some(idx) = idx {
            self.free.lock().unwrap().push_back(idx);
        }
    }

    /// Best-effort close of every connection. Busy connections are left for
    /// the next sweep.
    pub async fn close_all_conns(&self) {
        for conn in &self.conns {
            match conn.try_close().await {
                Ok(CloseOutcome::Closing) | Ok(CloseOutcome::Skipped) => {}
                Err(err) => {
                    warn!(alias = %self.cfg.alias, error = %err, "connection refused to close");
                }
            }
        }
    }

    /// True iff every connection's state machine reports closed and its
    /// timer-poll has released its handles.
    pub fn check_all_conns_closed(&self) -> bool {
        self.conns.iter().all(|conn| conn.is_closed())
    }

    fn teardown(&self) {
        for conn in &self.conns {
            if let Err(err) = conn.deinit() {
                warn!(alias = %self.cfg.alias, error = %err, "connection deinit failed");
            }
        }
    }
}

/// Application-owned set of pools, keyed by alias.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: RwLock<Vec<Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with `cfg.capacity` eagerly initialized connections and
    /// insert it into the registry, keeping the descending-alias-length
    /// order. A duplicate alias fails with [`DbError::Memory`]; any
    /// per-connection init failure rolls the whole pool back.
    pub fn pool_init(
        &self,
        cfg: PoolConfig,
        factory: &BackendFactory,
    ) -> Result<Arc<Pool>, DbError> {
        if cfg.alias.is_empty() {
            return Err(DbError::Arg);
        }
        {
            let pools = self.pools.read().unwrap();
            if pools.iter().any(|p| p.alias() == cfg.alias) {
                return Err(DbError::Memory);
            }
        }
        let pool = Pool::init(cfg, factory)?;
        let mut pools = self.pools.write().unwrap();
        if pools.iter().any(|p| p.alias() == pool.alias()) {
            return Err(DbError::Memory);
        }
        let at = pools
            .iter()
            .position(|p| p.alias().len() < pool.alias().len())
            .unwrap_or(pools.len());
        pools.insert(at, Arc::clone(&pool));
        info!(alias = %pool.alias(), capacity = pool.cfg.capacity, "database pool registered");
        Ok(pool)
    }

    /// Exact-alias lookup.
    pub fn pool_get(&self, alias: &str) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap()
            .iter()
            .find(|p| p.alias() == alias)
            .cloned()
    }

    /// Longest-prefix lookup: the first pool (in descending alias-length
    /// order) whose alias prefixes `name`.
    pub fn pool_get_by_prefix(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap()
            .iter()
            .find(|p| name.starts_with(p.alias()))
            .cloned()
    }

    /// Remove one pool and release its connections.
    pub fn pool_deinit(&self, alias: &str) -> Result<(), DbError> {
        let pool = {
            let mut pools = self.pools.write().unwrap();
            let at = pools
                .iter()
                .position(|p| p.alias() == alias)
                .ok_or(DbError::Arg)?;
            pools.remove(at)
        };
        pool.signal_closing();
        pool.teardown();
        Ok(())
    }

    /// Tear the whole registry down.
    pub fn map_deinit(&self) -> DeinitOutcome {
        let drained: Vec<Arc<Pool>> = {
            let mut pools = self.pools.write().unwrap();
            pools.drain(..).collect()
        };
        if drained.is_empty() {
            return DeinitOutcome::Skipped;
        }
        for pool in drained {
            pool.signal_closing();
            pool.teardown();
        }
        DeinitOutcome::Done
    }

    /// Set the closing flag on every pool.
    pub fn signal_closing_all(&self) {
        for pool in self.pools.read().unwrap().iter() {
            pool.signal_closing();
        }
    }

    /// Snapshot of the registered aliases in registry order.
    pub fn aliases(&self) -> Vec<String> {
        self.pools
            .read()
            .unwrap()
            .iter()
            .map(|p| p.alias().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query::{QueryConfig, query_start};
    use crate::db::testutil::NullBackend;

    fn cfg(alias: &str, capacity: usize) -> PoolConfig {
        PoolConfig {
            alias: alias.to_string(),
            capacity,
            bulk_query_limit_kb: 1,
            credentials: DbCredentials {
                db_name: "media".into(),
                db_user: "svc".into(),
                db_passwd: "secret".into(),
                db_host: "127.0.0.1".into(),
                db_port: 3306,
            },
            ..Default::default()
        }
    }

    fn factory() -> Box<BackendFactory> {
        Box::new(|_cfg: &PoolConfig| Box::new(NullBackend::new()) as Box<dyn ConnectionBackend>)
    }

    #[test]
    fn init_validates_required_fields() {
        let registry = PoolRegistry::new();
        let f = factory();
        assert_eq!(
            registry.pool_init(cfg("", 2), &f).unwrap_err(),
            DbError::Arg
        );
        assert_eq!(
            registry.pool_init(cfg("nocap", 0), &f).unwrap_err(),
            DbError::Arg
        );
        let mut missing_host = cfg("nohost", 2);
        missing_host.credentials.db_host.clear();
        assert_eq!(
            registry.pool_init(missing_host, &f).unwrap_err(),
            DbError::Arg
        );
    }

    #[test]
    fn duplicate_alias_is_a_memory_error() {
        let registry = PoolRegistry::new();
        let f = factory();
        registry.pool_init(cfg("tbl_usrgrp", 1), &f).unwrap();
        assert_eq!(
            registry.pool_init(cfg("tbl_usrgrp", 1), &f).unwrap_err(),
            DbError::Memory
        );
    }

    #[test]
    fn registry_orders_by_descending_alias_length() {
        let registry = PoolRegistry::new();
        let f = factory();
        for alias in ["ab", "abcdef", "abcd", "xyzw"] {
            registry.pool_init(cfg(alias, 1), &f).unwrap();
        }
        // ties (abcd/xyzw) keep insertion order
        assert_eq!(registry.aliases(), vec!["abcdef", "abcd", "xyzw", "ab"]);
        assert_eq!(registry.pool_get("abcd").unwrap().alias(), "abcd");
        assert!(registry.pool_get("missing").is_none());
    }

    #[test]
    fn prefix_lookup_returns_longest_match() {
        let registry = PoolRegistry::new();
        let f = factory();
        registry.pool_init(cfg("tbl", 1), &f).unwrap();
        registry.pool_init(cfg("tbl_media", 1), &f).unwrap();
        let hit = registry.pool_get_by_prefix("tbl_media_upload_req").unwrap();
        assert_eq!(hit.alias(), "tbl_media");
        let hit = registry.pool_get_by_prefix("tbl_other").unwrap();
        assert_eq!(hit.alias(), "tbl");
        assert!(registry.pool_get_by_prefix("usr_acct").is_none());
    }

    #[test]
    fn init_then_deinit_roundtrips_the_registry() {
        let registry = PoolRegistry::new();
        let f = factory();
        registry.pool_init(cfg("anchor", 1), &f).unwrap();
        let before = registry.aliases();

        registry.pool_init(cfg("ephemeral", 2), &f).unwrap();
        registry.pool_deinit("ephemeral").unwrap();
        assert_eq!(registry.aliases(), before);

        assert_eq!(registry.pool_deinit("ephemeral").unwrap_err(), DbError::Arg);
    }

    #[test]
    fn map_deinit_reports_empty_registry() {
        let registry = PoolRegistry::new();
        assert_eq!(registry.map_deinit(), DeinitOutcome::Skipped);
        let f = factory();
        registry.pool_init(cfg("one", 1), &f).unwrap();
        assert_eq!(registry.map_deinit(), DeinitOutcome::Done);
        assert!(registry.aliases().is_empty());
    }

    #[test]
    fn capacity_connections_created_eagerly() {
        let registry = PoolRegistry::new();
        let f = factory();
        let pool = registry.pool_init(cfg("sized", 3), &f).unwrap();
        assert_eq!(pool.connections().len(), 3);
        let a = pool.acquire_free_conn().unwrap();
        let b = pool.acquire_free_conn().unwrap();
        let c = pool.acquire_free_conn().unwrap();
        assert!(pool.acquire_free_conn().is_none());
        pool.release_used_conn(&b);
        assert!(pool.acquire_free_conn().is_some());
        pool.release_used_conn(&a);
        pool.release_used_conn(&c);
    }

    #[tokio::test]
    async fn closing_pool_refuses_new_queries() {
        let registry = PoolRegistry::new();
        let f = factory();
        let pool = registry.pool_init(cfg("closing", 1), &f).unwrap();
        pool.signal_closing();
        let err = query_start(
            &pool,
            QueryConfig {
                statement: b"SELECT 1;".to_vec(),
                num_result_sets: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, DbError::PoolBusy);
    }

    #[tokio::test]
    async fn oversized_statement_rejected_at_submission() {
        let registry = PoolRegistry::new();
        let f = factory();
        let pool = registry.pool_init(cfg("bounds", 1), &f).unwrap();
        // size == limit is already too large: the NUL needs its byte
        let err = query_start(
            &pool,
            QueryConfig {
                statement: vec![b'q'; 1024],
                num_result_sets: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, DbError::Arg);
        // the reserved connection went back to the free set
        assert!(pool.acquire_free_conn().is_some());
    }

    #[tokio::test]
    async fn close_all_then_check_all_closed() {
        let registry = PoolRegistry::new();
        let f = factory();
        let pool = registry.pool_init(cfg("teardown", 2), &f).unwrap();
        assert!(!pool.check_all_conns_closed());
        pool.signal_closing();
        pool.close_all_conns().await;
        assert!(pool.check_all_conns_closed());
    }
}
