//! Configuration models of the core subsystems.
//!
//! Plain serde structs; the surrounding application decides where they are
//! loaded from and exits with its configuration error code when they do not
//! validate.

use std::time::Duration;

use serde::Deserialize;

use crate::db::pool::{DbCredentials, PoolConfig};

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_bulk_query_limit_kb() -> usize {
    4
}

fn default_read_buf_bytes() -> usize {
    4096
}

fn default_max_msgs_per_tick() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbPoolSettings {
    pub alias: String,
    pub capacity: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_bulk_query_limit_kb")]
    pub bulk_query_limit_kb: usize,
    pub db_name: String,
    pub db_user: String,
    #[serde(default)]
    pub db_passwd: String,
    pub db_host: String,
    pub db_port: u16,
}

impl From<DbPoolSettings> for PoolConfig {
    fn from(s: DbPoolSettings) -> Self {
        PoolConfig {
            alias: s.alias,
            capacity: s.capacity,
            idle_timeout: Duration::from_secs(s.idle_timeout_secs),
            bulk_query_limit_kb: s.bulk_query_limit_kb,
            credentials: DbCredentials {
                db_name: s.db_name,
                db_user: s.db_user,
                db_passwd: s.db_passwd,
                db_host: s.db_host,
                db_port: s.db_port,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub alias: String,
    pub base_path: String,
    #[serde(default = "default_read_buf_bytes")]
    pub read_buf_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcBindingSettings {
    pub queue: String,
    pub correlation_id_pattern: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub ttl_secs: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    pub alias: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_msgs_per_tick")]
    pub max_msgs_per_tick: usize,
    pub bindings: Vec<RpcBindingSettings>,
}

/// Top-level settings of the core substrate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreSettings {
    #[serde(default)]
    pub storages: Vec<StorageSettings>,
    #[serde(default)]
    pub db_pools: Vec<DbPoolSettings>,
    #[serde(default)]
    pub rpc: Vec<RpcSettings>,
}
