//! Broker reply collection.
//!
//! A reply session periodically polls the message broker for correlated
//! reply messages, classifies each one by the correlation-id pattern of the
//! binding it belongs to, and hands the per-tick batch to the caller. The
//! concrete broker client stays behind [`ReplyBroker`].

pub mod celery;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Caller contract breach or malformed payload.
    #[error("invalid rpc argument")]
    Arg,

    /// OS-level failure inside the broker client.
    #[error("rpc os error")]
    Os,

    /// The broker connection dropped.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// Operation-level broker failure.
    #[error("broker operation error: {0}")]
    Operation(String),
}

/// One reply message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct ReplyMessage {
    pub corr_id: String,
    pub body: Vec<u8>,
}

/// One classified entry of a reply batch.
#[derive(Debug, Clone)]
pub struct ReplyEntry {
    pub corr_id: String,
    pub msg: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Per-tick accumulator: binding correlation-id pattern -> matched entries,
/// in delivery order. Non-matching messages never appear.
pub type ReplyBatch = HashMap<String, Vec<ReplyEntry>>;

/// Abstract broker client. Only the reply-poll surface is modelled; wire
/// format and channel management belong to the concrete client.
#[async_trait]
pub trait ReplyBroker: Send + Sync + fmt::Debug {
    /// Deliver up to `max_nread` pending reply messages.
    async fn get_replies(&self, max_nread: usize) -> Result<Vec<ReplyMessage>, RpcError>;
}

/// Continuation decision of the update callback.
pub type OnUpdate = Box<dyn FnMut(&ReplyBatch) -> bool + Send>;
pub type OnError = Box<dyn FnOnce(RpcError) + Send>;

/// Configuration of one reply session.
pub struct RecvReplyConfig {
    /// Poll interval.
    pub timeout: Duration,
    /// Upper bound of messages consumed per tick.
    pub max_msgs_per_tick: usize,
    /// Correlation-id name patterns, one per binding. A message belongs to
    /// the first binding whose pattern prefixes its correlation id.
    pub correlation_patterns: Vec<String>,
    /// Inspects the classified batch; returning `true` re-arms the timer,
    /// `false` ends the session.
    pub on_update: OnUpdate,
    /// Invoked once when the broker fails; the session ends.
    pub on_error: OnError,
}

impl fmt::Debug for RecvReplyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvReplyConfig")
            .field("timeout", &self.timeout)
            .field("max_msgs_per_tick", &self.max_msgs_per_tick)
            .field("correlation_patterns", &self.correlation_patterns)
            .finish_non_exhaustive()
    }
}

/// A timer-driven reply poll loop.
#[derive(Debug)]
pub struct ReplySession {
    handle: tokio::task::JoinHandle<()>,
}

impl ReplySession {
    /// Install the reply timer. Each tick polls the broker once and routes
    /// the classified batch through `on_update`.
    pub fn start(broker: Arc<dyn ReplyBroker>, cfg: RecvReplyConfig) -> Result<Self, RpcError> {
        if cfg.timeout.is_zero() || cfg.max_msgs_per_tick == 0 || cfg.correlation_patterns.is_empty()
        {
            return Err(RpcError::Arg);
        }
        let handle = tokio::spawn(run_session(broker, cfg));
        Ok(Self { handle })
    }

    /// Wait for the session to end (update callback returned `false`, or a
    /// broker error fired `on_error`).
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    /// Force the session down without waiting for the next tick.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run_session(broker: Arc<dyn ReplyBroker>, mut cfg: RecvReplyConfig) {
    loop {
        tokio::time::sleep(cfg.timeout).await;
        let messages = match broker.get_replies(cfg.max_msgs_per_tick).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "reply poll failed, ending session");
                (cfg.on_error)(err);
                return;
            }
        };
        let batch = classify(&cfg.correlation_patterns, messages);
        if !(cfg.on_update)(&batch) {
            debug!("reply session stopped by update callback");
            return;
        }
    }
}

/// Route each message to the first binding whose correlation-id pattern
/// prefixes the message's correlation id. Unmatched messages are dropped.
fn classify(patterns: &[String], messages: Vec<ReplyMessage>) -> ReplyBatch {
    let mut batch: ReplyBatch = HashMap::new();
    for msg in messages {
        let Some(pattern) = patterns.iter().find(|p| msg.corr_id.starts_with(p.as_str())) else {
            debug!(corr_id = %msg.corr_id, "discarding reply with unknown correlation id");
            continue;
        };
        batch.entry(pattern.clone()).or_default().push(ReplyEntry {
            corr_id: msg.corr_id,
            msg: msg.body,
            timestamp: Utc::now(),
        });
    }
    batch
}
