//! Celery result-protocol extraction.
//!
//! Workers report job progress as a stream of JSON messages of the shape
//! `{"status": "...", "result": {...}}`. Given the ordered batch of messages
//! correlated to one job, [`extract_replies`] applies the protocol's
//! termination rule.

use serde::Deserialize;
use serde_json::Value;

use super::{ReplyEntry, RpcError};

#[derive(Debug, Deserialize)]
struct CeleryPayload {
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

/// Resolve the ordered reply stream of one job.
///
/// - the latest terminal message is `SUCCESS`: the embedded `result`
/// - any message is `ERROR`: [`RpcError::Arg`]
/// - only `STARTED` (or other non-terminal states) observed: `None`, the
///   job is still running
///
/// Payloads that do not parse as the expected object shape fail with
/// [`RpcError::Arg`].
pub fn extract_replies(batch: &[ReplyEntry]) -> Result<Option<Value>, RpcError> {
    let mut latest_success: Option<Value> = None;
    for entry in batch {
        let payload: CeleryPayload =
            serde_json::from_slice(&entry.msg).map_err(|_| RpcError::Arg)?;
        match payload.status.as_str() {
            "SUCCESS" => {
                latest_success = Some(payload.result.unwrap_or(Value::Null));
            }
            "ERROR" | "FAILURE" => return Err(RpcError::Arg),
            // STARTED, RETRY, PENDING and friends carry no terminal result
            _ => {}
        }
    }
    Ok(latest_success)
}
