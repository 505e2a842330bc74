//! Convergence primitives for mirroring objects between clusters.
//!
//! This library provides the helpers the node agent uses to converge a
//! target cluster towards a source cluster:
//!
//! - **Content hashing**: [`SpecHash`] decides whether a mirrored copy is stale.
//! - **Bounded polling**: [`poll_until`] retries a condition at a fixed
//!   interval until it holds, fails hard, or a deadline passes.
//!
//! # Invariants
//!
//! - The condition is evaluated immediately, before the first sleep
//! - A hard failure from the condition aborts the poll without retrying
//! - Decisions are deterministic given the same inputs

use std::future::Future;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::trace;

/// Default interval between dependency sync attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default deadline for dependency sync before pod creation gives up.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a bounded poll.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The deadline passed before the condition held.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// The condition reported a non-retryable failure.
    #[error(transparent)]
    Aborted(E),
}

impl<E> PollError<E> {
    /// Returns true if the poll gave up because of its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Poll `condition` every `interval` until it returns `Ok(true)`.
///
/// `Ok(false)` means "not yet, try again"; `Err` aborts immediately. The whole
/// loop, including a condition call that is still in flight, is bounded by
/// `timeout`.
pub async fn poll_until<F, Fut, E>(
    resource: &str,
    interval: Duration,
    timeout: Duration,
    mut condition: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    let polled = tokio::time::timeout(timeout, async {
        loop {
            attempts += 1;
            match condition().await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    trace!(resource = %resource, attempts, "Condition not met yet");
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(PollError::Aborted(e)),
            }
        }
    })
    .await;

    match polled {
        Ok(result) => result,
        Err(_) => Err(PollError::Timeout {
            resource: resource.to_string(),
            elapsed: start.elapsed(),
        }),
    }
}

/// A content hash for deterministic comparison.
///
/// Used to detect when a mirrored Secret or ConfigMap has drifted from its
/// source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}
