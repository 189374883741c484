//! Pending-operation registry
//!
//! Correlates asynchronous requests to their eventual resolution. Keys are
//! channel+opcode pairs for single-flight channel operations, command tags
//! for structured request/response pairs, or caller-supplied tokens.
//!
//! Resolution removes the entry before completing it, so completion is
//! idempotent even if the frame handler is re-entered. Callers enforce
//! timeouts on their receiver and call `remove` on expiry; a frame arriving
//! after that finds no entry and is a logged no-op. Disconnection walks the
//! registry and rejects every outstanding entry so no call is left hanging.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::DeviceError;

/// Correlation key for a pending operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKey {
	/// Single-flight channel operation
	Channel { channel: u8, opcode: u8 },
	/// Structured command tag
	Command(String),
	/// Caller-supplied token (RPC, debug requests)
	Token(String),
}

impl std::fmt::Display for OpKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			OpKey::Channel { channel, opcode } => write!(f, "ch{}/op{}", channel, opcode),
			OpKey::Command(tag) => write!(f, "cmd:{}", tag),
			OpKey::Token(token) => write!(f, "token:{}", token),
		}
	}
}

/// What a resolved operation yields
#[derive(Debug)]
pub enum OpOutcome {
	/// Envelope fields following channel and opcode
	Channel(Vec<rmpv::Value>),
	/// JSON payload from a structured or debug response
	Json(Value),
}

pub type OpResult = Result<OpOutcome, DeviceError>;

struct PendingOp {
	operation: String,
	created: Instant,
	timeout: Duration,
	resolve: oneshot::Sender<OpResult>,
}

/// Registry of in-flight request/response operations
pub struct PendingRegistry {
	entries: HashMap<OpKey, PendingOp>,
}

impl PendingRegistry {
	pub fn new() -> Self {
		Self { entries: HashMap::new() }
	}

	/// Register an operation, yielding the receiver its caller awaits.
	/// A key may hold only one operation at a time.
	pub fn register(
		&mut self,
		key: OpKey,
		operation: &str,
		timeout: Duration,
	) -> Result<oneshot::Receiver<OpResult>, DeviceError> {
		if self.entries.contains_key(&key) {
			return Err(DeviceError::Protocol {
				message: format!("Operation already in flight for {}", key),
			});
		}
		let (tx, rx) = oneshot::channel();
		self.entries.insert(
			key,
			PendingOp {
				operation: operation.to_string(),
				created: Instant::now(),
				timeout,
				resolve: tx,
			},
		);
		Ok(rx)
	}

	/// Resolve the operation under `key`. Returns false if no entry matched
	/// (late or unsolicited response).
	pub fn resolve(&mut self, key: &OpKey, outcome: OpOutcome) -> bool {
		self.complete(key, Ok(outcome))
	}

	/// Reject the operation under `key` with an error.
	pub fn reject(&mut self, key: &OpKey, error: DeviceError) -> bool {
		self.complete(key, Err(error))
	}

	fn complete(&mut self, key: &OpKey, result: OpResult) -> bool {
		match self.entries.remove(key) {
			Some(op) => {
				debug!(
					"Completing {} ({}) after {}ms",
					key,
					op.operation,
					op.created.elapsed().as_millis()
				);
				// The caller may have timed out and dropped its receiver
				let _ = op.resolve.send(result);
				true
			}
			None => false,
		}
	}

	/// Drop the entry for `key` without completing it (caller-side timeout).
	/// The slot is cleared, so a stale response later is a no-op.
	pub fn remove(&mut self, key: &OpKey) -> Option<Duration> {
		self.entries.remove(key).map(|op| op.timeout)
	}

	/// Reject every outstanding entry. Called on disconnect so pending
	/// promises settle instead of hanging.
	pub fn reject_all(&mut self, reason: &str) {
		for (key, op) in self.entries.drain() {
			debug!("Rejecting pending {} ({}): {}", key, op.operation, reason);
			let _ = op.resolve.send(Err(DeviceError::connection_closed()));
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

impl Default for PendingRegistry {
	fn default() -> Self {
		Self::new()
	}
}


// vim: ts=4
