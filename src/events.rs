//! Event surface raised to the embedding host
//!
//! The session pushes these through an unbounded channel handed out once by
//! `Session::take_events()`. Consumers render terminal data, telemetry and
//! device-initiated UI requests; the protocol engine never renders anything.

use serde_json::Value;

/// Events emitted by a session
#[derive(Debug, Clone)]
pub enum DeviceEvent {
	/// Connection established and raw mode active (or assumed)
	Connected,

	/// Connection torn down; reason is human-readable
	Disconnected { reason: String },

	/// A chunk of interpreter output, in arrival order
	Data { text: String, is_error: bool },

	/// Periodic device telemetry broadcast
	Telemetry { payload: Value },

	/// Device-initiated request to display an external UI
	DisplayUi { payload: Value },

	/// Outbound debug-protocol envelope produced by the bridge
	Debug { body: String },
}

// vim: ts=4
