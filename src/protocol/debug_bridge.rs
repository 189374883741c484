//! Debug protocol bridge
//!
//! Translates between the host's debugging UI and the length-prefixed text
//! envelope `Content-Length: <n>\r\n\r\n<json>`. Device-side execution
//! control is unimplemented, so the bridge negotiates its capabilities to
//! "unsupported" and acknowledges what it cannot fulfill instead of silently
//! accepting it. Breakpoint records are kept client-side, replaced wholesale
//! per file on every set request.

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::error::DeviceError;

const HEADER: &str = "Content-Length:";

/// Whether a text frame has the envelope's header shape
pub fn is_envelope(text: &str) -> bool {
	text.starts_with(HEADER)
}

/// Wrap a JSON body in the envelope
pub fn encode_envelope(body: &str) -> String {
	format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
}

/// Unwrap an envelope, validating the declared length
pub fn decode_envelope(text: &str) -> Result<&str, DeviceError> {
	let rest = text
		.strip_prefix(HEADER)
		.ok_or("Missing Content-Length header")?;
	let (length_text, tail) = rest
		.split_once("\r\n\r\n")
		.ok_or("Missing envelope separator")?;
	let declared: usize = length_text
		.trim()
		.parse()
		.map_err(|_| DeviceError::Protocol { message: "Bad Content-Length value".to_string() })?;
	if tail.len() != declared {
		return Err(DeviceError::Protocol {
			message: format!("Envelope length mismatch: declared {}, got {}", declared, tail.len()),
		});
	}
	Ok(tail)
}

/// A client-side breakpoint record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
	pub id: u64,
	pub path: String,
	pub line: u64,
	pub verified: bool,
}

/// Bridge state: sequence numbering and the breakpoint store
pub struct DebugBridge {
	seq: u64,
	next_breakpoint_id: u64,
	breakpoints: HashMap<String, Vec<Breakpoint>>,
}

impl DebugBridge {
	pub fn new() -> Self {
		Self { seq: 0, next_breakpoint_id: 1, breakpoints: HashMap::new() }
	}

	/// Next outbound sequence number
	pub fn next_seq(&mut self) -> u64 {
		self.seq += 1;
		self.seq
	}

	/// Capabilities negotiated to the host. Stepping and execution control
	/// need a cooperating device-side implementation that does not exist.
	pub fn capabilities(&self) -> Value {
		json!({
			"supportsConfigurationDoneRequest": true,
			"supportsSetBreakpoints": true,
			"supportsStepping": false,
			"supportsContinue": false,
			"supportsPause": false,
			"supportsEvaluate": false,
		})
	}

	/// Replace the breakpoint set for one file, assigning fresh ids.
	/// No incremental diffing: every request replaces the file wholesale.
	pub fn set_breakpoints(&mut self, path: &str, lines: &[u64]) -> Vec<Breakpoint> {
		let records: Vec<Breakpoint> = lines
			.iter()
			.map(|line| {
				let id = self.next_breakpoint_id;
				self.next_breakpoint_id += 1;
				Breakpoint { id, path: path.to_string(), line: *line, verified: false }
			})
			.collect();
		self.breakpoints.insert(path.to_string(), records.clone());
		records
	}

	pub fn breakpoints_for(&self, path: &str) -> &[Breakpoint] {
		self.breakpoints.get(path).map(Vec::as_slice).unwrap_or(&[])
	}

	/// Answer a device-initiated request. Everything the bridge cannot
	/// fulfill is acknowledged with success=false.
	pub fn handle_request(&mut self, request: &Value) -> Vec<String> {
		let command = request.get("command").and_then(Value::as_str).unwrap_or("");
		let request_seq = request.get("seq").and_then(Value::as_u64).unwrap_or(0);
		let (success, body) = match command {
			"initialize" => (true, self.capabilities()),
			_ => (false, json!({ "message": format!("unsupported command: {}", command) })),
		};
		let response = json!({
			"seq": self.next_seq(),
			"type": "response",
			"request_seq": request_seq,
			"command": command,
			"success": success,
			"body": body,
		});
		vec![encode_envelope(&response.to_string())]
	}

	/// Build an outbound request envelope, returning its sequence number
	pub fn build_request(&mut self, command: &str, arguments: &Value) -> (u64, String) {
		let seq = self.next_seq();
		let body = json!({
			"seq": seq,
			"type": "request",
			"command": command,
			"arguments": arguments,
		});
		(seq, encode_envelope(&body.to_string()))
	}
}

impl Default for DebugBridge {
	fn default() -> Self {
		Self::new()
	}
}


// vim: ts=4
