//! Error types for device link operations

use std::error::Error;
use std::fmt;
use std::io;

/// Main error type for device operations
#[derive(Debug)]
pub enum DeviceError {
	/// Transport failed before or during negotiation (nested)
	Transport(TransportError),

	/// Device explicitly denied the supplied credential
	Authentication { message: String },

	/// No response within the operation's bound
	Timeout { operation: String, after_ms: u64 },

	/// Malformed frame or declared-vs-actual mismatch
	Protocol { message: String },

	/// Device returned an explicit error opcode/status with a message
	Device { message: String },

	/// Operation requires a live connection
	NotConnected,

	/// A connect attempt was made while the session is not Disconnected
	AlreadyConnected,

	/// Operation is not available on the active file-transfer backend
	NotSupported { operation: String },

	/// Invalid configuration
	InvalidConfig { message: String },
}

impl fmt::Display for DeviceError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DeviceError::Transport(e) => write!(f, "Transport error: {}", e),
			DeviceError::Authentication { message } => {
				write!(f, "Authentication failed: {}", message)
			}
			DeviceError::Timeout { operation, after_ms } => {
				write!(f, "Timeout after {}ms waiting for {}", after_ms, operation)
			}
			DeviceError::Protocol { message } => write!(f, "Protocol error: {}", message),
			DeviceError::Device { message } => write!(f, "Device error: {}", message),
			DeviceError::NotConnected => write!(f, "Not connected"),
			DeviceError::AlreadyConnected => write!(f, "Already connected"),
			DeviceError::NotSupported { operation } => {
				write!(f, "Operation not supported on this backend: {}", operation)
			}
			DeviceError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
		}
	}
}

impl Error for DeviceError {}

impl From<TransportError> for DeviceError {
	fn from(e: TransportError) -> Self {
		DeviceError::Transport(e)
	}
}

impl From<io::Error> for DeviceError {
	fn from(e: io::Error) -> Self {
		DeviceError::Transport(TransportError::Io(e))
	}
}

impl From<String> for DeviceError {
	fn from(e: String) -> Self {
		DeviceError::Protocol { message: e }
	}
}

impl From<&str> for DeviceError {
	fn from(e: &str) -> Self {
		DeviceError::Protocol { message: e.to_string() }
	}
}

impl DeviceError {
	/// Timeout constructor used by every operation class
	pub fn timeout(operation: &str, after: std::time::Duration) -> Self {
		DeviceError::Timeout {
			operation: operation.to_string(),
			after_ms: after.as_millis() as u64,
		}
	}

	/// Rejection used when a connection is torn down with calls in flight
	pub fn connection_closed() -> Self {
		DeviceError::Transport(TransportError::ClosedUnexpectedly)
	}
}

/// Transport-level errors
#[derive(Debug)]
pub enum TransportError {
	/// Could not open the transport at all
	ConnectFailed { url: String, source: Box<dyn Error + Send + Sync> },

	/// Peer closed without a close frame, or the stream errored mid-flight
	ClosedUnexpectedly,

	/// Peer sent an explicit close with a reason
	Closed { reason: String },

	/// I/O error on the underlying stream
	Io(io::Error),

	/// WebSocket protocol failure
	WebSocket(String),
}

impl fmt::Display for TransportError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportError::ConnectFailed { url, source } => {
				write!(f, "Failed to connect to {}: {}", url, source)
			}
			TransportError::ClosedUnexpectedly => {
				write!(f, "Connection closed unexpectedly")
			}
			TransportError::Closed { reason } => {
				write!(f, "Connection closed: {}", reason)
			}
			TransportError::Io(e) => write!(f, "I/O error: {}", e),
			TransportError::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
		}
	}
}

impl Error for TransportError {}

impl From<io::Error> for TransportError {
	fn from(e: io::Error) -> Self {
		TransportError::Io(e)
	}
}

// vim: ts=4
