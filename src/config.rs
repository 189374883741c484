//! Session configuration
//!
//! Follows a priority chain:
//! 1. Built-in defaults (SessionConfig::default())
//! 2. Config file (TOML, optional)
//! 3. Caller/CLI overrides (highest priority)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::DeviceError;

/// Which protocol carries file operations for this session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileBackend {
	/// Single-shot binary get/put with fixed headers
	Legacy,
	/// Block-acknowledged transfers and directory operations over channel 23
	Channel,
}

/// Configuration for a device session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
	/// Device address, e.g. `ws://192.168.4.1:8266`
	pub url: String,

	/// Credential sent when the device presents a password prompt
	pub password: Option<String>,

	/// File-transfer backend; directory operations need `Channel`
	pub backend: FileBackend,

	/// Bound for the whole connect/authenticate handshake (ms)
	pub connect_timeout_ms: u64,

	/// Bound for the raw-mode banner after sending the entry byte (ms).
	/// When it elapses raw mode is assumed active, not treated as fatal.
	pub raw_mode_wait_ms: u64,

	/// Bound for one code execution, ack through completion (ms)
	pub exec_timeout_ms: u64,

	/// Bound for forcing a busy session back to idle via interrupt (ms)
	pub interrupt_wait_ms: u64,

	/// Bound per file transfer, both backends (ms)
	pub transfer_timeout_ms: u64,

	/// Bound per directory/metadata operation (ms)
	pub meta_timeout_ms: u64,

	/// Nominal block size for channelized transfers (bytes)
	pub block_size: usize,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			url: String::new(),
			password: None,
			backend: FileBackend::Channel,
			connect_timeout_ms: 10_000,
			raw_mode_wait_ms: 3_000,
			exec_timeout_ms: 30_000,
			interrupt_wait_ms: 2_000,
			transfer_timeout_ms: 30_000,
			meta_timeout_ms: 10_000,
			block_size: 4096,
		}
	}
}

impl SessionConfig {
	/// Construct a config for the given device address
	pub fn new(url: &str) -> Self {
		Self { url: url.to_string(), ..Self::default() }
	}

	/// Load overrides from a TOML file on top of the defaults
	pub fn load(path: &Path) -> Result<Self, DeviceError> {
		let text = std::fs::read_to_string(path).map_err(|e| DeviceError::InvalidConfig {
			message: format!("Cannot read {}: {}", path.display(), e),
		})?;
		toml::from_str(&text)
			.map_err(|e| DeviceError::InvalidConfig { message: e.to_string() })
	}

	pub fn connect_timeout(&self) -> Duration {
		Duration::from_millis(self.connect_timeout_ms)
	}

	pub fn raw_mode_wait(&self) -> Duration {
		Duration::from_millis(self.raw_mode_wait_ms)
	}

	pub fn exec_timeout(&self) -> Duration {
		Duration::from_millis(self.exec_timeout_ms)
	}

	pub fn interrupt_wait(&self) -> Duration {
		Duration::from_millis(self.interrupt_wait_ms)
	}

	pub fn transfer_timeout(&self) -> Duration {
		Duration::from_millis(self.transfer_timeout_ms)
	}

	pub fn meta_timeout(&self) -> Duration {
		Duration::from_millis(self.meta_timeout_ms)
	}
}


// vim: ts=4
