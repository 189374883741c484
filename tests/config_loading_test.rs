//! Config file loading tests

use std::fs;
use tempfile::TempDir;

use replink::config::{FileBackend, SessionConfig};

#[test]
fn test_load_full_config() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("replink.toml");
	fs::write(
		&path,
		r#"
url = "ws://192.168.4.1:8266"
password = "secret"
backend = "legacy"
transfer-timeout-ms = 5000
block-size = 1024
"#,
	)
	.unwrap();

	let config = SessionConfig::load(&path).unwrap();
	assert_eq!(config.url, "ws://192.168.4.1:8266");
	assert_eq!(config.password.as_deref(), Some("secret"));
	assert_eq!(config.backend, FileBackend::Legacy);
	assert_eq!(config.transfer_timeout_ms, 5000);
	assert_eq!(config.block_size, 1024);
	// Unspecified keys keep their defaults
	assert_eq!(config.meta_timeout_ms, 10_000);
}

#[test]
fn test_load_rejects_bad_toml() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("broken.toml");
	fs::write(&path, "url = [not toml").unwrap();
	assert!(SessionConfig::load(&path).is_err());
}

#[test]
fn test_load_missing_file_is_io_error() {
	let dir = TempDir::new().unwrap();
	assert!(SessionConfig::load(&dir.path().join("absent.toml")).is_err());
}

// vim: ts=4
