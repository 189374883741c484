//! Connection lifecycle tests
//!
//! Greeting paths (raw banner, password challenge, denial), the raw-mode
//! entry fallback, the single-live-connection guard, and teardown behavior
//! for calls still pending at disconnect.

use std::sync::Arc;
use std::time::Duration;

use replink::error::DeviceError;
use replink::events::DeviceEvent;
use replink::session::{ConnState, Session};
use replink::transport::Frame;

mod common;

#[tokio::test]
async fn test_raw_banner_skips_entry_byte() {
	let (connector, mut device) = common::mock_pair();
	let session = Session::with_connector(common::test_config(), Box::new(connector));
	let mut events = session.take_events().unwrap();

	device.send_text("raw REPL; CTRL-B to exit\r\n>");
	session.connect().await.unwrap();

	assert!(session.is_connected());
	assert_eq!(session.state(), ConnState::Connected);
	// The device was already in raw mode: no entry byte may be sent
	assert!(device.try_recv().is_none());
	assert!(matches!(events.try_recv(), Ok(DeviceEvent::Connected)));
}

#[tokio::test]
async fn test_password_challenge_success() {
	let (connector, mut device) = common::mock_pair();
	let mut config = common::test_config();
	config.password = Some("secret".to_string());
	let session = Session::with_connector(config, Box::new(connector));

	device.send_text("Password: ");
	let responder = tokio::spawn(async move {
		let frame = device.recv().await;
		assert_eq!(frame, Frame::Text("secret\r".to_string()));
		device.send_text("\r\nWebREPL connected\r\n>>> ");
		// Not in raw mode yet: expect the entry byte, confirm it
		assert_eq!(device.recv_binary().await, vec![0x01]);
		device.send_text("raw REPL; CTRL-B to exit\r\n>");
		device
	});

	session.connect().await.unwrap();
	assert!(session.is_connected());
	responder.await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_rejects_and_disconnects() {
	let (connector, mut device) = common::mock_pair();
	let mut config = common::test_config();
	config.password = Some("wrong".to_string());
	let session = Session::with_connector(config, Box::new(connector));

	device.send_text("Password: ");
	let responder = tokio::spawn(async move {
		let _credential = device.recv().await;
		device.send_text("\r\nAccess denied\r\n");
		device
	});

	let err = session.connect().await.unwrap_err();
	assert!(matches!(err, DeviceError::Authentication { .. }));
	assert_eq!(session.state(), ConnState::Disconnected);
	responder.await.unwrap();
}

#[tokio::test]
async fn test_password_prompt_without_credential() {
	let (connector, device) = common::mock_pair();
	let session = Session::with_connector(common::test_config(), Box::new(connector));

	device.send_text("Password: ");
	let err = session.connect().await.unwrap_err();
	assert!(matches!(err, DeviceError::Authentication { .. }));
	assert_eq!(session.state(), ConnState::Disconnected);
}

#[tokio::test]
async fn test_raw_mode_assumed_after_bounded_wait() {
	let (connector, mut device) = common::mock_pair();
	let session = Session::with_connector(common::test_config(), Box::new(connector));

	// Banner without raw-mode confirmation; device stays silent afterwards
	device.send_text("WebREPL connected\r\n>>> ");
	session.connect().await.unwrap();

	// The entry byte was sent, and the wait bound elapsed without
	// confirmation, yet the connection is usable
	assert_eq!(device.recv_binary().await, vec![0x01]);
	assert!(session.is_connected());
}

#[tokio::test]
async fn test_second_connect_rejected_immediately() {
	let (session, _device) = common::connected_session(common::test_config()).await;
	let err = session.connect().await.unwrap_err();
	assert!(matches!(err, DeviceError::AlreadyConnected));
	// The live connection is untouched
	assert!(session.is_connected());
}

#[tokio::test]
async fn test_transport_closed_during_handshake() {
	let (connector, mut device) = common::mock_pair();
	let session = Session::with_connector(common::test_config(), Box::new(connector));

	device.close();
	let err = session.connect().await.unwrap_err();
	assert!(matches!(err, DeviceError::Transport(_)));
	assert_eq!(session.state(), ConnState::Disconnected);
}

#[tokio::test]
async fn test_pending_execution_rejected_on_disconnect() {
	let (session, mut device) = common::connected_session(common::test_config()).await;
	let session = Arc::new(session);

	let exec_session = session.clone();
	let exec = tokio::spawn(async move { exec_session.execute("while True: pass", false).await });

	// Let the submission reach the device, then never answer
	let _code = device.recv().await;
	session.disconnect().await.unwrap();

	let result = exec.await.unwrap();
	assert!(matches!(result, Err(DeviceError::Transport(_))), "got {:?}", result);
	assert!(!session.is_connected());
}

#[tokio::test]
async fn test_peer_close_emits_disconnected_and_rejects() {
	let (session, mut device) = common::connected_session(common::test_config()).await;
	let mut events = session.take_events().unwrap();
	// Drain the Connected event
	assert!(matches!(events.try_recv(), Ok(DeviceEvent::Connected)));

	device.close();
	let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
		.await
		.unwrap()
		.unwrap();
	assert!(matches!(event, DeviceEvent::Disconnected { .. }));
	assert!(!session.is_connected());

	let err = session.execute("1", false).await.unwrap_err();
	assert!(matches!(err, DeviceError::NotConnected));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
	let (session, _device) = common::connected_session(common::test_config()).await;
	session.disconnect().await.unwrap();
	session.disconnect().await.unwrap();
	assert_eq!(session.state(), ConnState::Disconnected);
}

// vim: ts=4
