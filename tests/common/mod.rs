#![allow(dead_code)]

//! Shared test harness: a channel-backed transport pair
//!
//! `mock_pair()` yields a `Connector` for the session under test and a
//! `DeviceHandle` the test drives as the device: it observes every frame the
//! client sent and injects inbound frames. Channels are unbounded, so a test
//! can seed device responses before calling into the session.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use replink::config::SessionConfig;
use replink::error::TransportError;
use replink::session::Session;
use replink::transport::{Connector, Frame, FrameSink, FrameSource};

pub struct MockConnector {
	pair: Mutex<Option<(MockSink, MockSource)>>,
}

struct MockSink {
	tx: Option<mpsc::UnboundedSender<Frame>>,
}

struct MockSource {
	rx: mpsc::UnboundedReceiver<Frame>,
}

/// The device side of the mock transport
pub struct DeviceHandle {
	to_client: Option<mpsc::UnboundedSender<Frame>>,
	from_client: mpsc::UnboundedReceiver<Frame>,
}

pub fn mock_pair() -> (MockConnector, DeviceHandle) {
	let (client_tx, device_rx) = mpsc::unbounded_channel();
	let (device_tx, client_rx) = mpsc::unbounded_channel();
	let connector = MockConnector {
		pair: Mutex::new(Some((
			MockSink { tx: Some(client_tx) },
			MockSource { rx: client_rx },
		))),
	};
	let device = DeviceHandle { to_client: Some(device_tx), from_client: device_rx };
	(connector, device)
}

#[async_trait]
impl Connector for MockConnector {
	async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
		let (sink, source) = self
			.pair
			.lock()
			.unwrap()
			.take()
			.ok_or(TransportError::ClosedUnexpectedly)?;
		Ok((Box::new(sink), Box::new(source)))
	}
}

#[async_trait]
impl FrameSink for MockSink {
	async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
		match &self.tx {
			Some(tx) => tx.send(frame).map_err(|_| TransportError::ClosedUnexpectedly),
			None => Err(TransportError::ClosedUnexpectedly),
		}
	}

	async fn close(&mut self) -> Result<(), TransportError> {
		self.tx = None;
		Ok(())
	}
}

#[async_trait]
impl FrameSource for MockSource {
	async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
		Ok(self.rx.recv().await)
	}
}

impl DeviceHandle {
	pub fn send_text(&self, text: &str) {
		self.send_frame(Frame::Text(text.to_string()));
	}

	pub fn send_binary(&self, bytes: Vec<u8>) {
		self.send_frame(Frame::Binary(bytes));
	}

	pub fn send_frame(&self, frame: Frame) {
		self.to_client
			.as_ref()
			.expect("device already closed")
			.send(frame)
			.expect("client transport gone");
	}

	/// Simulate the peer closing the connection
	pub fn close(&mut self) {
		self.to_client = None;
	}

	/// Next frame the client sent, bounded so a broken test fails fast
	pub async fn recv(&mut self) -> Frame {
		tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
			.await
			.expect("timed out waiting for client frame")
			.expect("client sink gone")
	}

	pub async fn recv_binary(&mut self) -> Vec<u8> {
		match self.recv().await {
			Frame::Binary(bytes) => bytes,
			other => panic!("expected binary frame, got {:?}", other),
		}
	}

	pub async fn recv_text(&mut self) -> String {
		match self.recv().await {
			Frame::Text(text) => text,
			other => panic!("expected text frame, got {:?}", other),
		}
	}

	/// Whether the client has sent anything (non-blocking)
	pub fn try_recv(&mut self) -> Option<Frame> {
		self.from_client.try_recv().ok()
	}
}

/// Config with test-friendly bounds
pub fn test_config() -> SessionConfig {
	let mut config = SessionConfig::new("ws://device.test:8266");
	config.connect_timeout_ms = 2_000;
	config.raw_mode_wait_ms = 200;
	config.exec_timeout_ms = 2_000;
	config.interrupt_wait_ms = 1_000;
	config.transfer_timeout_ms = 2_000;
	config.meta_timeout_ms = 500;
	config
}

/// Connect a session against a device that greets in raw mode
pub async fn connected_session(config: SessionConfig) -> (Session, DeviceHandle) {
	let (connector, device) = mock_pair();
	let session = Session::with_connector(config, Box::new(connector));
	device.send_text("raw REPL; CTRL-B to exit\r\n>");
	session.connect().await.expect("connect failed");
	(session, device)
}

// vim: ts=4
