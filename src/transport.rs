//! Transport abstraction and WebSocket implementation
//!
//! The protocol engine is written against the `Connector`/`FrameSink`/`FrameSource`
//! traits so there is exactly one implementation of the state machines. The
//! WebSocket transport below is the production implementation; tests plug in a
//! channel-backed pair, and a message-passing proxy can do the same.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// A transport-level frame, tagged text or binary by the transport itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Text(String),
	Binary(Vec<u8>),
}

impl Frame {
	/// Convenience constructor for raw control/code bytes sent as binary
	pub fn bytes(data: &[u8]) -> Self {
		Frame::Binary(data.to_vec())
	}
}

/// Outbound half of a transport
#[async_trait]
pub trait FrameSink: Send {
	/// Send one frame
	async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

	/// Close the transport
	async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a transport
#[async_trait]
pub trait FrameSource: Send {
	/// Receive the next frame. `Ok(None)` means the peer closed cleanly
	/// without a reason; an explicit close with a reason is an error so the
	/// caller can distinguish the two.
	async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Opens a transport, yielding its two halves
#[async_trait]
pub trait Connector: Send + Sync {
	async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

type WsStream = tokio_tungstenite::WebSocketStream<
	tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// WebSocket connector for `ws://` and `wss://` device addresses
pub struct WsConnector {
	url: String,
}

impl WsConnector {
	pub fn new(url: &str) -> Self {
		Self { url: url.to_string() }
	}
}

#[async_trait]
impl Connector for WsConnector {
	async fn open(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
		let (stream, _response) =
			tokio_tungstenite::connect_async(self.url.as_str()).await.map_err(|e| {
				TransportError::ConnectFailed { url: self.url.clone(), source: Box::new(e) }
			})?;
		let (sink, source) = stream.split();
		Ok((Box::new(WsSink { sink }), Box::new(WsSource { source })))
	}
}

struct WsSink {
	sink: futures::stream::SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
	async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
		let msg = match frame {
			Frame::Text(text) => Message::Text(text.into()),
			Frame::Binary(data) => Message::Binary(data.into()),
		};
		self.sink.send(msg).await.map_err(|e| TransportError::WebSocket(e.to_string()))
	}

	async fn close(&mut self) -> Result<(), TransportError> {
		self.sink.close().await.map_err(|e| TransportError::WebSocket(e.to_string()))
	}
}

struct WsSource {
	source: futures::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
	async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
		loop {
			match self.source.next().await {
				None => return Ok(None),
				Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
				Some(Ok(Message::Text(text))) => {
					return Ok(Some(Frame::Text(text.to_string())));
				}
				Some(Ok(Message::Binary(data))) => {
					return Ok(Some(Frame::Binary(data.to_vec())));
				}
				Some(Ok(Message::Close(Some(close)))) => {
					if close.reason.is_empty() {
						return Ok(None);
					}
					return Err(TransportError::Closed { reason: close.reason.to_string() });
				}
				Some(Ok(Message::Close(None))) => return Ok(None),
				// Ping/pong handled by tungstenite itself
				Some(Ok(_)) => continue,
			}
		}
	}
}

// vim: ts=4
