//! # replink - MicroPython board link over WebSocket
//!
//! replink speaks to MicroPython-class microcontrollers over a single
//! bidirectional WebSocket-style transport: authenticate, execute code in
//! raw mode, and transfer files over either the legacy binary protocol or
//! the channelized envelope, all multiplexed on one connection.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use replink::config::SessionConfig;
//! use replink::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = SessionConfig::new("ws://192.168.4.1:8266");
//!     config.password = Some("secret".to_string());
//!
//!     let session = Session::new(config);
//!     let mut events = session.take_events().unwrap();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     session.connect().await?;
//!     session.execute("print('hello')", false).await?;
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::{FileBackend, SessionConfig};
pub use error::{DeviceError, TransportError};
pub use events::DeviceEvent;
pub use session::{ConnState, Session};

// vim: ts=4
