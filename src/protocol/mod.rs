//! Protocol layer
//!
//! Codecs and state machines for everything the device speaks over one
//! transport: raw-mode execution, the legacy binary file protocol, the
//! channelized MessagePack envelope, structured command frames, and the
//! length-prefixed debug envelope. The session feeds every inbound frame
//! through `discriminate` and routes it to the owning handler.
//!
//! The state machines here are synchronous and I/O-free; the session maps
//! their outputs to events and outbound frames. This keeps the sequencing
//! logic unit-testable without a transport.

pub mod channel;
pub mod debug_bridge;
pub mod discriminate;
pub mod legacy;
pub mod pending;
pub mod raw;
pub mod structured;

// Re-export public API
pub use channel::{DirEntry, EntryKind, EntryStat, Envelope};
pub use debug_bridge::{Breakpoint, DebugBridge};
pub use discriminate::FrameKind;
pub use pending::{OpKey, OpOutcome, PendingRegistry};
pub use raw::ExecState;

// vim: ts=4
