//! Device session: connection lifecycle and operation surface
//!
//! One `Session` owns one device connection: the transport halves, the
//! execution state machine, the pending-operation registry and the active
//! transfer slots. Everything is torn down synchronously on disconnect and
//! every still-pending call rejects instead of hanging.
//!
//! There is no global session state; callers hold the `Session` they
//! created and a proxying execution context is just another `Connector`.

use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{FileBackend, SessionConfig};
use crate::error::{DeviceError, TransportError};
use crate::events::DeviceEvent;
use crate::protocol::channel::{self, Transfer, TransferStep};
use crate::protocol::debug_bridge::{self, Breakpoint, DebugBridge};
use crate::protocol::discriminate::{classify, FrameKind};
use crate::protocol::legacy::{self, LegacySlot};
use crate::protocol::pending::{OpKey, OpOutcome, PendingRegistry};
use crate::protocol::raw::{self, ExecEvent, ExecState, RawExec};
use crate::protocol::structured::{self, Classified};
use crate::protocol::{DirEntry, EntryStat};
use crate::transport::{Connector, Frame, FrameSink, FrameSource, WsConnector};

/// Password prompt in the device greeting
const PROMPT_PASSWORD: &str = "Password:";
/// Explicit credential denial
const BANNER_DENIED: &str = "Access denied";
/// Successful login banner
const BANNER_CONNECTED: &str = "WebREPL connected";
/// Raw-mode confirmation text
const BANNER_RAW: &str = "raw REPL";

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
	Disconnected,
	Connecting,
	Authenticating,
	Connected,
}

struct ExecPending {
	resolve: oneshot::Sender<Result<String, DeviceError>>,
	silent: bool,
	stderr: String,
	captured: Option<String>,
}

struct ExecCtx {
	machine: RawExec,
	pending: Option<ExecPending>,
}

struct TransferCtx {
	transfer: Transfer,
	resolve: oneshot::Sender<Result<Vec<u8>, DeviceError>>,
}

struct Shared {
	config: SessionConfig,
	state: StdMutex<ConnState>,
	exec: Mutex<ExecCtx>,
	pending: Mutex<PendingRegistry>,
	transfer: Mutex<Option<TransferCtx>>,
	legacy: Mutex<Option<LegacySlot>>,
	debug: Mutex<DebugBridge>,
	sink: Mutex<Option<Box<dyn FrameSink>>>,
	events: mpsc::UnboundedSender<DeviceEvent>,
}

/// A connection to one device
pub struct Session {
	shared: Arc<Shared>,
	connector: Box<dyn Connector>,
	events_rx: StdMutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
	reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
	/// Create a session for the configured WebSocket address
	pub fn new(config: SessionConfig) -> Self {
		let connector = Box::new(WsConnector::new(&config.url));
		Self::with_connector(config, connector)
	}

	/// Create a session over any transport implementation
	pub fn with_connector(config: SessionConfig, connector: Box<dyn Connector>) -> Self {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		Self {
			shared: Arc::new(Shared {
				config,
				state: StdMutex::new(ConnState::Disconnected),
				exec: Mutex::new(ExecCtx { machine: RawExec::new(), pending: None }),
				pending: Mutex::new(PendingRegistry::new()),
				transfer: Mutex::new(None),
				legacy: Mutex::new(None),
				debug: Mutex::new(DebugBridge::new()),
				sink: Mutex::new(None),
				events: events_tx,
			}),
			connector,
			events_rx: StdMutex::new(Some(events_rx)),
			reader: StdMutex::new(None),
		}
	}

	/// Take the event receiver. Yields `Some` exactly once.
	pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
		self.events_rx.lock().unwrap().take()
	}

	/// Current lifecycle state; always safe to read
	pub fn state(&self) -> ConnState {
		*self.shared.state.lock().unwrap()
	}

	pub fn is_connected(&self) -> bool {
		self.state() == ConnState::Connected
	}

	/// Open the transport, authenticate and enter raw mode.
	///
	/// Fails immediately with `AlreadyConnected` while not `Disconnected`;
	/// there is no queuing and no auto-retry.
	pub async fn connect(&self) -> Result<(), DeviceError> {
		{
			let mut state = self.shared.state.lock().unwrap();
			if *state != ConnState::Disconnected {
				return Err(DeviceError::AlreadyConnected);
			}
			*state = ConnState::Connecting;
		}

		match self.do_connect().await {
			Ok(()) => {
				emit(&self.shared, DeviceEvent::Connected);
				Ok(())
			}
			Err(e) => {
				if let Some(mut sink) = self.shared.sink.lock().await.take() {
					let _ = sink.close().await;
				}
				*self.shared.state.lock().unwrap() = ConnState::Disconnected;
				Err(e)
			}
		}
	}

	async fn do_connect(&self) -> Result<(), DeviceError> {
		let (sink, mut source) = self.connector.open().await?;
		*self.shared.sink.lock().await = Some(sink);

		let raw_mode = self.handshake(&mut source).await?;
		*self.shared.state.lock().unwrap() = ConnState::Connected;

		if raw_mode {
			debug!("Device greeted in raw mode, skipping entry byte");
		} else {
			self.enter_raw_mode(&mut source).await?;
		}

		let shared = self.shared.clone();
		let handle = tokio::spawn(reader_loop(source, shared));
		*self.reader.lock().unwrap() = Some(handle);

		info!("Connected to {}", self.shared.config.url);
		Ok(())
	}

	/// Drive the greeting/credential exchange. Returns whether the banner
	/// already confirmed raw mode.
	async fn handshake(&self, source: &mut Box<dyn FrameSource>) -> Result<bool, DeviceError> {
		let timeout = self.shared.config.connect_timeout();
		let deadline = Instant::now() + timeout;
		let mut banner = String::new();
		let mut password_sent = false;

		loop {
			let text = match next_text(source, deadline).await? {
				Some(text) => text,
				None => return Err(DeviceError::timeout("device greeting", timeout)),
			};
			banner.push_str(&text);

			if banner.contains(BANNER_DENIED) {
				return Err(DeviceError::Authentication {
					message: "Device denied the credential".to_string(),
				});
			}
			if banner.contains(BANNER_RAW) {
				return Ok(true);
			}
			if banner.contains(BANNER_CONNECTED) {
				return Ok(false);
			}
			if banner.contains(PROMPT_PASSWORD) && !password_sent {
				let password = self.shared.config.password.clone().ok_or_else(|| {
					DeviceError::Authentication {
						message: "Device requires a password, none configured".to_string(),
					}
				})?;
				*self.shared.state.lock().unwrap() = ConnState::Authenticating;
				self.send(Frame::Text(format!("{}\r", password))).await?;
				password_sent = true;
				banner.clear();
			}
		}
	}

	/// Request raw mode and wait, bounded, for the confirming banner. On
	/// bound elapse raw mode is assumed active rather than failing; a slow
	/// banner must not take down an otherwise usable connection.
	async fn enter_raw_mode(&self, source: &mut Box<dyn FrameSource>) -> Result<(), DeviceError> {
		self.send(Frame::bytes(&[raw::CTRL_ENTER_RAW])).await?;

		let wait = self.shared.config.raw_mode_wait();
		let deadline = Instant::now() + wait;
		let mut banner = String::new();
		loop {
			match next_text(source, deadline).await? {
				Some(text) => {
					banner.push_str(&text);
					if banner.contains(BANNER_RAW) {
						return Ok(());
					}
				}
				None => {
					warn!(
						"Raw mode not confirmed within {}ms, assuming active",
						wait.as_millis()
					);
					return Ok(());
				}
			}
		}
	}

	/// Close the connection and reject everything still pending
	pub async fn disconnect(&self) -> Result<(), DeviceError> {
		if !begin_teardown(&self.shared) {
			return Ok(());
		}
		if let Some(handle) = self.reader.lock().unwrap().take() {
			handle.abort();
		}
		if let Some(mut sink) = self.shared.sink.lock().await.take() {
			let _ = sink.close().await;
		}
		reject_all_pending(&self.shared, "client disconnect").await;
		emit(
			&self.shared,
			DeviceEvent::Disconnected { reason: "client disconnect".to_string() },
		);
		Ok(())
	}

	/// Execute a code block in raw mode.
	///
	/// Resolves with the run's stderr text, or for silent runs with the raw
	/// text of a structured frame captured during the run. At most one
	/// execution is outstanding at a time: a busy session is first forced
	/// back to idle with an interrupt and a bounded wait.
	pub async fn execute(&self, code: &str, silent: bool) -> Result<String, DeviceError> {
		self.ensure_connected()?;

		let busy = {
			let exec = self.shared.exec.lock().await;
			exec.pending.is_some() || exec.machine.state() != ExecState::Idle
		};
		if busy {
			self.interrupt().await?;
			self.wait_for_idle().await?;
		}

		let (tx, rx) = oneshot::channel();
		{
			let mut exec = self.shared.exec.lock().await;
			if exec.pending.is_some() {
				return Err(DeviceError::Protocol {
					message: "Execution already in flight".to_string(),
				});
			}
			exec.machine.begin();
			exec.pending =
				Some(ExecPending { resolve: tx, silent, stderr: String::new(), captured: None });
		}

		let mut payload = code.as_bytes().to_vec();
		payload.push(raw::CTRL_SUBMIT);
		if let Err(e) = self.send(Frame::Binary(payload)).await {
			self.abort_exec().await;
			return Err(e);
		}

		let timeout = self.shared.config.exec_timeout();
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(DeviceError::connection_closed()),
			Err(_) => {
				// Unblock subsequent calls: clear the slot and force Idle
				self.abort_exec().await;
				Err(DeviceError::timeout("execution", timeout))
			}
		}
	}

	async fn abort_exec(&self) {
		let mut exec = self.shared.exec.lock().await;
		exec.pending = None;
		exec.machine.reset();
	}

	async fn wait_for_idle(&self) -> Result<(), DeviceError> {
		let wait = self.shared.config.interrupt_wait();
		let deadline = Instant::now() + wait;
		loop {
			{
				let exec = self.shared.exec.lock().await;
				if exec.pending.is_none() && exec.machine.state() == ExecState::Idle {
					return Ok(());
				}
			}
			if Instant::now() >= deadline {
				return Err(DeviceError::timeout("idle after interrupt", wait));
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	}

	/// Best-effort interrupt of the running program. The device's own
	/// response drives any state change.
	pub async fn interrupt(&self) -> Result<(), DeviceError> {
		self.ensure_connected()?;
		self.send(Frame::bytes(&[raw::CTRL_INTERRUPT])).await
	}

	/// Read a whole file from the device
	pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, DeviceError> {
		self.ensure_connected()?;
		match self.shared.config.backend {
			FileBackend::Channel => self.channel_read(path).await,
			FileBackend::Legacy => match self.legacy_call(legacy::encode_get(path)?, legacy::OP_GET).await? {
				Some(payload) => Ok(payload),
				None => Err(DeviceError::Protocol {
					message: "GET response carried no payload".to_string(),
				}),
			},
		}
	}

	/// Write a whole file to the device
	pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), DeviceError> {
		self.ensure_connected()?;
		match self.shared.config.backend {
			FileBackend::Channel => self.channel_write(path, data.to_vec()).await,
			FileBackend::Legacy => {
				self.legacy_call(legacy::encode_put(path, data)?, legacy::OP_PUT).await?;
				Ok(())
			}
		}
	}

	/// List a directory on the device
	pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, DeviceError> {
		let fields = self
			.channel_meta(channel::OP_LIST, channel::list_request(path), "list directory")
			.await?;
		channel::decode_list(&fields)
	}

	/// Stat one path on the device
	pub async fn stat(&self, path: &str) -> Result<EntryStat, DeviceError> {
		let fields =
			self.channel_meta(channel::OP_STAT, channel::stat_request(path), "stat").await?;
		channel::decode_stat(&fields)
	}

	/// Delete a file or directory entry
	pub async fn delete(&self, path: &str) -> Result<(), DeviceError> {
		self.channel_meta(channel::OP_DELETE, channel::delete_request(path), "delete").await?;
		Ok(())
	}

	/// Create a directory
	pub async fn make_dir(&self, path: &str) -> Result<(), DeviceError> {
		self.channel_meta(channel::OP_MKDIR, channel::mkdir_request(path), "mkdir").await?;
		Ok(())
	}

	/// Rename an entry
	pub async fn rename(&self, old: &str, new: &str) -> Result<(), DeviceError> {
		self.channel_meta(channel::OP_RENAME, channel::rename_request(old, new), "rename")
			.await?;
		Ok(())
	}

	/// Remote procedure call over channel 2, correlated by a fresh token
	pub async fn rpc(&self, method: &str, params: Value) -> Result<Value, DeviceError> {
		self.ensure_connected()?;
		let token = uuid::Uuid::new_v4().to_string();
		let frame = Frame::Binary(channel::rpc_request(&token, method, &params).encode());
		let outcome = self
			.roundtrip(OpKey::Token(token), "rpc", frame, self.shared.config.meta_timeout())
			.await?;
		expect_json(outcome)
	}

	/// Structured command over the interactive channel, correlated by tag.
	/// Broadcast tags are reserved and rejected here, so one tag can never
	/// mean both a broadcast and a response.
	pub async fn command(&self, tag: &str, arg: Value) -> Result<Value, DeviceError> {
		self.ensure_connected()?;
		if structured::is_broadcast_tag(tag) {
			return Err(DeviceError::Protocol {
				message: format!("Tag {} is reserved for broadcasts", tag),
			});
		}
		let frame = Frame::Text(structured::encode(tag, &arg));
		let outcome = self
			.roundtrip(
				OpKey::Command(tag.to_string()),
				"command",
				frame,
				self.shared.config.meta_timeout(),
			)
			.await?;
		expect_json(outcome)
	}

	/// Send a debug-protocol request and await its acknowledgement
	pub async fn debug_request(&self, command: &str, arguments: Value) -> Result<Value, DeviceError> {
		self.ensure_connected()?;
		let (seq, envelope) = {
			let mut bridge = self.shared.debug.lock().await;
			bridge.build_request(command, &arguments)
		};
		let outcome = self
			.roundtrip(
				OpKey::Token(format!("dbg-{}", seq)),
				"debug request",
				Frame::Text(envelope),
				self.shared.config.meta_timeout(),
			)
			.await?;
		expect_json(outcome)
	}

	/// Replace the breakpoint set for one file (client-side records)
	pub async fn set_breakpoints(&self, path: &str, lines: &[u64]) -> Vec<Breakpoint> {
		self.shared.debug.lock().await.set_breakpoints(path, lines)
	}

	/// Debug capabilities negotiated to the host
	pub async fn debug_capabilities(&self) -> Value {
		self.shared.debug.lock().await.capabilities()
	}

	// ===== Internals =====

	fn ensure_connected(&self) -> Result<(), DeviceError> {
		if self.is_connected() {
			Ok(())
		} else {
			Err(DeviceError::NotConnected)
		}
	}

	async fn send(&self, frame: Frame) -> Result<(), DeviceError> {
		let mut guard = self.shared.sink.lock().await;
		let sink = guard.as_mut().ok_or(DeviceError::NotConnected)?;
		sink.send(frame).await.map_err(DeviceError::from)
	}

	/// Register a pending operation, send its request and await the
	/// correlated response within the operation's bound.
	async fn roundtrip(
		&self,
		key: OpKey,
		operation: &str,
		frame: Frame,
		timeout: Duration,
	) -> Result<OpOutcome, DeviceError> {
		let rx = {
			let mut pending = self.shared.pending.lock().await;
			pending.register(key.clone(), operation, timeout)?
		};
		if let Err(e) = self.send(frame).await {
			self.shared.pending.lock().await.remove(&key);
			return Err(e);
		}
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(DeviceError::connection_closed()),
			Err(_) => {
				self.shared.pending.lock().await.remove(&key);
				Err(DeviceError::timeout(operation, timeout))
			}
		}
	}

	async fn channel_meta(
		&self,
		opcode: u8,
		envelope: channel::Envelope,
		operation: &str,
	) -> Result<Vec<rmpv::Value>, DeviceError> {
		self.ensure_connected()?;
		if self.shared.config.backend != FileBackend::Channel {
			return Err(DeviceError::NotSupported { operation: operation.to_string() });
		}
		let key = OpKey::Channel { channel: channel::CH_FILE, opcode };
		let frame = Frame::Binary(envelope.encode());
		match self.roundtrip(key, operation, frame, self.shared.config.meta_timeout()).await? {
			OpOutcome::Channel(fields) => Ok(fields),
			OpOutcome::Json(_) => Err(DeviceError::Protocol {
				message: format!("Unexpected payload kind for {}", operation),
			}),
		}
	}

	async fn channel_read(&self, path: &str) -> Result<Vec<u8>, DeviceError> {
		let (tx, rx) = oneshot::channel();
		{
			let mut slot = self.shared.transfer.lock().await;
			if slot.is_some() {
				return Err(DeviceError::Protocol {
					message: "File transfer already in flight".to_string(),
				});
			}
			*slot = Some(TransferCtx {
				transfer: Transfer::read(self.shared.config.block_size),
				resolve: tx,
			});
		}
		let frame = Frame::Binary(channel::read_request(path).encode());
		if let Err(e) = self.send(frame).await {
			self.shared.transfer.lock().await.take();
			return Err(e);
		}
		self.await_transfer(rx, "file read").await
	}

	async fn channel_write(&self, path: &str, data: Vec<u8>) -> Result<(), DeviceError> {
		let mut transfer = Transfer::write(data, self.shared.config.block_size);
		let frames = transfer.open_frames(path);
		let (tx, rx) = oneshot::channel();
		{
			let mut slot = self.shared.transfer.lock().await;
			if slot.is_some() {
				return Err(DeviceError::Protocol {
					message: "File transfer already in flight".to_string(),
				});
			}
			*slot = Some(TransferCtx { transfer, resolve: tx });
		}
		for envelope in frames {
			if let Err(e) = self.send(Frame::Binary(envelope.encode())).await {
				self.shared.transfer.lock().await.take();
				return Err(e);
			}
		}
		self.await_transfer(rx, "file write").await.map(|_| ())
	}

	async fn await_transfer(
		&self,
		rx: oneshot::Receiver<Result<Vec<u8>, DeviceError>>,
		operation: &str,
	) -> Result<Vec<u8>, DeviceError> {
		let timeout = self.shared.config.transfer_timeout();
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(DeviceError::connection_closed()),
			Err(_) => {
				self.shared.transfer.lock().await.take();
				Err(DeviceError::timeout(operation, timeout))
			}
		}
	}

	/// One legacy request/response exchange. The slot is cleared on timeout,
	/// so a stale response finds nothing to resolve and is dropped.
	async fn legacy_call(
		&self,
		request: Vec<u8>,
		opcode: u8,
	) -> Result<Option<Vec<u8>>, DeviceError> {
		let (tx, rx) = oneshot::channel();
		{
			let mut slot = self.shared.legacy.lock().await;
			if slot.is_some() {
				return Err(DeviceError::Protocol {
					message: "Legacy transfer already in flight".to_string(),
				});
			}
			*slot = Some(LegacySlot { opcode, resolve: tx });
		}
		if let Err(e) = self.send(Frame::Binary(request)).await {
			self.shared.legacy.lock().await.take();
			return Err(e);
		}
		let timeout = self.shared.config.transfer_timeout();
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(DeviceError::connection_closed()),
			Err(_) => {
				self.shared.legacy.lock().await.take();
				Err(DeviceError::timeout("legacy transfer", timeout))
			}
		}
	}
}

/// Read text frames until the deadline; binary frames during the handshake
/// are ignored. `Ok(None)` means the deadline elapsed.
async fn next_text(
	source: &mut Box<dyn FrameSource>,
	deadline: Instant,
) -> Result<Option<String>, DeviceError> {
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			return Ok(None);
		}
		match tokio::time::timeout(remaining, source.recv()).await {
			Err(_) => return Ok(None),
			Ok(Err(e)) => return Err(e.into()),
			Ok(Ok(None)) => {
				return Err(TransportError::ClosedUnexpectedly.into());
			}
			Ok(Ok(Some(Frame::Text(text)))) => return Ok(Some(text)),
			Ok(Ok(Some(Frame::Binary(_)))) => continue,
		}
	}
}

fn emit(shared: &Arc<Shared>, event: DeviceEvent) {
	let _ = shared.events.send(event);
}

/// Swap the state to Disconnected. Returns false if teardown already ran,
/// so client- and peer-initiated teardown cannot both fire.
fn begin_teardown(shared: &Arc<Shared>) -> bool {
	let mut state = shared.state.lock().unwrap();
	if *state == ConnState::Disconnected {
		false
	} else {
		*state = ConnState::Disconnected;
		true
	}
}

async fn reject_all_pending(shared: &Arc<Shared>, reason: &str) {
	shared.pending.lock().await.reject_all(reason);
	{
		let mut exec = shared.exec.lock().await;
		if let Some(pending) = exec.pending.take() {
			let _ = pending.resolve.send(Err(DeviceError::connection_closed()));
		}
		exec.machine.reset();
	}
	if let Some(ctx) = shared.transfer.lock().await.take() {
		let _ = ctx.resolve.send(Err(DeviceError::connection_closed()));
	}
	if let Some(slot) = shared.legacy.lock().await.take() {
		let _ = slot.resolve.send(Err(DeviceError::connection_closed()));
	}
}

/// Reader task: frames are processed strictly in arrival order
async fn reader_loop(mut source: Box<dyn FrameSource>, shared: Arc<Shared>) {
	let reason = loop {
		match source.recv().await {
			Ok(Some(frame)) => dispatch_frame(&shared, frame).await,
			Ok(None) => break "closed by peer".to_string(),
			Err(e) => break e.to_string(),
		}
	};
	if begin_teardown(&shared) {
		if let Some(mut sink) = shared.sink.lock().await.take() {
			let _ = sink.close().await;
		}
		reject_all_pending(&shared, &reason).await;
		emit(&shared, DeviceEvent::Disconnected { reason });
	}
}

async fn dispatch_frame(shared: &Arc<Shared>, frame: Frame) {
	match classify(&frame) {
		FrameKind::DebugEnvelope(text) => handle_debug(shared, text).await,
		FrameKind::Interactive(text) => handle_text(shared, text).await,
		FrameKind::LegacyFile(bytes) => handle_legacy(shared, bytes).await,
		FrameKind::Channel(bytes) => handle_channel(shared, bytes).await,
		FrameKind::Unroutable => {
			warn!("Dropping unroutable frame: {:?}", frame);
		}
	}
}

/// Interactive text: structured frames are intercepted first, everything
/// else drives the execution state machine.
async fn handle_text(shared: &Arc<Shared>, text: &str) {
	if let Some(frame) = structured::parse(text) {
		match structured::classify(&frame) {
			Classified::Telemetry(payload) => {
				emit(shared, DeviceEvent::Telemetry { payload });
			}
			Classified::DisplayUi(payload) => {
				emit(shared, DeviceEvent::DisplayUi { payload });
			}
			Classified::Response { tag, arg } => {
				let resolved = shared
					.pending
					.lock()
					.await
					.resolve(&OpKey::Command(tag.clone()), OpOutcome::Json(arg));
				if !resolved {
					debug!("Unmatched structured response: {}", tag);
				}
			}
		}
		// Considered for the execution's return value only after dispatch,
		// and never forwarded as terminal output
		let mut exec = shared.exec.lock().await;
		if let Some(pending) = exec.pending.as_mut() {
			if pending.silent && pending.captured.is_none() {
				pending.captured = Some(frame.raw);
			}
		}
		return;
	}

	let mut exec = shared.exec.lock().await;
	let events = exec.machine.feed(text);
	for event in events {
		match event {
			ExecEvent::Stdout(text) => {
				let silent = exec.pending.as_ref().map(|p| p.silent).unwrap_or(false);
				if !silent {
					emit(shared, DeviceEvent::Data { text, is_error: false });
				}
			}
			ExecEvent::Stderr(text) => {
				let silent = match exec.pending.as_mut() {
					Some(pending) => {
						pending.stderr.push_str(&text);
						pending.silent
					}
					None => false,
				};
				if !silent {
					emit(shared, DeviceEvent::Data { text, is_error: true });
				}
			}
			ExecEvent::Completed => {
				if let Some(pending) = exec.pending.take() {
					let result = match (pending.silent, pending.captured) {
						(true, Some(captured)) => captured,
						_ => pending.stderr,
					};
					let _ = pending.resolve.send(Ok(result));
				}
			}
			ExecEvent::IdleText(text) => {
				emit(shared, DeviceEvent::Data { text, is_error: false });
			}
		}
	}
}

async fn handle_legacy(shared: &Arc<Shared>, bytes: &[u8]) {
	let slot = shared.legacy.lock().await.take();
	let slot = match slot {
		Some(slot) => slot,
		None => {
			debug!("Stale legacy response ({} bytes), dropping", bytes.len());
			return;
		}
	};
	let result = match legacy::decode_response(bytes) {
		Err(e) => Err(e),
		Ok(response) if response.status != legacy::STATUS_OK => Err(DeviceError::Device {
			message: format!("Legacy operation failed with status {}", response.status),
		}),
		Ok(response) if slot.opcode == legacy::OP_GET && response.payload.is_none() => {
			Err(DeviceError::Protocol { message: "GET response carried no payload".to_string() })
		}
		Ok(response) => Ok(response.payload),
	};
	let _ = slot.resolve.send(result);
}

async fn handle_debug(shared: &Arc<Shared>, text: &str) {
	let body = match debug_bridge::decode_envelope(text) {
		Ok(body) => body,
		Err(e) => {
			warn!("Dropping bad debug envelope: {}", e);
			return;
		}
	};
	let value: Value = match serde_json::from_str(body) {
		Ok(value) => value,
		Err(e) => {
			warn!("Dropping non-JSON debug body: {}", e);
			return;
		}
	};
	match value.get("type").and_then(Value::as_str) {
		Some("response") => {
			let request_seq = value.get("request_seq").and_then(Value::as_u64).unwrap_or(0);
			let key = OpKey::Token(format!("dbg-{}", request_seq));
			let resolved =
				shared.pending.lock().await.resolve(&key, OpOutcome::Json(value.clone()));
			if !resolved {
				debug!("Stale debug response for seq {}", request_seq);
			}
		}
		Some("event") => {
			emit(shared, DeviceEvent::Debug { body: body.to_string() });
		}
		Some("request") => {
			let replies = {
				let mut bridge = shared.debug.lock().await;
				bridge.handle_request(&value)
			};
			for reply in replies {
				send_frame(shared, Frame::Text(reply)).await;
			}
		}
		other => {
			debug!("Ignoring debug message type {:?}", other);
		}
	}
}

async fn handle_channel(shared: &Arc<Shared>, bytes: &[u8]) {
	let envelope = match channel::Envelope::decode(bytes) {
		Ok(envelope) => envelope,
		Err(e) => {
			warn!("Dropping undecodable envelope: {}", e);
			return;
		}
	};
	match envelope.channel {
		channel::CH_EVENTS => handle_event_channel(shared, &envelope),
		channel::CH_TERMINAL => handle_terminal_channel(shared, &envelope),
		channel::CH_RPC => handle_rpc_channel(shared, &envelope).await,
		channel::CH_FILE => handle_file_channel(shared, &envelope).await,
		other => {
			warn!("Dropping frame for unknown channel {}", other);
		}
	}
}

fn handle_event_channel(shared: &Arc<Shared>, envelope: &channel::Envelope) {
	if envelope.opcode != channel::OP_EVENT_TELEMETRY {
		debug!("Ignoring event opcode {}", envelope.opcode);
		return;
	}
	let payload = envelope
		.fields
		.first()
		.and_then(|v| serde_json::to_value(v).ok())
		.unwrap_or(Value::Null);
	emit(shared, DeviceEvent::Telemetry { payload });
}

fn handle_terminal_channel(shared: &Arc<Shared>, envelope: &channel::Envelope) {
	let payload = match envelope.fields.first() {
		Some(payload) => payload,
		None => {
			debug!("Terminal frame without payload");
			return;
		}
	};
	let text = if let Some(text) = payload.as_str() {
		text.to_string()
	} else if let Some(bytes) = payload.as_slice() {
		String::from_utf8_lossy(bytes).to_string()
	} else {
		debug!("Terminal frame with non-text payload");
		return;
	};
	emit(shared, DeviceEvent::Data { text, is_error: false });
}

async fn handle_rpc_channel(shared: &Arc<Shared>, envelope: &channel::Envelope) {
	if envelope.opcode != channel::OP_RPC_RESPONSE || envelope.fields.len() < 2 {
		debug!("Ignoring rpc frame op {}", envelope.opcode);
		return;
	}
	let token = match envelope.fields[0].as_str() {
		Some(token) => token.to_string(),
		None => {
			warn!("Rpc response with non-string token");
			return;
		}
	};
	let result = serde_json::to_value(&envelope.fields[1]).unwrap_or(Value::Null);
	let resolved = shared
		.pending
		.lock()
		.await
		.resolve(&OpKey::Token(token.clone()), OpOutcome::Json(result));
	if !resolved {
		debug!("Stale rpc response for token {}", token);
	}
}

async fn handle_file_channel(shared: &Arc<Shared>, envelope: &channel::Envelope) {
	match envelope.opcode {
		channel::OP_DATA => {
			let seq = envelope.fields.first().and_then(|v| v.as_u64());
			let data = envelope.fields.get(1).and_then(|v| v.as_slice());
			let (seq, data) = match (seq, data) {
				(Some(seq), Some(data)) => (seq, data),
				_ => {
					warn!("Malformed data block, dropping");
					return;
				}
			};
			let mut outgoing = Vec::new();
			let mut done = None;
			{
				let mut slot = shared.transfer.lock().await;
				let steps = match slot.as_mut() {
					Some(ctx) => ctx.transfer.on_data(seq, data),
					None => {
						debug!("Data block with no transfer in flight");
						return;
					}
				};
				match steps {
					Ok(steps) => {
						for step in steps {
							match step {
								TransferStep::Send(envelope) => outgoing.push(envelope),
								TransferStep::Complete(bytes) => {
									if let Some(ctx) = slot.take() {
										done = Some((ctx.resolve, Ok(bytes)));
									}
								}
							}
						}
					}
					Err(e) => {
						if let Some(ctx) = slot.take() {
							done = Some((ctx.resolve, Err(e)));
						}
					}
				}
			}
			for envelope in outgoing {
				send_frame(shared, Frame::Binary(envelope.encode())).await;
			}
			if let Some((resolve, result)) = done {
				let _ = resolve.send(result);
			}
		}
		channel::OP_ACK => {
			let seq = match envelope.fields.first().and_then(|v| v.as_u64()) {
				Some(seq) => seq,
				None => {
					warn!("Malformed acknowledgement, dropping");
					return;
				}
			};
			let mut outgoing = None;
			let mut done = None;
			{
				let mut slot = shared.transfer.lock().await;
				let step = match slot.as_mut() {
					Some(ctx) => ctx.transfer.on_ack(seq),
					None => {
						debug!("Acknowledgement with no transfer in flight");
						return;
					}
				};
				match step {
					Ok(TransferStep::Send(envelope)) => outgoing = Some(envelope),
					Ok(TransferStep::Complete(bytes)) => {
						if let Some(ctx) = slot.take() {
							done = Some((ctx.resolve, Ok(bytes)));
						}
					}
					Err(e) => {
						if let Some(ctx) = slot.take() {
							done = Some((ctx.resolve, Err(e)));
						}
					}
				}
			}
			if let Some(envelope) = outgoing {
				send_frame(shared, Frame::Binary(envelope.encode())).await;
			}
			if let Some((resolve, result)) = done {
				let _ = resolve.send(result);
			}
		}
		channel::OP_ERROR => {
			let for_opcode = envelope.fields.first().and_then(|v| v.as_u64()).unwrap_or(0) as u8;
			let message = envelope
				.fields
				.get(1)
				.and_then(|v| v.as_str())
				.unwrap_or("device error")
				.to_string();
			let error = DeviceError::Device { message };
			let transfer_op = matches!(
				for_opcode,
				channel::OP_READ | channel::OP_WRITE | channel::OP_DATA | channel::OP_ACK
			);
			if transfer_op {
				if let Some(ctx) = shared.transfer.lock().await.take() {
					let _ = ctx.resolve.send(Err(error));
					return;
				}
				debug!("Transfer error with no transfer in flight");
				return;
			}
			let key = OpKey::Channel { channel: channel::CH_FILE, opcode: for_opcode };
			if !shared.pending.lock().await.reject(&key, error) {
				debug!("Device error for idle operation {}", key);
			}
		}
		channel::OP_LIST
		| channel::OP_DELETE
		| channel::OP_RENAME
		| channel::OP_MKDIR
		| channel::OP_STAT => {
			let key = OpKey::Channel { channel: channel::CH_FILE, opcode: envelope.opcode };
			let resolved = shared
				.pending
				.lock()
				.await
				.resolve(&key, OpOutcome::Channel(envelope.fields.clone()));
			if !resolved {
				debug!("Stale response for {}", key);
			}
		}
		other => {
			debug!("Ignoring file-channel opcode {}", other);
		}
	}
}

async fn send_frame(shared: &Arc<Shared>, frame: Frame) {
	let mut guard = shared.sink.lock().await;
	if let Some(sink) = guard.as_mut() {
		if let Err(e) = sink.send(frame).await {
			warn!("Send failed: {}", e);
		}
	}
}

fn expect_json(outcome: OpOutcome) -> Result<Value, DeviceError> {
	match outcome {
		OpOutcome::Json(value) => Ok(value),
		OpOutcome::Channel(_) => {
			Err(DeviceError::Protocol { message: "Unexpected payload kind".to_string() })
		}
	}
}

// vim: ts=4
