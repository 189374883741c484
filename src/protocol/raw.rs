//! Raw-mode execution state machine
//!
//! Code is submitted as a complete block terminated by a control byte. The
//! device acknowledges with `OK`, streams stdout, then an end-of-stream byte,
//! then stderr, then a second end-of-stream byte completing the run.
//!
//! This machine is synchronous and transport-free: the session feeds it
//! inbound text and acts on the returned events. Chunk boundaries carry no
//! meaning; the ack and both end-of-stream bytes may arrive split across
//! frames or glued to surrounding output.

/// Enter raw mode
pub const CTRL_ENTER_RAW: u8 = 0x01;
/// Leave raw mode
pub const CTRL_EXIT_RAW: u8 = 0x02;
/// Interrupt the running program
pub const CTRL_INTERRUPT: u8 = 0x03;
/// Terminates a submitted code block; also the end-of-stream byte
pub const CTRL_SUBMIT: u8 = 0x04;

const EOS: char = '\u{4}';
const ACK: &str = "OK";

/// Execution sub-states while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
	Idle,
	AwaitingAck,
	StreamingStdout,
	StreamingStderr,
}

/// What the fed text meant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
	/// Stdout segment, in arrival order, never mixed with stderr
	Stdout(String),
	/// Stderr segment
	Stderr(String),
	/// Second end-of-stream byte seen; the run is complete
	Completed,
	/// Text arriving while no execution is in flight
	IdleText(String),
}

/// The execution state machine
#[derive(Debug)]
pub struct RawExec {
	state: ExecState,
	/// Carry-over while hunting for the ack across chunk boundaries
	ack_window: String,
	/// True once the completion prompt still owes us its leading marker
	eat_prompt: bool,
}

impl RawExec {
	pub fn new() -> Self {
		Self { state: ExecState::Idle, ack_window: String::new(), eat_prompt: false }
	}

	pub fn state(&self) -> ExecState {
		self.state
	}

	/// Move to AwaitingAck for a freshly submitted block
	pub fn begin(&mut self) {
		self.state = ExecState::AwaitingAck;
		self.ack_window.clear();
		self.eat_prompt = false;
	}

	/// Force Idle so subsequent calls are not blocked (timeout recovery)
	pub fn reset(&mut self) {
		self.state = ExecState::Idle;
		self.ack_window.clear();
		self.eat_prompt = false;
	}

	/// Feed one inbound text chunk, producing events in order
	pub fn feed(&mut self, text: &str) -> Vec<ExecEvent> {
		let mut events = Vec::new();
		let mut rest = text.to_string();

		while !rest.is_empty() {
			match self.state {
				ExecState::Idle => {
					if self.eat_prompt {
						self.eat_prompt = false;
						if let Some(stripped) = rest.strip_prefix('>') {
							rest = stripped.to_string();
							continue;
						}
					}
					events.push(ExecEvent::IdleText(std::mem::take(&mut rest)));
				}
				ExecState::AwaitingAck => {
					self.ack_window.push_str(&rest);
					rest.clear();
					if let Some(pos) = self.ack_window.find(ACK) {
						rest = self.ack_window.split_off(pos + ACK.len());
						self.ack_window.clear();
						self.state = ExecState::StreamingStdout;
					}
				}
				ExecState::StreamingStdout => match rest.find(EOS) {
					Some(pos) => {
						if pos > 0 {
							events.push(ExecEvent::Stdout(rest[..pos].to_string()));
						}
						rest = rest[pos + 1..].to_string();
						self.state = ExecState::StreamingStderr;
					}
					None => {
						events.push(ExecEvent::Stdout(std::mem::take(&mut rest)));
					}
				},
				ExecState::StreamingStderr => match rest.find(EOS) {
					Some(pos) => {
						if pos > 0 {
							events.push(ExecEvent::Stderr(rest[..pos].to_string()));
						}
						rest = rest[pos + 1..].to_string();
						self.state = ExecState::Idle;
						self.eat_prompt = true;
						events.push(ExecEvent::Completed);
					}
					None => {
						events.push(ExecEvent::Stderr(std::mem::take(&mut rest)));
					}
				},
			}
		}

		events
	}
}

impl Default for RawExec {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_single_chunk_run() {
		let mut exec = RawExec::new();
		exec.begin();
		let events = exec.feed("OKhello\n\u{4}\u{4}>");
		assert_eq!(
			events,
			vec![ExecEvent::Stdout("hello\n".to_string()), ExecEvent::Completed]
		);
		assert_eq!(exec.state(), ExecState::Idle);
	}

	#[test]
	fn test_ack_split_across_chunks() {
		let mut exec = RawExec::new();
		exec.begin();
		assert!(exec.feed("O").is_empty());
		let events = exec.feed("Kout");
		assert_eq!(events, vec![ExecEvent::Stdout("out".to_string())]);
		assert_eq!(exec.state(), ExecState::StreamingStdout);
	}

	#[test]
	fn test_stdout_then_error_ordering() {
		let mut exec = RawExec::new();
		exec.begin();
		let mut events = exec.feed("OKpartial");
		events.extend(exec.feed(" output\u{4}Traceback: boom"));
		events.extend(exec.feed("\u{4}>"));
		assert_eq!(
			events,
			vec![
				ExecEvent::Stdout("partial".to_string()),
				ExecEvent::Stdout(" output".to_string()),
				ExecEvent::Stderr("Traceback: boom".to_string()),
				ExecEvent::Completed,
			]
		);
	}

	#[test]
	fn test_empty_streams() {
		let mut exec = RawExec::new();
		exec.begin();
		// No stdout, no stderr: the two end bytes arrive back to back
		let events = exec.feed("OK\u{4}\u{4}>");
		assert_eq!(events, vec![ExecEvent::Completed]);
	}

	#[test]
	fn test_idle_text_passthrough() {
		let mut exec = RawExec::new();
		let events = exec.feed("MicroPython v1.22 on 2024-01-05\r\n");
		assert_eq!(
			events,
			vec![ExecEvent::IdleText("MicroPython v1.22 on 2024-01-05\r\n".to_string())]
		);
	}

	#[test]
	fn test_prompt_after_completion_not_forwarded() {
		let mut exec = RawExec::new();
		exec.begin();
		let events = exec.feed("OKx\u{4}\u{4}");
		assert_eq!(events, vec![ExecEvent::Stdout("x".to_string()), ExecEvent::Completed]);
		// The raw prompt arrives in the next frame and is swallowed
		let events = exec.feed(">");
		assert!(events.is_empty());
		// But anything after it is idle text again
		let events = exec.feed("noise");
		assert_eq!(events, vec![ExecEvent::IdleText("noise".to_string())]);
	}

	#[test]
	fn test_reset_recovers_from_lost_ack() {
		let mut exec = RawExec::new();
		exec.begin();
		exec.feed("garbage with no ack");
		assert_eq!(exec.state(), ExecState::AwaitingAck);
		exec.reset();
		assert_eq!(exec.state(), ExecState::Idle);
		let events = exec.feed("later");
		assert_eq!(events, vec![ExecEvent::IdleText("later".to_string())]);
	}
}

// vim: ts=4
