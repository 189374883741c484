//! Channelized envelope and chunked transfer
//!
//! The newer devices multiplex several logical channels over one binary frame
//! type: a MessagePack array `[channel, opcode, ...fields]`. Channel 0 carries
//! events/telemetry, 1 the interactive terminal, 2 remote procedure calls and
//! 23 file operations.
//!
//! File reads stream fixed-size blocks, each acknowledged by sequence number;
//! a short (or empty) block ends the transfer. Writes declare the total
//! length, send block 0 immediately and send each next block on the previous
//! acknowledgement. Directory operations are single request/response
//! exchanges over the same opcode space.

use rmpv::Value;

use crate::error::DeviceError;

/// Logical channels
pub const CH_EVENTS: u8 = 0;
pub const CH_TERMINAL: u8 = 1;
pub const CH_RPC: u8 = 2;
pub const CH_FILE: u8 = 23;

/// Channel-23 opcodes
pub const OP_READ: u8 = 1;
pub const OP_WRITE: u8 = 2;
pub const OP_DATA: u8 = 3;
pub const OP_ACK: u8 = 4;
pub const OP_ERROR: u8 = 5;
pub const OP_LIST: u8 = 6;
pub const OP_DELETE: u8 = 7;
pub const OP_RENAME: u8 = 8;
pub const OP_MKDIR: u8 = 9;
pub const OP_STAT: u8 = 10;

/// Channel-2 opcodes
pub const OP_RPC_REQUEST: u8 = 1;
pub const OP_RPC_RESPONSE: u8 = 2;

/// Channel-0 opcodes
pub const OP_EVENT_TELEMETRY: u8 = 1;

/// One decoded envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
	pub channel: u8,
	pub opcode: u8,
	pub fields: Vec<Value>,
}

impl Envelope {
	pub fn new(channel: u8, opcode: u8, fields: Vec<Value>) -> Self {
		Self { channel, opcode, fields }
	}

	/// Encode as a MessagePack array frame
	pub fn encode(&self) -> Vec<u8> {
		let mut items = Vec::with_capacity(2 + self.fields.len());
		items.push(Value::from(self.channel));
		items.push(Value::from(self.opcode));
		items.extend(self.fields.iter().cloned());
		let mut buf = Vec::new();
		// Writing into a Vec cannot fail
		rmpv::encode::write_value(&mut buf, &Value::Array(items))
			.expect("msgpack encode to Vec");
		buf
	}

	/// Decode a binary frame into an envelope
	pub fn decode(bytes: &[u8]) -> Result<Self, DeviceError> {
		let value = rmpv::decode::read_value(&mut &bytes[..])
			.map_err(|e| DeviceError::Protocol { message: format!("Bad envelope: {}", e) })?;
		let items = match value {
			Value::Array(items) => items,
			other => {
				return Err(DeviceError::Protocol {
					message: format!("Envelope is not an array: {:?}", other),
				});
			}
		};
		if items.len() < 2 {
			return Err(DeviceError::Protocol {
				message: format!("Envelope too short: {} elements", items.len()),
			});
		}
		let channel = field_u8(&items[0], "channel")?;
		let opcode = field_u8(&items[1], "opcode")?;
		Ok(Self { channel, opcode, fields: items[2..].to_vec() })
	}
}

fn field_u8(value: &Value, what: &str) -> Result<u8, DeviceError> {
	value
		.as_u64()
		.filter(|v| *v <= u8::MAX as u64)
		.map(|v| v as u8)
		.ok_or_else(|| DeviceError::Protocol { message: format!("Invalid {}: {:?}", what, value) })
}

// ===== Request builders =====

pub fn read_request(path: &str) -> Envelope {
	Envelope::new(CH_FILE, OP_READ, vec![Value::from(path)])
}

pub fn write_request(path: &str, total: u64) -> Envelope {
	Envelope::new(CH_FILE, OP_WRITE, vec![Value::from(path), Value::from(total)])
}

pub fn data_block(seq: u32, data: &[u8]) -> Envelope {
	Envelope::new(CH_FILE, OP_DATA, vec![Value::from(seq), Value::Binary(data.to_vec())])
}

pub fn ack_block(seq: u32) -> Envelope {
	Envelope::new(CH_FILE, OP_ACK, vec![Value::from(seq)])
}

pub fn list_request(path: &str) -> Envelope {
	Envelope::new(CH_FILE, OP_LIST, vec![Value::from(path)])
}

pub fn delete_request(path: &str) -> Envelope {
	Envelope::new(CH_FILE, OP_DELETE, vec![Value::from(path)])
}

pub fn rename_request(old: &str, new: &str) -> Envelope {
	Envelope::new(CH_FILE, OP_RENAME, vec![Value::from(old), Value::from(new)])
}

pub fn mkdir_request(path: &str) -> Envelope {
	Envelope::new(CH_FILE, OP_MKDIR, vec![Value::from(path)])
}

pub fn stat_request(path: &str) -> Envelope {
	Envelope::new(CH_FILE, OP_STAT, vec![Value::from(path)])
}

pub fn rpc_request(token: &str, method: &str, params: &serde_json::Value) -> Envelope {
	let params = rmpv::ext::to_value(params).unwrap_or(Value::Nil);
	Envelope::new(
		CH_RPC,
		OP_RPC_REQUEST,
		vec![Value::from(token), Value::from(method), params],
	)
}

// ===== Transfer state machine =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Read,
	Write,
}

/// What the session must do after feeding the transfer a frame
#[derive(Debug, PartialEq)]
pub enum TransferStep {
	/// Send this envelope
	Send(Envelope),
	/// Transfer finished; reads carry the assembled bytes
	Complete(Vec<u8>),
}

/// An in-progress chunked file operation. Created on request, mutated per
/// acknowledged block, destroyed on completion or error.
#[derive(Debug)]
pub struct Transfer {
	direction: Direction,
	block_size: usize,
	// read: accumulated blocks, in sequence order
	blocks: Vec<Vec<u8>>,
	// write: outbound payload and cursor
	data: Vec<u8>,
	offset: usize,
	last_sent: u32,
	next_seq: u32,
}

impl Transfer {
	pub fn read(block_size: usize) -> Self {
		Self {
			direction: Direction::Read,
			block_size,
			blocks: Vec::new(),
			data: Vec::new(),
			offset: 0,
			last_sent: 0,
			next_seq: 0,
		}
	}

	pub fn write(data: Vec<u8>, block_size: usize) -> Self {
		Self {
			direction: Direction::Write,
			block_size,
			blocks: Vec::new(),
			data,
			offset: 0,
			last_sent: 0,
			next_seq: 0,
		}
	}

	pub fn direction(&self) -> Direction {
		self.direction
	}

	/// Frames that open the transfer: the request itself, and for writes
	/// block 0 sent immediately after the declaration.
	pub fn open_frames(&mut self, path: &str) -> Vec<Envelope> {
		match self.direction {
			Direction::Read => vec![read_request(path)],
			Direction::Write => {
				let request = write_request(path, self.data.len() as u64);
				let block = self.take_block();
				vec![request, block]
			}
		}
	}

	fn take_block(&mut self) -> Envelope {
		let end = (self.offset + self.block_size).min(self.data.len());
		let block = data_block(self.next_seq, &self.data[self.offset..end]);
		self.offset = end;
		self.last_sent = self.next_seq;
		self.next_seq += 1;
		block
	}

	/// Feed an inbound data block (read direction)
	pub fn on_data(&mut self, seq: u64, data: &[u8]) -> Result<Vec<TransferStep>, DeviceError> {
		if self.direction != Direction::Read {
			return Err(DeviceError::Protocol {
				message: "Data block during write transfer".to_string(),
			});
		}
		if seq != self.next_seq as u64 {
			return Err(DeviceError::Protocol {
				message: format!("Out-of-order block {} (expected {})", seq, self.next_seq),
			});
		}
		if data.len() > self.block_size {
			return Err(DeviceError::Protocol {
				message: format!("Oversized block: {} > {}", data.len(), self.block_size),
			});
		}
		let last = data.len() < self.block_size;
		self.next_seq += 1;
		self.blocks.push(data.to_vec());

		let mut steps = vec![TransferStep::Send(ack_block(seq as u32))];
		if last {
			steps.push(TransferStep::Complete(self.blocks.concat()));
		}
		Ok(steps)
	}

	/// Feed an inbound acknowledgement (write direction)
	pub fn on_ack(&mut self, seq: u64) -> Result<TransferStep, DeviceError> {
		if self.direction != Direction::Write {
			return Err(DeviceError::Protocol {
				message: "Acknowledgement during read transfer".to_string(),
			});
		}
		if seq != self.last_sent as u64 {
			return Err(DeviceError::Protocol {
				message: format!("Acknowledgement for block {} (sent {})", seq, self.last_sent),
			});
		}
		if self.offset >= self.data.len() {
			Ok(TransferStep::Complete(Vec::new()))
		} else {
			Ok(TransferStep::Send(self.take_block()))
		}
	}
}

// ===== Directory/metadata payloads =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
	File,
	Dir,
}

impl EntryKind {
	fn parse(s: &str) -> Result<Self, DeviceError> {
		match s {
			"f" => Ok(EntryKind::File),
			"d" => Ok(EntryKind::Dir),
			other => {
				Err(DeviceError::Protocol { message: format!("Unknown entry kind: {}", other) })
			}
		}
	}
}

/// One directory-listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
	pub name: String,
	pub kind: EntryKind,
	pub size: u64,
}

/// Result of a stat operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
	pub kind: EntryKind,
	pub size: u64,
	pub mtime: Option<u64>,
}

/// Decode a list-directory response: one array of `[name, kind, size]` triples
pub fn decode_list(fields: &[Value]) -> Result<Vec<DirEntry>, DeviceError> {
	let rows = fields
		.first()
		.and_then(|v| v.as_array())
		.ok_or("Listing response missing entry array")?;
	let mut entries = Vec::with_capacity(rows.len());
	for row in rows {
		let row = row.as_array().ok_or("Listing entry is not an array")?;
		if row.len() < 3 {
			return Err(DeviceError::Protocol {
				message: format!("Listing entry has {} fields", row.len()),
			});
		}
		entries.push(DirEntry {
			name: row[0].as_str().ok_or("Listing entry name")?.to_string(),
			kind: EntryKind::parse(row[1].as_str().ok_or("Listing entry kind")?)?,
			size: row[2].as_u64().ok_or("Listing entry size")?,
		});
	}
	Ok(entries)
}

/// Decode a stat response: `[kind, size, mtime?]`
pub fn decode_stat(fields: &[Value]) -> Result<EntryStat, DeviceError> {
	if fields.len() < 2 {
		return Err(DeviceError::Protocol {
			message: format!("Stat response has {} fields", fields.len()),
		});
	}
	Ok(EntryStat {
		kind: EntryKind::parse(fields[0].as_str().ok_or("Stat kind")?)?,
		size: fields[1].as_u64().ok_or("Stat size")?,
		mtime: fields.get(2).and_then(|v| v.as_u64()),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_envelope_round_trip() {
		let env = read_request("/main.py");
		let decoded = Envelope::decode(&env.encode()).unwrap();
		assert_eq!(decoded.channel, CH_FILE);
		assert_eq!(decoded.opcode, OP_READ);
		assert_eq!(decoded.fields[0].as_str(), Some("/main.py"));
	}

	#[test]
	fn test_envelope_leading_byte_is_array_marker() {
		// Short envelopes use fixarray markers, the discriminator's range
		let bytes = ack_block(0).encode();
		assert!((0x90..=0x9f).contains(&bytes[0]));
	}

	#[test]
	fn test_decode_rejects_non_array() {
		let mut buf = Vec::new();
		rmpv::encode::write_value(&mut buf, &Value::from("text")).unwrap();
		assert!(Envelope::decode(&buf).is_err());
		assert!(Envelope::decode(&[]).is_err());
	}

	#[test]
	fn test_read_transfer_blocks() {
		let mut t = Transfer::read(4096);
		let steps = t.on_data(0, &[7u8; 4096]).unwrap();
		assert_eq!(steps, vec![TransferStep::Send(ack_block(0))]);

		let steps = t.on_data(1, &[8u8; 512]).unwrap();
		assert_eq!(steps.len(), 2);
		match &steps[1] {
			TransferStep::Complete(bytes) => {
				assert_eq!(bytes.len(), 4608);
				assert_eq!(bytes[4095], 7);
				assert_eq!(bytes[4096], 8);
			}
			other => panic!("Expected completion, got {:?}", other),
		}
	}

	#[test]
	fn test_read_zero_length_block_completes() {
		let mut t = Transfer::read(4096);
		t.on_data(0, &[1u8; 4096]).unwrap();
		let steps = t.on_data(1, &[]).unwrap();
		assert!(matches!(&steps[1], TransferStep::Complete(b) if b.len() == 4096));
	}

	#[test]
	fn test_read_rejects_reordering() {
		let mut t = Transfer::read(4096);
		assert!(t.on_data(1, &[0u8; 10]).is_err());
	}

	#[test]
	fn test_write_transfer_paces_on_acks() {
		let data = vec![5u8; 4096 + 100];
		let mut t = Transfer::write(data, 4096);
		let frames = t.open_frames("/f.bin");
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].opcode, OP_WRITE);
		assert_eq!(frames[0].fields[1].as_u64(), Some(4196));
		assert_eq!(frames[1].opcode, OP_DATA);
		assert_eq!(frames[1].fields[1].as_slice().unwrap().len(), 4096);

		match t.on_ack(0).unwrap() {
			TransferStep::Send(env) => {
				assert_eq!(env.fields[0].as_u64(), Some(1));
				assert_eq!(env.fields[1].as_slice().unwrap().len(), 100);
			}
			other => panic!("Expected next block, got {:?}", other),
		}
		assert_eq!(t.on_ack(1).unwrap(), TransferStep::Complete(Vec::new()));
	}

	#[test]
	fn test_write_empty_payload() {
		let mut t = Transfer::write(Vec::new(), 4096);
		let frames = t.open_frames("/empty");
		assert_eq!(frames[1].fields[1].as_slice().unwrap().len(), 0);
		assert_eq!(t.on_ack(0).unwrap(), TransferStep::Complete(Vec::new()));
	}

	#[test]
	fn test_write_exact_block_multiple() {
		let mut t = Transfer::write(vec![1u8; 8192], 4096);
		t.open_frames("/two");
		match t.on_ack(0).unwrap() {
			TransferStep::Send(env) => {
				assert_eq!(env.fields[1].as_slice().unwrap().len(), 4096);
			}
			other => panic!("Expected block 1, got {:?}", other),
		}
		assert_eq!(t.on_ack(1).unwrap(), TransferStep::Complete(Vec::new()));
	}

	#[test]
	fn test_write_rejects_wrong_ack() {
		let mut t = Transfer::write(vec![1u8; 10], 4096);
		t.open_frames("/f");
		assert!(t.on_ack(3).is_err());
	}

	#[test]
	fn test_decode_list_payload() {
		let rows = Value::Array(vec![
			Value::Array(vec![Value::from("main.py"), Value::from("f"), Value::from(120u64)]),
			Value::Array(vec![Value::from("lib"), Value::from("d"), Value::from(0u64)]),
		]);
		let entries = decode_list(&[rows]).unwrap();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].name, "main.py");
		assert_eq!(entries[0].kind, EntryKind::File);
		assert_eq!(entries[1].kind, EntryKind::Dir);
	}

	#[test]
	fn test_decode_stat_payload() {
		let stat = decode_stat(&[Value::from("f"), Value::from(99u64)]).unwrap();
		assert_eq!(stat.size, 99);
		assert_eq!(stat.mtime, None);
	}
}

// vim: ts=4
