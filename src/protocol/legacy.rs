//! Legacy binary file protocol
//!
//! Single request, single response, no chunking. Requests carry a two-byte
//! magic, an opcode, a length-prefixed path, and for PUT the whole payload.
//! Responses reuse the magic with a different second byte, a two-byte status,
//! and for successful GETs a length-prefixed payload the client validates
//! against the declared length.

use tokio::sync::oneshot;

use crate::error::DeviceError;

/// Request magic
pub const MAGIC_REQUEST: [u8; 2] = *b"WA";
/// Response magic; its first byte must stay outside the channelized
/// envelope's array-marker range (see the discriminator)
pub const MAGIC_RESPONSE: [u8; 2] = *b"WB";

/// Opcodes
pub const OP_PUT: u8 = 1;
pub const OP_GET: u8 = 2;

/// Success status
pub const STATUS_OK: u16 = 0;

/// Longest encodable path (one length byte)
pub const MAX_PATH: usize = 255;

fn encode_path(buf: &mut Vec<u8>, path: &str) -> Result<(), DeviceError> {
	let bytes = path.as_bytes();
	if bytes.is_empty() || bytes.len() > MAX_PATH {
		return Err(DeviceError::Protocol {
			message: format!("Path length {} out of range 1..={}", bytes.len(), MAX_PATH),
		});
	}
	buf.push(bytes.len() as u8);
	buf.extend_from_slice(bytes);
	Ok(())
}

/// Build a GET request frame
pub fn encode_get(path: &str) -> Result<Vec<u8>, DeviceError> {
	let mut buf = Vec::with_capacity(4 + path.len());
	buf.extend_from_slice(&MAGIC_REQUEST);
	buf.push(OP_GET);
	encode_path(&mut buf, path)?;
	Ok(buf)
}

/// Build a PUT request frame carrying the full payload
pub fn encode_put(path: &str, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
	let mut buf = Vec::with_capacity(8 + path.len() + data.len());
	buf.extend_from_slice(&MAGIC_REQUEST);
	buf.push(OP_PUT);
	encode_path(&mut buf, path)?;
	buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
	buf.extend_from_slice(data);
	Ok(buf)
}

/// A decoded response frame
#[derive(Debug, PartialEq, Eq)]
pub struct LegacyResponse {
	pub status: u16,
	pub payload: Option<Vec<u8>>,
}

/// Decode a response frame. The payload, when present, must match its
/// declared length exactly; a mismatch fails rather than truncates or pads.
pub fn decode_response(frame: &[u8]) -> Result<LegacyResponse, DeviceError> {
	if frame.len() < 4 || frame[..2] != MAGIC_RESPONSE {
		return Err(DeviceError::Protocol {
			message: format!("Malformed legacy response ({} bytes)", frame.len()),
		});
	}
	let status = u16::from_le_bytes([frame[2], frame[3]]);
	if frame.len() == 4 {
		return Ok(LegacyResponse { status, payload: None });
	}
	if frame.len() < 8 {
		return Err(DeviceError::Protocol {
			message: "Legacy response truncated before payload length".to_string(),
		});
	}
	let declared = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
	let payload = &frame[8..];
	if payload.len() != declared {
		return Err(DeviceError::Protocol {
			message: format!(
				"Legacy payload length mismatch: declared {}, got {}",
				declared,
				payload.len()
			),
		});
	}
	Ok(LegacyResponse { status, payload: Some(payload.to_vec()) })
}

/// The single-flight slot for the one legacy operation a connection may have
/// outstanding. Cleared on completion or timeout; a response arriving with
/// the slot empty is stale and dropped.
pub struct LegacySlot {
	pub opcode: u8,
	pub resolve: oneshot::Sender<Result<Option<Vec<u8>>, DeviceError>>,
}


// vim: ts=4
