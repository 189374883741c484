//! Structured command frames on the interactive channel
//!
//! A structured frame is a JSON object `{"CMD": <tag>, "ARG": <payload>}`
//! riding on the otherwise free-text interactive channel. Broadcast tags are
//! reserved and never usable as request/response correlation keys, so a tag
//! always classifies one way.

use serde_json::Value;

/// Periodic device telemetry broadcast
pub const TAG_TELEMETRY: &str = "STAT";
/// Device-initiated request to display an external UI
pub const TAG_DISPLAY_UI: &str = "VIEW";

/// A decoded structured frame, keeping the raw text for silent-execution capture
#[derive(Debug, Clone)]
pub struct StructuredFrame {
	pub tag: String,
	pub arg: Value,
	pub raw: String,
}

/// Classification of a decoded frame
#[derive(Debug)]
pub enum Classified {
	Telemetry(Value),
	DisplayUi(Value),
	/// Correlates to a pending operation by command tag
	Response { tag: String, arg: Value },
}

/// Whether a tag belongs to the reserved broadcast namespace
pub fn is_broadcast_tag(tag: &str) -> bool {
	tag == TAG_TELEMETRY || tag == TAG_DISPLAY_UI
}

/// Try to decode a text chunk as a structured frame.
///
/// Only a chunk that begins with an open-brace and carries a string `CMD`
/// is a structured frame; everything else is program output. Device JSON is
/// parsed tolerantly, the way other inbound protocol text is.
pub fn parse(text: &str) -> Option<StructuredFrame> {
	let trimmed = text.trim();
	if !trimmed.starts_with('{') {
		return None;
	}
	let value: Value = json5::from_str(trimmed).ok()?;
	let tag = value.get("CMD")?.as_str()?.to_string();
	let arg = value.get("ARG").cloned().unwrap_or(Value::Null);
	Some(StructuredFrame { tag, arg, raw: trimmed.to_string() })
}

/// Classify a decoded frame as broadcast or response
pub fn classify(frame: &StructuredFrame) -> Classified {
	match frame.tag.as_str() {
		TAG_TELEMETRY => Classified::Telemetry(frame.arg.clone()),
		TAG_DISPLAY_UI => Classified::DisplayUi(frame.arg.clone()),
		_ => Classified::Response { tag: frame.tag.clone(), arg: frame.arg.clone() },
	}
}

/// Encode an outbound structured command
pub fn encode(tag: &str, arg: &Value) -> String {
	serde_json::json!({ "CMD": tag, "ARG": arg }).to_string()
}


// vim: ts=4
