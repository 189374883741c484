//! Discrimination totality: every frame routes to exactly one handler and
//! the classifier ranges never overlap.

use replink::protocol::channel;
use replink::protocol::discriminate::{classify, FrameKind};
use replink::transport::Frame;

#[test]
fn test_every_leading_byte_classifies_exactly_once() {
	for lead in 0u8..=255 {
		let frame = Frame::Binary(vec![lead, 0x42, 0x00, 0x00]);
		let kind = classify(&frame);

		let is_legacy = matches!(kind, FrameKind::LegacyFile(_));
		let is_channel = matches!(kind, FrameKind::Channel(_));
		let is_unroutable = matches!(kind, FrameKind::Unroutable);
		assert_eq!(
			is_legacy as u8 + is_channel as u8 + is_unroutable as u8,
			1,
			"lead byte {:#x} classified ambiguously",
			lead
		);

		match lead {
			0x57 => assert!(is_legacy, "{:#x}", lead),
			0x90..=0x9f | 0xdc | 0xdd => assert!(is_channel, "{:#x}", lead),
			_ => assert!(is_unroutable, "{:#x}", lead),
		}
	}
}

#[test]
fn test_legacy_magic_needs_both_bytes() {
	// 'W' followed by anything but the response marker is not legacy traffic
	let frame = Frame::Binary(vec![0x57, 0x00, 0x00, 0x00]);
	assert!(matches!(classify(&frame), FrameKind::Unroutable));
}

#[test]
fn test_real_envelopes_route_to_channel() {
	for envelope in [
		channel::read_request("/main.py"),
		channel::ack_block(3),
		channel::rename_request("/a", "/b"),
	] {
		let frame = Frame::Binary(envelope.encode());
		assert!(matches!(classify(&frame), FrameKind::Channel(_)));
	}
}

#[test]
fn test_text_never_routes_to_binary_handlers() {
	for text in ["hello", "{\"CMD\":\"STAT\"}", "Content-Length: 2\r\n\r\n{}"] {
		let frame = Frame::Text(text.to_string());
		match classify(&frame) {
			FrameKind::DebugEnvelope(_) | FrameKind::Interactive(_) => {}
			other => panic!("text routed to {:?}", other),
		}
	}
}

// vim: ts=4
