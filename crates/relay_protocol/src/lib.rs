#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;
pub mod pb;

pub use convert::{ConvertError, message_from_wire};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FrameReader, FramingError, decode_frame, encode_frame, encode_frame_into,
	try_decode_frame_from_buffer, write_frame,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation carried in every envelope.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;

	/// ALPN for client connections.
	pub const CLIENT_ALPN: &[u8] = b"relay-v1";
	/// ALPN for hub ↔ backend service links.
	pub const PEER_ALPN: &[u8] = b"relay-peer-v1";
}

/// Wrap a message body in an envelope stamped with the current version.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: version::PROTOCOL_VERSION_U32,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}

/// Terminal error frame.
pub fn error_envelope(request_id: impl Into<String>, code: pb::StatusCode, message: impl Into<String>) -> pb::Envelope {
	envelope(
		request_id,
		pb::envelope::Msg::Error(pb::Error {
			code: code as i32,
			message: message.into(),
		}),
	)
}
