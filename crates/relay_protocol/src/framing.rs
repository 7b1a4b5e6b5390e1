#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Length prefix: u32 big-endian payload length.
const PREFIX_LEN: usize = 4;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("stream ended inside a frame ({buffered} bytes buffered)")]
	UnexpectedEof {
		buffered: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl FramingError {
	/// True when the peer sent bytes that can never form a valid frame.
	pub fn is_malformed(&self) -> bool {
		matches!(self, FramingError::FrameTooLarge { .. } | FramingError::Decode(_))
	}
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut out = BytesMut::new();
	encode_frame_into(&mut out, msg, max_frame_size)?;
	Ok(out.to_vec())
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	buf.reserve(PREFIX_LEN + payload_len);
	buf.put_u32(payload_len as u32);
	msg.encode(buf)?;
	Ok(())
}

fn payload_len(src: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
	if src.len() < PREFIX_LEN {
		return Ok(None);
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(Some(len))
}

/// Decode a single frame from the start of `src`, returning the bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(len) = payload_len(src, max_frame_size)? else {
		return Err(FramingError::InsufficientData {
			need: PREFIX_LEN,
			have: src.len(),
		});
	};

	let need = PREFIX_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer, consuming it on success.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	let Some(len) = payload_len(buf, max_frame_size)? else {
		return Ok(None);
	};

	if buf.len() < PREFIX_LEN + len {
		return Ok(None);
	}

	let frame = buf.split_to(PREFIX_LEN + len);
	let msg = M::decode(&frame[PREFIX_LEN..])?;
	Ok(Some(msg))
}

/// Buffered frame reader over any async byte stream.
///
/// `next` is cancel-safe: bytes already read stay buffered, so it can sit in a
/// `tokio::select!` next to a shutdown signal.
pub struct FrameReader<R> {
	inner: R,
	buf: BytesMut,
	max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
	pub fn new(inner: R, max_frame_size: usize) -> Self {
		Self {
			inner,
			buf: BytesMut::with_capacity(READ_CHUNK),
			max_frame_size,
		}
	}

	/// Next decoded frame, or `None` on a clean end-of-stream between frames.
	pub async fn next<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		loop {
			if let Some(msg) = try_decode_frame_from_buffer(&mut self.buf, self.max_frame_size)? {
				return Ok(Some(msg));
			}

			self.buf.reserve(READ_CHUNK);
			let n = self.inner.read_buf(&mut self.buf).await?;
			if n == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(FramingError::UnexpectedEof {
					buffered: self.buf.len(),
				});
			}
		}
	}
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W, M>(writer: &mut W, msg: &M, max_frame_size: usize) -> Result<(), FramingError>
where
	W: AsyncWrite + Unpin,
	M: Message,
{
	let frame = encode_frame(msg, max_frame_size)?;
	writer.write_all(&frame).await?;
	writer.flush().await?;
	Ok(())
}
