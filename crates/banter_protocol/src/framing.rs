#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Maximum frame payload size for v1. Chat payloads are small; anything
/// near this limit is a protocol violation, not a large message.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData { need: usize, have: usize },

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a message into a `u32`-big-endian length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(4 + payload_len);
	out.put_u32(payload_len as u32);
	msg.encode(&mut out)?;
	Ok(out)
}

/// Decode one frame from the start of `src`, returning the message and the
/// number of bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(prefix) = src.get(..4) else {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	};

	let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[4..need])?;
	Ok((msg, need))
}

/// Try to decode one frame from a growable receive buffer, consuming it on
/// success. Returns `Ok(None)` while the frame is still incomplete.
pub fn try_decode_frame<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = M::decode(&frame[4..])?;
	Ok(Some(msg))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pb;
	use crate::version::PROTOCOL_VERSION;

	fn hello_envelope(text: &str) -> pb::Envelope {
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: "r1".to_string(),
			msg: Some(pb::envelope::Msg::Hello(pb::Hello {
				client_name: text.to_string(),
				auth_token: String::new(),
				client_instance_id: "i1".to_string(),
			})),
		}
	}

	#[test]
	fn envelope_roundtrip() {
		let env = hello_envelope("banter-test");
		let frame = encode_frame(&env, MAX_FRAME_SIZE).expect("encode");
		let (decoded, used) = decode_frame::<pb::Envelope>(&frame, MAX_FRAME_SIZE).expect("decode");
		assert_eq!(used, frame.len());
		assert_eq!(decoded, env);
	}

	#[test]
	fn partial_frame_reports_insufficient_data() {
		let frame = encode_frame(&hello_envelope("x"), MAX_FRAME_SIZE).expect("encode");
		let err = decode_frame::<pb::Envelope>(&frame[..3], MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::InsufficientData { .. }));

		let err = decode_frame::<pb::Envelope>(&frame[..frame.len() - 1], MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::InsufficientData { .. }));
	}

	#[test]
	fn incremental_buffer_decode() {
		let frame = encode_frame(&hello_envelope("chunked"), MAX_FRAME_SIZE).expect("encode");
		let mut buf = BytesMut::new();

		buf.extend_from_slice(&frame[..5]);
		assert!(try_decode_frame::<pb::Envelope>(&mut buf, MAX_FRAME_SIZE).expect("ok").is_none());

		buf.extend_from_slice(&frame[5..]);
		let decoded = try_decode_frame::<pb::Envelope>(&mut buf, MAX_FRAME_SIZE)
			.expect("ok")
			.expect("complete frame");
		assert_eq!(decoded, hello_envelope("chunked"));
		assert!(buf.is_empty());
	}

	#[test]
	fn rejects_oversized_frames_both_ways() {
		let env = hello_envelope(&"a".repeat(4096));
		assert!(matches!(
			encode_frame(&env, 64).unwrap_err(),
			FramingError::FrameTooLarge { .. }
		));

		let mut buf = BytesMut::new();
		buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
		assert!(matches!(
			try_decode_frame::<pb::Envelope>(&mut buf, MAX_FRAME_SIZE).unwrap_err(),
			FramingError::FrameTooLarge { .. }
		));
	}
}
