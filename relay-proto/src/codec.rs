use crate::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// Message tags carried in the first two bytes of every frame.
pub const TAG_UNUSED: u16 = 0;
pub const TAG_CONNECT_SUCCESS_SID: u16 = 1;
pub const TAG_RECONNECT_SUCCESS_ACK: u16 = 2;
pub const TAG_DEPRECATED: u16 = 3;
pub const TAG_DATA: u16 = 4;
pub const TAG_ACK_LATENCY: u16 = 5;
pub const TAG_REPLY_LATENCY: u16 = 6;
pub const TAG_ACK: u16 = 7;

/// Maximum payload carried by a single DATA frame.
pub const MAX_DATA_PAYLOAD: usize = 16 * 1024;

/// Frame header overhead: 2-byte tag + 4-byte length prefix.
pub const FRAME_OVERHEAD: usize = 6;

/// Lower bound on caller-supplied read buffers: one maximal frame.
pub const MIN_READ_SIZE: usize = MAX_DATA_PAYLOAD + FRAME_OVERHEAD;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated message: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unsupported message tag: {0}")]
    UnsupportedTag(u16),

    #[error("declared length {declared} exceeds maximum {max}")]
    LengthOutOfRange { declared: usize, max: usize },
}

/// A decoded protocol frame. All multi-byte fields are big-endian on the
/// wire; length-prefixed fields carry a 4-byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session id assigned by the server for a brand-new session.
    ConnectSuccess { session_id: Bytes },
    /// Cumulative byte count the server had received when a session resumed.
    ReconnectSuccess { acked: u64 },
    /// Payload bytes of the relayed stream.
    Data { payload: Bytes },
    /// Cumulative byte count the server has received and forwarded.
    Ack { acked: u64 },
}

/// Encodes a DATA frame: `tag | len | payload`.
pub fn encode_data(payload: &[u8]) -> Result<Bytes, RelayError> {
    if payload.len() > MAX_DATA_PAYLOAD {
        return Err(RelayError::FrameTooLarge {
            max: MAX_DATA_PAYLOAD,
            got: payload.len(),
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_u16(TAG_DATA);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decodes the next frame from `src`, advancing it past the consumed bytes.
/// Messages arrive one per transport message, but concatenated frames decode
/// in sequence, which the round-trip tests rely on.
pub fn decode(src: &mut Bytes) -> Result<Frame, DecodeError> {
    if src.len() < 2 {
        return Err(DecodeError::Truncated {
            needed: 2,
            got: src.len(),
        });
    }

    let tag = src.get_u16();
    match tag {
        TAG_CONNECT_SUCCESS_SID => {
            let session_id = get_length_prefixed(src)?;
            Ok(Frame::ConnectSuccess { session_id })
        }
        TAG_RECONNECT_SUCCESS_ACK => Ok(Frame::ReconnectSuccess {
            acked: get_u64(src)?,
        }),
        TAG_DATA => {
            let payload = get_length_prefixed(src)?;
            Ok(Frame::Data { payload })
        }
        TAG_ACK => Ok(Frame::Ack {
            acked: get_u64(src)?,
        }),
        other => Err(DecodeError::UnsupportedTag(other)),
    }
}

fn get_u64(src: &mut Bytes) -> Result<u64, DecodeError> {
    if src.len() < 8 {
        return Err(DecodeError::Truncated {
            needed: 8,
            got: src.len(),
        });
    }
    Ok(src.get_u64())
}

fn get_length_prefixed(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    if src.len() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4,
            got: src.len(),
        });
    }
    let declared = src.get_u32() as usize;
    if declared > MAX_DATA_PAYLOAD {
        warn!(declared, max = MAX_DATA_PAYLOAD, "oversized field in frame");
        return Err(DecodeError::LengthOutOfRange {
            declared,
            max: MAX_DATA_PAYLOAD,
        });
    }
    if src.len() < declared {
        return Err(DecodeError::Truncated {
            needed: declared,
            got: src.len(),
        });
    }
    Ok(src.copy_to_bytes(declared))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tag: u16, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(tag);
        buf.put_slice(body);
        buf.freeze()
    }

    #[test]
    fn test_data_roundtrip() {
        let payload = b"relay payload";
        let mut encoded = encode_data(payload).unwrap();

        let frame = decode(&mut encoded).unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                payload: Bytes::from_static(b"relay payload")
            }
        );
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_empty_data_roundtrip() {
        let mut encoded = encode_data(&[]).unwrap();
        assert_eq!(encoded.len(), FRAME_OVERHEAD);

        let frame = decode(&mut encoded).unwrap();
        assert_eq!(frame, Frame::Data { payload: Bytes::new() });
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_DATA_PAYLOAD + 1];
        let err = encode_data(&payload).unwrap_err();
        assert!(matches!(err, RelayError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_concatenated_frames_decode_in_sequence() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode_data(b"one").unwrap());
        buf.put_slice(&raw(TAG_ACK, &8u64.to_be_bytes()));
        buf.put_slice(&encode_data(b"two").unwrap());
        let mut src = buf.freeze();

        assert_eq!(
            decode(&mut src).unwrap(),
            Frame::Data {
                payload: Bytes::from_static(b"one")
            }
        );
        assert_eq!(decode(&mut src).unwrap(), Frame::Ack { acked: 8 });
        assert_eq!(
            decode(&mut src).unwrap(),
            Frame::Data {
                payload: Bytes::from_static(b"two")
            }
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_connect_success_carries_session_id() {
        let mut body = vec![0, 0, 0, 4];
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let mut src = raw(TAG_CONNECT_SUCCESS_SID, &body);

        let frame = decode(&mut src).unwrap();
        assert_eq!(
            frame,
            Frame::ConnectSuccess {
                session_id: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])
            }
        );
    }

    #[test]
    fn test_reconnect_success_carries_acked_count() {
        let mut src = raw(TAG_RECONNECT_SUCCESS_ACK, &42u64.to_be_bytes());
        assert_eq!(decode(&mut src).unwrap(), Frame::ReconnectSuccess { acked: 42 });
    }

    #[test]
    fn test_single_byte_message_is_truncated() {
        let mut src = Bytes::from_static(&[0x00]);
        assert!(matches!(
            decode(&mut src).unwrap_err(),
            DecodeError::Truncated { .. }
        ));
    }

    #[test]
    fn test_truncated_fields_per_tag() {
        // Missing length prefix.
        let mut src = raw(TAG_CONNECT_SUCCESS_SID, &[0, 0]);
        assert!(matches!(
            decode(&mut src).unwrap_err(),
            DecodeError::Truncated { .. }
        ));

        // Declared length exceeds the remaining bytes.
        let mut src = raw(TAG_DATA, &[0, 0, 0, 9, 1, 2]);
        assert!(matches!(
            decode(&mut src).unwrap_err(),
            DecodeError::Truncated { .. }
        ));

        // Short ack counter.
        let mut src = raw(TAG_ACK, &[0, 0, 0, 0]);
        assert!(matches!(
            decode(&mut src).unwrap_err(),
            DecodeError::Truncated { .. }
        ));
    }

    #[test]
    fn test_reserved_and_unknown_tags_rejected() {
        for tag in [
            TAG_UNUSED,
            TAG_DEPRECATED,
            TAG_ACK_LATENCY,
            TAG_REPLY_LATENCY,
            TAG_ACK + 1,
            0xffff,
        ] {
            let mut src = raw(tag, &[]);
            match decode(&mut src).unwrap_err() {
                DecodeError::UnsupportedTag(t) => assert_eq!(t, tag),
                other => panic!("expected UnsupportedTag, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_oversized_declared_length_rejected() {
        let declared = (MAX_DATA_PAYLOAD as u32 + 1).to_be_bytes();
        let mut src = raw(TAG_DATA, &declared);
        assert!(matches!(
            decode(&mut src).unwrap_err(),
            DecodeError::LengthOutOfRange { .. }
        ));
    }
}
