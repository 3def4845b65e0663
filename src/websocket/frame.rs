//! RFC 6455 §5 frame format and the byte-accurate frame parser.
//!
//! Conceptually four stages — `AWAIT_HEADER → AWAIT_LENGTH_EXT → AWAIT_MASK
//! → AWAIT_PAYLOAD` — but, like the HTTP/2 frame parser in
//! `http2::frame`, realized as a single "try the whole frame against the
//! buffered bytes, return `None` if short" function rather than a
//! hand-threaded state enum: a WebSocket frame header is at most 14 bytes,
//! so there is no benefit to suspending mid-header.

use crate::errors::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAX_CONTROL_FRAME_LEN: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xa => Self::Pong,
            _ => return None,
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xa,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Parses one frame from `buf`, returning `None` if not enough bytes are
/// buffered yet. `require_mask` is `true` for frames read from a client
/// (RFC 6455 §5.1: "client must mask"); unmasked client frames are a
/// protocol error (close code 1002).
pub fn parse(buf: &[u8], require_mask: bool) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let byte0 = buf[0];
    let byte1 = buf[1];

    let fin = byte0 & 0x80 != 0;
    let rsv = byte0 & 0x70;
    if rsv != 0 {
        // No extension negotiated in this driver: RSV1-3 must be zero.
        return Err(ProtocolError::WebSocketClose(1002));
    }
    let opcode = Opcode::from_u8(byte0 & 0x0f).ok_or(ProtocolError::WebSocketClose(1002))?;

    let masked = byte1 & 0x80 != 0;
    if masked != require_mask {
        return Err(ProtocolError::WebSocketClose(1002));
    }

    let base_len = (byte1 & 0x7f) as u64;
    let mut cursor = &buf[2..];
    let (len, len_ext_bytes) = match base_len {
        126 => {
            if cursor.len() < 2 {
                return Ok(None);
            }
            (cursor.get_u16() as u64, 2)
        }
        127 => {
            if cursor.len() < 8 {
                return Ok(None);
            }
            (cursor.get_u64(), 8)
        }
        n => (n, 0),
    };

    if opcode.is_control() && (!fin || len > MAX_CONTROL_FRAME_LEN as u64) {
        return Err(ProtocolError::WebSocketClose(1002));
    }

    let header_len = 2 + len_ext_bytes + if masked { 4 } else { 0 };
    let total = header_len + len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[header_len..total].to_vec();
    if masked {
        let mask_offset = header_len - 4;
        let mask: [u8; 4] = buf[mask_offset..mask_offset + 4].try_into().unwrap();
        apply_mask(&mut payload, mask);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload: Bytes::from(payload),
        },
        total,
    )))
}

fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encodes an outbound frame. Server-to-client frames are never masked
/// (RFC 6455 §5.1).
pub fn encode(opcode: Opcode, fin: bool, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 10);
    let byte0 = (if fin { 0x80 } else { 0 }) | opcode.as_u8();
    out.put_u8(byte0);

    if payload.len() < 126 {
        out.put_u8(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.put_u8(126);
        out.put_u16(payload.len() as u16);
    } else {
        out.put_u8(127);
        out.put_u64(payload.len() as u64);
    }
    out.put_slice(payload);
    out.freeze()
}

/// Decodes a CLOSE frame payload into `(code, reason)` per RFC 6455 §5.5.1.
/// A frame with no payload closes with no code (the gateway substitutes
/// 1005 for local bookkeeping but never echoes it on the wire).
pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}

pub fn encode_close_payload(code: u16, reason: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + reason.len());
    out.put_u16(code);
    out.put_slice(reason.as_bytes());
    out.freeze()
}

/// True for close codes a peer is allowed to send on the wire (RFC 6455
/// §7.4.1); anything else triggers a 1002 reply instead of an echo.
pub fn is_echoable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_frame(opcode: Opcode, fin: bool, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut masked_payload = payload.to_vec();
        apply_mask(&mut masked_payload, mask);
        let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode.as_u8()];
        out.push(0x80 | payload.len() as u8);
        out.extend_from_slice(&mask);
        out.extend_from_slice(&masked_payload);
        out
    }

    #[test]
    fn parses_small_masked_text_frame() {
        let wire = masked_frame(Opcode::Text, true, b"hi", [1, 2, 3, 4]);
        let (frame, consumed) = parse(&wire, true).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.fin);
        assert_eq!(&frame.payload[..], b"hi");
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let wire = encode(Opcode::Text, true, b"hi");
        assert!(matches!(parse(&wire, true), Err(ProtocolError::WebSocketClose(1002))));
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        let wire = masked_frame(Opcode::Ping, false, b"x", [9, 9, 9, 9]);
        assert!(matches!(parse(&wire, true), Err(ProtocolError::WebSocketClose(1002))));
    }

    #[test]
    fn returns_none_on_incomplete_header() {
        assert!(parse(&[0x81], true).unwrap().is_none());
    }

    #[test]
    fn encode_parse_round_trip_unmasked_server_frame() {
        let wire = encode(Opcode::Binary, true, b"payload-bytes");
        let (frame, consumed) = parse(&wire, false).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(&frame.payload[..], b"payload-bytes");
    }

    #[test]
    fn close_payload_round_trips_code_and_reason() {
        let encoded = encode_close_payload(1000, "bye");
        let (code, reason) = parse_close_payload(&encoded);
        assert_eq!(code, Some(1000));
        assert_eq!(reason, "bye");
    }

    #[test]
    fn echoable_close_code_ranges() {
        assert!(is_echoable_close_code(1000));
        assert!(!is_echoable_close_code(1005));
        assert!(is_echoable_close_code(3000));
    }
}
