//! HTTP/2 frame format (RFC 7540 §4, §6): DATA, HEADERS, PRIORITY,
//! RST_STREAM, SETTINGS, PUSH_PROMISE, PING, GOAWAY, WINDOW_UPDATE,
//! CONTINUATION.

use crate::errors::{Http2ErrorCode, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 9;
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const DEFAULT_INITIAL_WINDOW: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            _ => return None,
        })
    }
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.header.flags & flag != 0
    }

    /// Parses one frame's 9-byte header plus payload from `buf`, returning
    /// `None` if not enough bytes are buffered yet.
    pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let frame_type = FrameType::from_u8(buf[3]).ok_or(ProtocolError::Http2(Http2ErrorCode::ProtocolError))?;
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;

        let total = FRAME_HEADER_LEN + length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..total]);
        Ok(Some((
            Frame {
                header: FrameHeader {
                    length,
                    frame_type,
                    flags,
                    stream_id,
                },
                payload,
            },
            total,
        )))
    }

    pub fn encode(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        let len = payload.len() as u32;
        out.put_u8((len >> 16) as u8);
        out.put_u8((len >> 8) as u8);
        out.put_u8(len as u8);
        out.put_u8(frame_type as u8);
        out.put_u8(flags);
        out.put_u32(stream_id & 0x7fff_ffff);
        out.put_slice(payload);
        out.freeze()
    }
}

/// SETTINGS identifiers this driver understands (RFC 7540 §6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>, ProtocolError> {
    if payload.len() % 6 != 0 {
        return Err(ProtocolError::Http2(Http2ErrorCode::FrameSizeError));
    }
    let mut out = Vec::with_capacity(payload.len() / 6);
    let mut cursor = payload;
    while cursor.has_remaining() {
        let id = cursor.get_u16();
        let value = cursor.get_u32();
        out.push((id, value));
    }
    Ok(out)
}

pub fn encode_settings(entries: &[(u16, u32)]) -> Bytes {
    let mut out = BytesMut::with_capacity(entries.len() * 6);
    for (id, value) in entries {
        out.put_u16(*id);
        out.put_u32(*value);
    }
    out.freeze()
}

pub fn parse_window_update(payload: &[u8]) -> Result<u32, ProtocolError> {
    if payload.len() != 4 {
        return Err(ProtocolError::Http2(Http2ErrorCode::FrameSizeError));
    }
    Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff)
}

pub fn encode_window_update(increment: u32) -> Bytes {
    Bytes::copy_from_slice(&(increment & 0x7fff_ffff).to_be_bytes())
}

pub fn parse_rst_stream(payload: &[u8]) -> Result<Http2ErrorCode, ProtocolError> {
    if payload.len() != 4 {
        return Err(ProtocolError::Http2(Http2ErrorCode::FrameSizeError));
    }
    Ok(error_code_from_u32(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ])))
}

fn error_code_from_u32(code: u32) -> Http2ErrorCode {
    match code {
        0x0 => Http2ErrorCode::NoError,
        0x1 => Http2ErrorCode::ProtocolError,
        0x2 => Http2ErrorCode::InternalError,
        0x3 => Http2ErrorCode::FlowControlError,
        0x4 => Http2ErrorCode::SettingsTimeout,
        0x5 => Http2ErrorCode::StreamClosed,
        0x6 => Http2ErrorCode::FrameSizeError,
        0x7 => Http2ErrorCode::RefusedStream,
        0x8 => Http2ErrorCode::Cancel,
        0x9 => Http2ErrorCode::CompressionError,
        0xa => Http2ErrorCode::ConnectError,
        0xb => Http2ErrorCode::EnhanceYourCalm,
        0xc => Http2ErrorCode::InadequateSecurity,
        _ => Http2ErrorCode::Http11Required,
    }
}

pub fn encode_rst_stream(code: Http2ErrorCode) -> Bytes {
    Bytes::copy_from_slice(&(code as u32).to_be_bytes())
}

pub fn encode_goaway(last_stream_id: u32, code: Http2ErrorCode) -> Bytes {
    let mut out = BytesMut::with_capacity(8);
    out.put_u32(last_stream_id & 0x7fff_ffff);
    out.put_u32(code as u32);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_preserves_type_flags_stream() {
        let encoded = Frame::encode(FrameType::Headers, flags::END_HEADERS, 1, b"payload");
        let (frame, consumed) = Frame::parse(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.header.frame_type, FrameType::Headers);
        assert!(frame.has_flag(flags::END_HEADERS));
        assert_eq!(frame.header.stream_id, 1);
        assert_eq!(&frame.payload[..], b"payload");
    }

    #[test]
    fn parse_returns_none_on_incomplete_buffer() {
        let encoded = Frame::encode(FrameType::Ping, 0, 0, b"12345678");
        assert!(Frame::parse(&encoded[..5]).unwrap().is_none());
    }

    #[test]
    fn settings_round_trip() {
        let entries = vec![(SettingId::InitialWindowSize as u16, 1_000_000)];
        let encoded = encode_settings(&entries);
        let decoded = parse_settings(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn window_update_masks_reserved_bit() {
        let encoded = encode_window_update(0x8000_0001);
        let decoded = parse_window_update(&encoded).unwrap();
        assert_eq!(decoded, 1);
    }
}
