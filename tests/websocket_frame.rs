//! Protocol-conformance tests for the WebSocket frame parser: multi-frame
//! sequences and incremental buffering, which the inline unit tests in
//! `websocket::frame` don't exercise since they each hand the parser one
//! complete frame at a time.

use aerys::websocket::frame::{encode, is_echoable_close_code, parse, Opcode};
use bytes::BytesMut;

fn masked_frame(opcode: Opcode, fin: bool, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut masked_payload = payload.to_vec();
    for (i, byte) in masked_payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode_byte(opcode)];
    out.push(0x80 | payload.len() as u8);
    out.extend_from_slice(&mask);
    out.extend_from_slice(&masked_payload);
    out
}

fn opcode_byte(opcode: Opcode) -> u8 {
    match opcode {
        Opcode::Continuation => 0x0,
        Opcode::Text => 0x1,
        Opcode::Binary => 0x2,
        Opcode::Close => 0x8,
        Opcode::Ping => 0x9,
        Opcode::Pong => 0xa,
    }
}

/// A fragmented text message: `Text(fin=false)`, `Continuation(fin=false)`,
/// `Continuation(fin=true)`, reassembled the way `Rfc6455Gateway` would
/// drive this parser over a connection's read buffer.
#[test]
fn fragmented_text_message_reassembles_across_continuation_frames() {
    let mask = [5, 6, 7, 8];
    let mut wire = Vec::new();
    wire.extend(masked_frame(Opcode::Text, false, b"hello ", mask));
    wire.extend(masked_frame(Opcode::Continuation, false, b"frag", mask));
    wire.extend(masked_frame(Opcode::Continuation, true, b"mented", mask));

    let mut reassembled = Vec::new();
    let mut cursor = &wire[..];
    let mut frame_count = 0;
    let mut saw_final = false;
    loop {
        match parse(cursor, true).unwrap() {
            None => break,
            Some((frame, consumed)) => {
                frame_count += 1;
                if frame_count == 1 {
                    assert_eq!(frame.opcode, Opcode::Text);
                } else {
                    assert_eq!(frame.opcode, Opcode::Continuation);
                }
                reassembled.extend_from_slice(&frame.payload);
                saw_final = frame.fin;
                cursor = &cursor[consumed..];
                if cursor.is_empty() {
                    break;
                }
            }
        }
    }

    assert_eq!(frame_count, 3);
    assert!(saw_final, "last continuation frame should carry fin=true");
    assert_eq!(reassembled, b"hello fragmented");
}

/// Feeds the wire bytes of two back-to-back frames one byte at a time into
/// a growing buffer, confirming `parse` returns `Ok(None)` until enough
/// bytes have accumulated and then yields exactly the bytes it consumed —
/// the incremental-buffering contract a socket-driven reader depends on.
#[test]
fn incremental_buffering_yields_none_until_frame_is_complete() {
    let mask = [1, 1, 1, 1];
    let mut wire = Vec::new();
    wire.extend(masked_frame(Opcode::Binary, true, b"first", mask));
    wire.extend(masked_frame(Opcode::Text, true, b"second-frame", mask));

    let mut buf = BytesMut::new();
    let mut parsed = Vec::new();
    for &byte in &wire {
        buf.extend_from_slice(&[byte]);
        loop {
            match parse(&buf, true).unwrap() {
                None => break,
                Some((frame, consumed)) => {
                    parsed.push((frame.opcode, frame.payload.to_vec()));
                    let remaining = buf.split_off(consumed);
                    buf = remaining;
                }
            }
        }
    }

    assert!(buf.is_empty(), "both frames should be fully consumed");
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0], (Opcode::Binary, b"first".to_vec()));
    assert_eq!(parsed[1], (Opcode::Text, b"second-frame".to_vec()));
}

/// A close handshake: the server echoes an allowed close code back
/// verbatim, round-tripped through the unmasked server-frame encoder.
#[test]
fn close_handshake_round_trips_through_encode_and_parse() {
    let code: u16 = 1000;
    assert!(is_echoable_close_code(code));

    let mut payload = Vec::new();
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(b"normal closure");

    let wire = encode(Opcode::Close, true, &payload);
    let (frame, consumed) = parse(&wire, false).unwrap().unwrap();
    assert_eq!(consumed, wire.len());
    assert_eq!(frame.opcode, Opcode::Close);
    assert!(frame.fin);
    assert_eq!(&frame.payload[..2], &code.to_be_bytes());
    assert_eq!(&frame.payload[2..], b"normal closure");
}
