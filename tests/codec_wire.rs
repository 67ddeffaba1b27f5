//! Wire-level tests for the STOMP codec: escaping by protocol version,
//! binary bodies, heartbeats and decoding from arbitrarily split input.

use bytes::BytesMut;
use osmium_stomp::codec::{StompCodec, StompItem};
use osmium_stomp::parser::parse_frame_slice;
use osmium_stomp::{Frame, negotiate_heartbeats, parse_heartbeat_header};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

fn encode(codec: &mut StompCodec, frame: Frame) -> io::Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    codec.encode(StompItem::Frame(frame), &mut buf)?;
    Ok(buf.to_vec())
}

fn decode_one(codec: &mut StompCodec, raw: &[u8]) -> Frame {
    let mut buf = BytesMut::from(raw);
    match codec.decode(&mut buf).unwrap() {
        Some(StompItem::Frame(f)) => f,
        other => panic!("expected frame, got {:?}", other),
    }
}

// ============================================================================
// Escaping
// ============================================================================

#[test]
fn escaping_follows_the_shared_flag() {
    let flag = Arc::new(AtomicBool::new(false));
    let mut codec = StompCodec::with_encoding_flag(flag.clone());

    // 1.0: sent verbatim, backslashes included
    let raw = encode(&mut codec, Frame::new("SEND").header("path", "C:\\tmp")).unwrap();
    assert_eq!(raw, b"SEND\npath:C:\\tmp\n\n\0");

    // 1.1 negotiated
    flag.store(true, Ordering::Release);
    let raw = encode(&mut codec, Frame::new("SEND").header("path", "C:\\tmp")).unwrap();
    assert_eq!(raw, b"SEND\npath:C\\c\\\\tmp\n\n\0");
}

#[test]
fn unescaped_decode_keeps_backslashes() {
    let mut codec = StompCodec::with_encoding_flag(Arc::new(AtomicBool::new(false)));
    let frame = decode_one(&mut codec, b"MESSAGE\nwindows:a\\nb\n\n\0");
    assert_eq!(frame.get_header("windows"), Some("a\\nb"));

    let mut codec = StompCodec::new();
    let frame = decode_one(&mut codec, b"MESSAGE\nwindows:a\\nb\n\n\0");
    assert_eq!(frame.get_header("windows"), Some("a\nb"));
}

#[test]
fn headers_needing_escapes_are_rejected_without_escaping() {
    let mut codec = StompCodec::with_encoding_flag(Arc::new(AtomicBool::new(false)));

    let err = encode(&mut codec, Frame::new("SEND").header("a:b", "v")).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    let err = encode(&mut codec, Frame::new("SEND").header("k", "two\nlines")).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    // a colon in a value is fine
    encode(&mut codec, Frame::new("SEND").header("url", "tcp://h:61613")).unwrap();
}

#[test]
fn invalid_escape_is_a_decode_error() {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(&b"MESSAGE\nheader:bad\\xescape\n\n\0"[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

// ============================================================================
// Bodies
// ============================================================================

#[test]
fn binary_body_gets_content_length() {
    let mut codec = StompCodec::new();
    let body = vec![0u8, 1, 2, 0, 0xff];
    let raw = encode(&mut codec, Frame::new("SEND").set_body(body.clone())).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("content-length:5\n"), "{text}");

    let frame = decode_one(&mut codec, &raw);
    assert_eq!(frame.body, body);
}

#[test]
fn text_body_has_no_content_length() {
    let mut codec = StompCodec::new();
    let raw = encode(&mut codec, Frame::new("SEND").set_body(b"plain".to_vec())).unwrap();
    assert_eq!(raw, b"SEND\n\nplain\0");
}

#[test]
fn invalid_content_length_is_rejected() {
    let raw = b"SEND\ncontent-length:xyz\n\nhello\0".to_vec();
    assert!(parse_frame_slice(&raw).is_err());
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn lf_and_crlf_are_heartbeats() {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(&b"\n\r\nCONNECTED\nversion:1.1\n\n\0"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(StompItem::Heartbeat));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(StompItem::Heartbeat));
    match codec.decode(&mut buf).unwrap() {
        Some(StompItem::Frame(f)) => assert_eq!(f.get_header("version"), Some("1.1")),
        other => panic!("expected frame, got {:?}", other),
    }
    assert!(buf.is_empty());

    let mut out = BytesMut::new();
    codec.encode(StompItem::Heartbeat, &mut out).unwrap();
    assert_eq!(&out[..], b"\n");
}

#[test]
fn partial_frame_waits_for_more_bytes() {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(&b"MESSAGE\ndestination:/queue/a\n\nhal"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    buf.extend_from_slice(b"f\0");
    let frame = match codec.decode(&mut buf).unwrap() {
        Some(StompItem::Frame(f)) => f,
        other => panic!("expected frame, got {:?}", other),
    };
    assert_eq!(frame.body, b"half");
}

#[test]
fn truncated_stream_is_an_eof_error() {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(&b"MESSAGE\nid:1\n"[..]);
    let err = codec.decode_eof(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn absurd_content_length_is_invalid_data() {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:18446744073709551615\n\nabc\0"[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn frames_over_the_size_limit_are_rejected() {
    let mut codec = StompCodec::new().with_max_frame_size(64);
    assert_eq!(codec.max_frame_size(), 64);

    // the declared length alone is enough to refuse the frame
    let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:1000\n\n"[..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    // without content-length the buffered bytes count
    let mut codec = StompCodec::new().with_max_frame_size(64);
    let mut buf = BytesMut::from(&b"MESSAGE\n\n"[..]);
    buf.extend_from_slice(&[b'x'; 100]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    let small = decode_one(&mut codec, b"MESSAGE\ncontent-length:2\n\nok\0");
    assert_eq!(small.body, b"ok");
}

/// Feed a stream of frames and heartbeats in random slices and make sure
/// exactly the same items come out.
#[test]
fn decoding_is_independent_of_how_input_is_split() {
    let mut codec = StompCodec::new();
    let mut expected = Vec::new();
    let mut wire = BytesMut::new();
    for i in 0..50 {
        let frame = Frame::new("MESSAGE")
            .header("message-id", format!("m-{i}"))
            .header("note", "colon:and\\backslash")
            .set_body(if i % 3 == 0 {
                vec![0u8, i as u8, 0]
            } else {
                format!("body {i}").into_bytes()
            });
        codec
            .encode(StompItem::Frame(frame.clone()), &mut wire)
            .unwrap();
        expected.push(StompItem::Frame(frame));
        if i % 7 == 0 {
            codec.encode(StompItem::Heartbeat, &mut wire).unwrap();
            expected.push(StompItem::Heartbeat);
        }
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut input = BytesMut::new();
    let mut decoded = Vec::new();
    let mut offset = 0;
    while offset < wire.len() {
        let take = rng.gen_range(1..=32).min(wire.len() - offset);
        input.extend_from_slice(&wire[offset..offset + take]);
        offset += take;
        while let Some(item) = codec.decode(&mut input).unwrap() {
            decoded.push(normalise(item));
        }
    }
    let expected: Vec<_> = expected.into_iter().map(normalise).collect();
    assert_eq!(decoded, expected);
    assert!(input.is_empty());
}

/// The encoder adds content-length to binary bodies; drop it for comparison.
fn normalise(item: StompItem) -> StompItem {
    match item {
        StompItem::Frame(mut f) => {
            f.remove_header("content-length");
            StompItem::Frame(f)
        }
        hb => hb,
    }
}

// ============================================================================
// Heartbeat negotiation
// ============================================================================

#[test]
fn heartbeat_header_parsing_is_lenient() {
    assert_eq!(parse_heartbeat_header("10000,5000"), (10000, 5000));
    assert_eq!(parse_heartbeat_header(" 100 , 200 "), (100, 200));
    assert_eq!(parse_heartbeat_header("abc,300"), (0, 300));
    assert_eq!(parse_heartbeat_header("700"), (700, 0));
    assert_eq!(parse_heartbeat_header(""), (0, 0));
}

#[test]
fn heartbeats_need_both_sides_and_use_the_larger_interval() {
    assert_eq!(negotiate_heartbeats(0, 0, 1000, 1000), (None, None));
    assert_eq!(negotiate_heartbeats(1000, 0, 0, 1000), (Some(Duration::from_millis(1000)), None));
    assert_eq!(
        negotiate_heartbeats(500, 2000, 4000, 1500),
        (
            Some(Duration::from_millis(1500)),
            Some(Duration::from_millis(4000))
        )
    );
}
