use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;
use crate::parser::{escape_header_value, parse_frame_slice_limited, unescape_header_value};

/// Largest frame the decoder accepts by default (100 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single LF received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Responsibilities:
/// - Decode incoming bytes into `StompItem::Frame` or `StompItem::Heartbeat`.
/// - Support both NUL-terminated frames and frames using the `content-length`
///   header for binary bodies containing NUL bytes.
/// - Escape/unescape header names and values, but only while the shared
///   encoding flag is set. The flag starts cleared for a client connection and
///   is switched on by the wire format once the broker answers with a protocol
///   version above 1.0.
///
/// Without escaping a header containing LF cannot be represented, and neither
/// can a header name containing `:`. Such frames are rejected with
/// `InvalidInput` rather than written in a form that decodes differently.
///
/// Incoming frames larger than the configured maximum fail with
/// `InvalidData` as soon as their size is known, before the body is buffered.
#[derive(Debug, Clone)]
pub struct StompCodec {
    encoding: Arc<AtomicBool>,
    max_frame_size: usize,
}

impl StompCodec {
    /// A codec with escaping permanently enabled (protocol 1.1 behaviour).
    pub fn new() -> Self {
        Self::with_encoding_flag(Arc::new(AtomicBool::new(true)))
    }

    /// A codec whose escaping is driven by a flag shared with the wire format.
    pub fn with_encoding_flag(encoding: Arc<AtomicBool>) -> Self {
        Self {
            encoding,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether header escaping is currently applied.
    pub fn encoding_enabled(&self) -> bool {
        self.encoding.load(Ordering::Acquire)
    }

    fn decode_text(bytes: Vec<u8>, what: &str, unescape: bool) -> io::Result<String> {
        let bytes = if unescape {
            unescape_header_value(&bytes).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid escape in {}: {}", what, e),
                )
            })?
        } else {
            bytes
        };
        String::from_utf8(bytes).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid utf8 in {}: {}", what, e),
            )
        })
    }

    fn check_unescaped(key: &str, value: &str) -> io::Result<()> {
        if key.contains('\n') || key.contains(':') || value.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "header '{}' cannot be written without escaping (protocol 1.0)",
                    key.escape_debug()
                ),
            ));
        }
        Ok(())
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns
    /// - `Ok(Some(StompItem))` when a full item (frame or heartbeat) was
    ///   decoded and bytes were consumed from `src` accordingly.
    /// - `Ok(None)` when more bytes are required to decode a complete item.
    /// - `Err(io::Error)` on protocol or data errors (invalid UTF-8, malformed
    ///   escapes, missing NUL after a content-length body, oversized frames).
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // keepalive: a single LF where a command line would start
        if let Some(&b'\n') = src.chunk().first() {
            src.advance(1);
            return Ok(Some(StompItem::Heartbeat));
        }
        if src.len() >= 2 && src[0] == b'\r' && src[1] == b'\n' {
            src.advance(2);
            return Ok(Some(StompItem::Heartbeat));
        }

        let raw = match parse_frame_slice_limited(src.chunk(), self.max_frame_size) {
            Ok(Some(raw)) => raw,
            Ok(None) if src.len() > self.max_frame_size => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "frame exceeds the maximum size of {} bytes",
                        self.max_frame_size
                    ),
                ));
            }
            Ok(None) => return Ok(None),
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("parse error: {}", e),
                ));
            }
        };
        src.advance(raw.consumed);

        let unescape = self.encoding_enabled();
        let command = Self::decode_text(raw.command, "command", false)?;
        let mut headers = Vec::with_capacity(raw.headers.len());
        for (k, v) in raw.headers {
            let key = Self::decode_text(k, "header key", unescape)?;
            let value = Self::decode_text(v, "header value", unescape)?;
            headers.push((key, value));
        }

        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body: raw.body,
        })))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if buf.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed with {} bytes of a partial frame", buf.len()),
            )),
        }
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    /// Encode a `StompItem` into the provided destination buffer.
    ///
    /// Output is `COMMAND\n` + `key:value\n` per header + `\n` + body + NUL.
    /// A `content-length` header is appended when the body could not be
    /// recovered by scanning for NUL (it contains NUL or is not UTF-8).
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        let escape = self.encoding_enabled();
        let mut headers = frame.headers;
        let has_cl = headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        if !has_cl && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err()) {
            headers.push(("content-length".to_string(), frame.body.len().to_string()));
        }

        if !escape {
            for (k, v) in &headers {
                Self::check_unescaped(k, v)?;
            }
        }

        dst.reserve(frame.command.len() + frame.body.len() + 16 * headers.len() + 3);
        dst.extend_from_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');
        for (k, v) in headers {
            if escape {
                dst.extend_from_slice(escape_header_value(&k).as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(escape_header_value(&v).as_bytes());
            } else {
                dst.extend_from_slice(k.as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(v.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.extend_from_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
