// Slice-based STOMP frame parser (produces owned Vecs from input slices)
use tracing::warn;

/// A frame parsed from a byte slice, still in raw (escaped) byte form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Number of input bytes the frame occupied, including the NUL terminator
    /// and an optional trailing LF.
    pub consumed: usize,
}

type ParseResult = Result<Option<RawFrame>, String>;

/// Extract the `content-length` header value from a raw header list.
///
/// Returns:
/// - Ok(Some(n)) when a valid content-length header is present and parsed.
/// - Ok(None) when no content-length header is present.
/// - Err(String) when content-length is present but not a valid unsigned integer.
fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    for (k, v) in headers {
        if k.eq_ignore_ascii_case(&b"content-length"[..]) {
            let s =
                std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err("empty content-length".to_string());
            }
            return trimmed
                .parse::<usize>()
                .map(Some)
                .map_err(|e| format!("invalid content-length '{}': {}", trimmed, e));
        }
    }
    Ok(None)
}

/// Reverse STOMP header escaping.
///
/// `\n`, `\c` and `\\` are the 1.1 sequences; `\r` is accepted as well so
/// frames from 1.2 brokers decode. Any other sequence is a protocol error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    if !input.contains(&b'\\') {
        return Ok(input.to_vec());
    }
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(b'\\') => out.push(b'\\'),
            Some(&other) => {
                return Err(format!("invalid escape sequence '\\{}'", other as char));
            }
            None => return Err("dangling escape at end of header".to_string()),
        }
    }
    Ok(out)
}

/// Escape a header name or value for a protocol version that supports
/// escaping (1.1 and later).
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Parse a single STOMP frame from a raw byte slice.
///
/// Returns Ok(Some(frame)) when a full frame was parsed, Ok(None) when more
/// bytes are required and Err on protocol errors. Header lines without a
/// colon are logged and skipped. An EOL after the terminating NUL is left in
/// the input, where the codec reads it as a heartbeat.
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    parse_frame_slice_limited(input, usize::MAX)
}

/// Like [`parse_frame_slice`], but a `content-length` that would make the
/// frame longer than `max_frame_size` bytes is an error instead of a request
/// for more input.
pub fn parse_frame_slice_limited(input: &[u8], max_frame_size: usize) -> ParseResult {
    let mut pos = 0usize;
    let len = input.len();

    // skip any leading LF heartbeats
    while pos < len && input[pos] == b'\n' {
        pos += 1;
    }

    // parse command line: find next LF; if no LF, fall back to NUL-only frame
    let command = match input[pos..].iter().position(|&b| b == b'\n') {
        Some(cmd_end_rel) => {
            let command = strip_cr(&input[pos..pos + cmd_end_rel]).to_vec();
            pos += cmd_end_rel + 1;
            command
        }
        None => {
            // No newline found: a NUL in the remaining bytes means a bare
            // NUL-terminated body with empty command/headers.
            if let Some(nul_rel) = input[pos..].iter().position(|&b| b == 0) {
                let body = input[pos..pos + nul_rel].to_vec();
                pos += nul_rel + 1;
                return Ok(Some(RawFrame {
                    command: Vec::new(),
                    headers: Vec::new(),
                    body,
                    consumed: pos,
                }));
            }
            return Ok(None);
        }
    };

    // parse headers until an empty line (LF) is found
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos >= len {
            return Ok(None);
        }
        if input[pos] == b'\n' {
            pos += 1;
            break;
        }
        if input[pos] == b'\r' && pos + 1 < len && input[pos + 1] == b'\n' {
            pos += 2;
            break;
        }
        let line_end_rel = match input[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => i,
            None => return Ok(None),
        };
        let line = strip_cr(&input[pos..pos + line_end_rel]);
        match line.iter().position(|&b| b == b':') {
            Some(colon) => headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec())),
            None => warn!(
                line = %String::from_utf8_lossy(line),
                "skipping malformed header line without ':'"
            ),
        }
        pos += line_end_rel + 1;
    }

    match get_content_length(&headers)? {
        Some(content_len) => {
            // need content_len bytes, plus terminating NUL
            let end = pos
                .checked_add(content_len)
                .and_then(|n| n.checked_add(1))
                .ok_or_else(|| format!("content-length {} overflows the frame", content_len))?;
            if end > max_frame_size {
                return Err(format!(
                    "content-length {} exceeds the maximum frame size of {} bytes",
                    content_len, max_frame_size
                ));
            }
            if end > len {
                return Ok(None);
            }
            let body = input[pos..pos + content_len].to_vec();
            pos += content_len;
            if input[pos] != 0 {
                return Err("missing NUL terminator after content-length body".to_string());
            }
            pos += 1;
            Ok(Some(RawFrame {
                command,
                headers,
                body,
                consumed: pos,
            }))
        }
        None => match input[pos..].iter().position(|&b| b == 0) {
            Some(nul_rel) => {
                let body = input[pos..pos + nul_rel].to_vec();
                pos += nul_rel + 1;
                Ok(Some(RawFrame {
                    command,
                    headers,
                    body,
                    consumed: pos,
                }))
            }
            None => Ok(None),
        },
    }
}
