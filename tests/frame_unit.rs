//! Unit tests for the Frame struct.

use osmium_stomp::Frame;

// =============================================================================
// Construction
// =============================================================================

#[test]
fn frame_new_creates_empty() {
    let frame = Frame::new("SEND");
    assert_eq!(frame.command, "SEND");
    assert!(frame.headers.is_empty());
    assert!(frame.body.is_empty());
}

#[test]
fn frame_header_preserves_order() {
    let frame = Frame::new("SEND")
        .header("z-header", "z")
        .header("a-header", "a")
        .header("m-header", "m");
    let keys: Vec<&str> = frame.headers.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["z-header", "a-header", "m-header"]);
}

#[test]
fn frame_header_opt_skips_none() {
    let frame = Frame::new("SUBSCRIBE")
        .header_opt("selector", None::<String>)
        .header_opt("id", Some("sub-1"));
    assert_eq!(frame.headers.len(), 1);
    assert_eq!(frame.get_header("id"), Some("sub-1"));
    assert!(!frame.has_header("selector"));
}

#[test]
fn frame_body_with_nul_bytes() {
    let frame = Frame::new("SEND").set_body(vec![0, 1, 2, 0, 3, 4, 0]);
    assert_eq!(frame.body.len(), 7);
    assert_eq!(frame.body_text(), Some("\0\u{1}\u{2}\0\u{3}\u{4}\0"));
}

#[test]
fn frame_body_text_rejects_invalid_utf8() {
    let frame = Frame::new("SEND").set_body(vec![0xff, 0xfe]);
    assert_eq!(frame.body_text(), None);
}

// =============================================================================
// Header lookup and editing
// =============================================================================

#[test]
fn frame_duplicate_headers_first_wins() {
    // STOMP allows duplicate headers; the first occurrence wins on read
    let frame = Frame::new("MESSAGE")
        .header("custom", "first")
        .header("custom", "second");
    assert_eq!(frame.headers.len(), 2);
    assert_eq!(frame.get_header("custom"), Some("first"));
}

#[test]
fn frame_header_lookup_is_case_sensitive() {
    let frame = Frame::new("MESSAGE").header("Destination", "/queue/a");
    assert_eq!(frame.get_header("destination"), None);
    assert_eq!(frame.get_header("Destination"), Some("/queue/a"));
}

#[test]
fn frame_remove_header_drops_every_copy() {
    let mut frame = Frame::new("MESSAGE")
        .header("subscription", "s-1")
        .header("message-id", "m-1")
        .header("subscription", "s-2");
    assert_eq!(frame.remove_header("subscription").as_deref(), Some("s-1"));
    assert!(!frame.has_header("subscription"));
    assert_eq!(frame.headers.len(), 1);
    assert_eq!(frame.remove_header("subscription"), None);
}

#[test]
fn frame_set_header_replaces_or_appends() {
    let mut frame = Frame::new("SEND").header("priority", "4");
    frame.set_header("priority", "9");
    frame.set_header("persistent", "true");
    assert_eq!(
        frame.headers,
        vec![
            ("priority".to_string(), "9".to_string()),
            ("persistent".to_string(), "true".to_string())
        ]
    );
}

#[test]
fn frame_header_special_characters() {
    let frame = Frame::new("SEND")
        .header("url", "http://example.com:8080/path?query=value&other=123");
    assert_eq!(
        frame.get_header("url"),
        Some("http://example.com:8080/path?query=value&other=123")
    );
}

// =============================================================================
// Display and equality
// =============================================================================

#[test]
fn frame_display_lists_command_headers_and_body_size() {
    let frame = Frame::new("SEND")
        .header("destination", "/queue/test")
        .header("content-type", "text/plain")
        .set_body(b"hello".to_vec());
    let display = format!("{}", frame);
    assert!(display.contains("Command: SEND"));
    assert!(display.contains("destination: /queue/test"));
    assert!(display.contains("content-type: text/plain"));
    assert!(display.contains("Body (5 bytes)"));
}

#[test]
fn frame_equality_covers_all_parts() {
    let base = Frame::new("SEND")
        .header("destination", "/queue/test")
        .set_body(b"hello".to_vec());
    assert_eq!(base, base.clone());
    assert_ne!(base, Frame::new("MESSAGE").header("destination", "/queue/test").set_body(b"hello".to_vec()));
    assert_ne!(base, base.clone().header("extra", "value"));
    assert_ne!(base, base.clone().set_body(b"world".to_vec()));
}
