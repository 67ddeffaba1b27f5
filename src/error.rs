use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by connection, session, consumer and producer operations.
#[derive(Error, Debug)]
pub enum StompError {
    /// I/O-level error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Protocol violation: malformed frame or an unsolicited CONNECTED.
    /// Fatal for the transport it occurred on.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker answered a request with an ERROR frame.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The connection has been closed locally.
    #[error("connection closed")]
    ConnectionClosed,
    /// The transport failed; the connection can no longer be used.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// A synchronous request received no response in time.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
    /// The broker could not be reached before the connect deadline.
    #[error("connect timed out after {timeout:?}: {last_error}")]
    ConnectTimeout {
        timeout: Duration,
        last_error: String,
    },
    /// The caller used the API in a way the current state does not allow.
    #[error("usage error: {0}")]
    Usage(String),
    /// A message body or header could not be interpreted.
    #[error("message format error: {0}")]
    MessageFormat(String),
}

impl StompError {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        StompError::Usage(msg.into())
    }

    /// `true` for failures that say nothing about the broker's willingness to
    /// accept us (socket errors, timeouts) and are therefore worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StompError::Io(_) | StompError::RequestTimeout(_) | StompError::ConnectionFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StompError>;

/// One frame of a broker-side stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceElement {
    pub class_name: String,
    pub method_name: String,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
}

impl fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.class_name, self.method_name)?;
        match (&self.file_name, self.line_number) {
            (Some(file), Some(line)) => write!(f, "{}:{})", file, line),
            (Some(file), None) => write!(f, "{})", file),
            _ => write!(f, "Unknown Source)"),
        }
    }
}

/// Error reported by the broker in an ERROR frame.
///
/// The `message` header becomes [`BrokerError::message`]. When the body holds
/// a Java-style stack trace (ActiveMQ sends one) the exception class, frames
/// and `Caused by:` chain are recovered from it; otherwise the body is kept
/// verbatim in `details`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("broker error: {message}")]
pub struct BrokerError {
    pub message: String,
    pub exception_class: Option<String>,
    pub stack_trace: Vec<StackTraceElement>,
    pub cause: Option<Box<BrokerError>>,
    pub details: Option<String>,
}

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exception_class: None,
            stack_trace: Vec::new(),
            cause: None,
            details: None,
        }
    }

    /// Build an error from the `message` header and the frame body.
    pub fn from_parts(message: Option<String>, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let text = text.trim_end_matches('\0').trim();
        let mut error = match parse_stack_trace(text) {
            Some(parsed) => parsed,
            None => {
                let mut e = BrokerError::new(String::new());
                if !text.is_empty() {
                    e.details = Some(text.to_string());
                }
                e
            }
        };
        if let Some(m) = message.filter(|m| !m.is_empty()) {
            error.message = m;
        } else if error.message.is_empty() {
            error.message = error
                .details
                .as_deref()
                .and_then(|d| d.lines().next())
                .unwrap_or("unknown error")
                .to_string();
        }
        error
    }

    /// Iterate over this error and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &BrokerError> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }
}

fn parse_header_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    let (class, message) = match line.split_once(": ") {
        Some((c, m)) => (c, m),
        None => (line, ""),
    };
    let looks_like_class = !class.is_empty()
        && !class.contains(' ')
        && class.contains('.')
        && class
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '_' || c == '$');
    looks_like_class.then(|| (class.to_string(), message.to_string()))
}

fn parse_frame_line(line: &str) -> Option<StackTraceElement> {
    let rest = line.trim().strip_prefix("at ")?;
    let open = rest.find('(')?;
    let qualified = &rest[..open];
    let location = rest[open + 1..].trim_end_matches(')');
    let (class_name, method_name) = qualified.rsplit_once('.')?;
    let (file_name, line_number) = match location.split_once(':') {
        Some((file, line)) => (Some(file.to_string()), line.parse().ok()),
        None if location.is_empty() || location == "Unknown Source" => (None, None),
        None => (Some(location.to_string()), None),
    };
    Some(StackTraceElement {
        class_name: class_name.to_string(),
        method_name: method_name.to_string(),
        file_name,
        line_number,
    })
}

/// Parse `Class: message`, `\tat ...` frames and `Caused by:` sections.
fn parse_stack_trace(text: &str) -> Option<BrokerError> {
    let mut lines = text.lines();
    let (class, message) = parse_header_line(lines.next()?)?;
    let mut levels = vec![BrokerError {
        message,
        exception_class: Some(class),
        stack_trace: Vec::new(),
        cause: None,
        details: None,
    }];
    for line in lines {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Caused by: ") {
            if let Some((class, message)) = parse_header_line(rest) {
                levels.push(BrokerError {
                    message,
                    exception_class: Some(class),
                    stack_trace: Vec::new(),
                    cause: None,
                    details: None,
                });
            }
        } else if let Some(element) = parse_frame_line(trimmed) {
            if let Some(current) = levels.last_mut() {
                current.stack_trace.push(element);
            }
        }
    }
    // fold innermost cause upwards
    let mut cause: Option<Box<BrokerError>> = None;
    while let Some(mut level) = levels.pop() {
        level.cause = cause.take();
        cause = Some(Box::new(level));
    }
    cause.map(|b| *b)
}
