//! # SSE Wire Framing
//!
//! Encoding and parsing of the `text/event-stream` frames the transport rides
//! on.
//!
//! ## Wire format
//!
//! An SSE response opens with a raw HTTP/1.1 preamble (status line, stream
//! headers, blank line) and then carries one frame per message:
//!
//! ```text
//! data: "payload"
//!
//! event: control
//! data: close
//!
//! ```
//!
//! Application payloads are JSON-encoded before framing so embedded newlines
//! and control characters are escaped and cannot break the blank-line frame
//! delimiter. Control frames carry a bare directive; the only defined
//! directive is [`CLOSE_DIRECTIVE`].
//!
//! Encoding is used by the server connection and the proxy; parsing by the
//! client transport, which stands in for a browser's EventSource.

/// Event name carried by transport-level directives.
pub const CONTROL_EVENT: &str = "control";

/// Default event name for application payloads.
pub const MESSAGE_EVENT: &str = "message";

/// The one defined control directive: the peer is closing the connection.
pub const CLOSE_DIRECTIVE: &str = "close";

/// Raw HTTP response head for an SSE subscription.
///
/// Written directly to the hijacked stream; `origin` is echoed into
/// `Access-Control-Allow-Origin` so credentialed cross-origin subscriptions
/// are accepted by the browser.
pub fn response_preamble(origin: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Cache-Control: no-cache\r\n\
         Connection: keep-alive\r\n\
         Access-Control-Allow-Credentials: true\r\n\
         Access-Control-Allow-Origin: {origin}\r\n\
         \r\n"
    )
}

/// Encode an application payload as a message frame.
pub fn message_frame(payload: &str) -> Vec<u8> {
    // JSON-encoding a string cannot fail
    let encoded = serde_json::to_string(payload).unwrap();
    format!("data: {encoded}\n\n").into_bytes()
}

/// Encode a transport directive as a control frame.
pub fn control_frame(directive: &str) -> Vec<u8> {
    format!("event: {CONTROL_EVENT}\ndata: {directive}\n\n").into_bytes()
}

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; defaults to `message` when the frame carries no
    /// `event:` field.
    pub name: String,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
}

/// Incremental parser for an SSE byte stream.
///
/// Feed it whatever the socket yields; it buffers partial lines across calls
/// and emits events as their terminating blank line arrives. Handles `\r\n`
/// and `\n` endings, comment lines, and multi-line data fields. `id:` and
/// `retry:` fields are accepted and ignored.
#[derive(Default)]
pub struct FrameParser {
    buf: Vec<u8>,
    event_name: Option<String>,
    data: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning any events completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&line).into_owned();
            if line.ends_with('\n') {
                line.pop();
            }
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let name = self.event_name.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            name: name.unwrap_or_else(|| MESSAGE_EVENT.to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}
