//! # Client Transport
//!
//! The browser-side half of the transport, standing in for an EventSource
//! plus `fetch` POSTs: one long-lived SSE subscription for inbound messages
//! and one short-lived HTTP POST per outbound message, both keyed to the same
//! generated client id.
//!
//! ## Retry semantics
//!
//! The subscription reconnects on transient failure the way EventSource does.
//! A debounce timer starts at the first observed error; recovery before it
//! fires suppresses the error, expiry surfaces it on the inbound stream and
//! closes the transport. Outbound POSTs retry within the same window.
//!
//! ## Ordering
//!
//! In ordered mode outbound messages drain through a single sender coroutine
//! that awaits each POST before issuing the next and stamps a monotonically
//! increasing `messageId`, so the server observes submission order. Unordered
//! mode issues each POST on its own coroutine for throughput.

use crate::frame::{self, FrameParser, SseEvent};
use crate::handler::{CLIENT_ID_PARAM, MESSAGE_ID_PARAM};
use crate::ids::ClientId;
use crate::runtime_config::RuntimeConfig;
use may::net::TcpStream;
use may::sync::mpsc::{self, Receiver, Sender};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default window a broken subscription or failing POST may recover in.
pub const DEFAULT_ERROR_DEBOUNCE: Duration = Duration::from_secs(5);

/// Delay between reconnect and POST retry attempts.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the server endpoint, e.g. `http://127.0.0.1:8080/sse`.
    pub server_url: String,
    /// Serialize outbound POSTs so the server observes submission order.
    pub ordered: bool,
    /// How long transport errors may go unrecovered before surfacing.
    pub error_debounce: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ordered: false,
            error_debounce: DEFAULT_ERROR_DEBOUNCE,
        }
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn error_debounce(mut self, window: Duration) -> Self {
        self.error_debounce = window;
        self
    }
}

/// Unrecoverable transport failures surfaced on the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The subscription could not be re-established within the debounce
    /// window.
    SubscriptionLost(String),
    /// An outbound POST kept failing past the debounce window.
    PostFailed(String),
    /// The server sent a control directive this client does not understand;
    /// treated as a protocol-version mismatch.
    UnknownControl(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::SubscriptionLost(e) => {
                write!(f, "subscription lost and not recovered: {e}")
            }
            ClientError::PostFailed(e) => write!(f, "outbound post failed: {e}"),
            ClientError::UnknownControl(d) => write!(f, "unknown control directive '{d}'"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Resolved pieces of the server URL.
#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    authority: String,
    path: String,
}

impl Endpoint {
    fn parse(server_url: &str) -> io::Result<Self> {
        let url = url::Url::parse(server_url)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no port"))?;
        let path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };
        Ok(Self {
            authority: format!("{host}:{port}"),
            host,
            port,
            path,
        })
    }

    fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port))
    }
}

type InboundSender = Sender<Result<String, ClientError>>;

struct ClientState {
    id: ClientId,
    endpoint: Endpoint,
    ordered: bool,
    error_debounce: Duration,
    closed: AtomicBool,
    last_message_id: AtomicU64,
    dropped_messages: AtomicU64,
    /// Clone of the live subscription socket, kept so close can unblock the
    /// reader.
    subscription: Mutex<Option<TcpStream>>,
    inbound_tx: Mutex<Option<InboundSender>>,
    outbound_tx: Mutex<Option<Sender<String>>>,
}

impl ClientState {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_inbound(&self, item: Result<String, ClientError>) -> bool {
        match self.inbound_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Tear down the subscription, both queues, and the outbound pipeline.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = self.subscription.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        // Dropping the senders finalizes the inbound stream and stops the
        // ordered sender coroutine.
        self.inbound_tx.lock().unwrap().take();
        self.outbound_tx.lock().unwrap().take();
        info!(client_id = %self.id, "client transport closed");
    }

    /// Surface an unrecoverable error, then close.
    fn fail(&self, err: ClientError) {
        error!(client_id = %self.id, error = %err, "client transport failed");
        self.send_inbound(Err(err));
        self.close();
    }
}

/// The transport's client endpoint.
///
/// Construction opens the SSE subscription; messages from the server arrive
/// on [`SseClient::recv`], messages to the server go out via
/// [`SseClient::send`]. Dropping the client closes the transport.
pub struct SseClient {
    state: Arc<ClientState>,
    inbound_rx: Receiver<Result<String, ClientError>>,
}

impl SseClient {
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let endpoint = Endpoint::parse(&config.server_url)?;
        let stack_size = RuntimeConfig::from_env().stack_size;
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let state = Arc::new(ClientState {
            id: ClientId::generate(),
            endpoint,
            ordered: config.ordered,
            error_debounce: config.error_debounce,
            closed: AtomicBool::new(false),
            last_message_id: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            subscription: Mutex::new(None),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            outbound_tx: Mutex::new(None),
        });

        spawn(stack_size, {
            let state = state.clone();
            move || subscription_loop(state)
        })?;

        if config.ordered {
            let (outbound_tx, outbound_rx) = mpsc::channel::<String>();
            *state.outbound_tx.lock().unwrap() = Some(outbound_tx);
            spawn(stack_size, {
                let state = state.clone();
                move || sender_loop(state, outbound_rx)
            })?;
        }

        Ok(Self { state, inbound_rx })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.state.id
    }

    /// Submit an outbound message.
    ///
    /// Never blocks on network I/O; in ordered mode the message joins the
    /// sender queue, otherwise a coroutine posts it concurrently. Dropped
    /// silently after close.
    pub fn send(&self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.state.is_closed() {
            return;
        }
        if self.state.ordered {
            if let Some(tx) = self.state.outbound_tx.lock().unwrap().as_ref() {
                let _ = tx.send(msg);
            }
        } else {
            let state = self.state.clone();
            may::go!(move || {
                post_message(&state, &msg, None);
            });
        }
    }

    /// Next inbound item, blocking the calling coroutine. Unrecoverable
    /// failures arrive as one `Err` followed by end-of-stream (`None`).
    pub fn recv(&self) -> Option<Result<String, ClientError>> {
        self.inbound_rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Result<String, ClientError>> {
        self.inbound_rx.try_recv().ok()
    }

    pub fn messages(&self) -> impl Iterator<Item = Result<String, ClientError>> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    pub fn close(&self) {
        self.state.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Number of outbound messages dropped because they could not be encoded.
    pub fn dropped_messages(&self) -> u64 {
        self.state.dropped_messages.load(Ordering::SeqCst)
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.state.close();
    }
}

fn spawn<F: FnOnce() + Send + 'static>(stack_size: usize, f: F) -> io::Result<()> {
    // The coroutine runtime requires unsafe spawn; the closures own their
    // state and communicate only over channels.
    let spawned = unsafe { may::coroutine::Builder::new().stack_size(stack_size).spawn(f) };
    spawned
        .map(|_| ())
        .map_err(|e| io::Error::other(format!("failed to spawn client coroutine: {e}")))
}

enum Flow {
    Continue,
    Stop,
}

fn subscription_loop(state: Arc<ClientState>) {
    let mut first_error: Option<Instant> = None;
    loop {
        if state.is_closed() {
            return;
        }
        match open_subscription(&state) {
            Ok((mut stream, mut parser, pending)) => {
                debug!(client_id = %state.id, "subscription established");
                first_error = None;
                if let Flow::Stop = process_events(&state, pending) {
                    return;
                }
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Flow::Stop = process_events(&state, parser.push(&buf[..n])) {
                                return;
                            }
                        }
                        Err(_) => break,
                    }
                    if state.is_closed() {
                        return;
                    }
                }
                state.subscription.lock().unwrap().take();
            }
            Err(e) => {
                debug!(client_id = %state.id, error = %e, "subscription attempt failed");
            }
        }
        if state.is_closed() {
            return;
        }
        let started = *first_error.get_or_insert_with(Instant::now);
        if started.elapsed() >= state.error_debounce {
            state.fail(ClientError::SubscriptionLost(
                "debounce window elapsed".to_string(),
            ));
            return;
        }
        may::coroutine::sleep(RETRY_DELAY);
    }
}

/// Open the SSE subscription and validate the response head. Returns the
/// stream, the frame parser, and any events already carried by bytes read
/// past the head.
fn open_subscription(
    state: &Arc<ClientState>,
) -> io::Result<(TcpStream, FrameParser, Vec<SseEvent>)> {
    let mut stream = state.endpoint.connect()?;
    write!(
        stream,
        "GET {}?{}={} HTTP/1.1\r\n\
         Host: {}\r\n\
         Accept: text/event-stream\r\n\
         Cache-Control: no-cache\r\n\
         \r\n",
        state.endpoint.path, CLIENT_ID_PARAM, state.id, state.endpoint.authority
    )?;
    stream.flush()?;

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let status_ok = head
        .lines()
        .next()
        .map(|l| l.split_whitespace().nth(1) == Some("200"))
        .unwrap_or(false);
    let is_event_stream = head
        .lines()
        .any(|l| l.to_ascii_lowercase().starts_with("content-type:") && l.contains("text/event-stream"));
    if !status_ok || !is_event_stream {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "endpoint did not open an event stream",
        ));
    }

    *state.subscription.lock().unwrap() = Some(stream.try_clone()?);
    let mut parser = FrameParser::new();
    let pending = parser.push(&buf[head_end..]);
    Ok((stream, parser, pending))
}

fn process_events(state: &Arc<ClientState>, events: Vec<SseEvent>) -> Flow {
    for event in events {
        match event.name.as_str() {
            frame::MESSAGE_EVENT => match serde_json::from_str::<String>(&event.data) {
                Ok(msg) => {
                    if !state.send_inbound(Ok(msg)) {
                        // Inbound consumer is gone.
                        state.close();
                        return Flow::Stop;
                    }
                }
                Err(e) => {
                    warn!(client_id = %state.id, error = %e, "malformed inbound payload");
                }
            },
            frame::CONTROL_EVENT => {
                if event.data == frame::CLOSE_DIRECTIVE {
                    info!(client_id = %state.id, "server closed the connection");
                    state.close();
                } else {
                    state.fail(ClientError::UnknownControl(event.data));
                }
                return Flow::Stop;
            }
            other => {
                debug!(client_id = %state.id, event = other, "ignoring unexpected event");
            }
        }
    }
    Flow::Continue
}

fn sender_loop(state: Arc<ClientState>, outbound_rx: Receiver<String>) {
    for msg in outbound_rx.iter() {
        let message_id = state.last_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        if !post_message(&state, &msg, Some(message_id)) {
            return;
        }
    }
}

/// POST one message, retrying transient failures within the debounce window.
/// Returns false only when the failure was surfaced and the transport closed.
fn post_message(state: &Arc<ClientState>, msg: &str, message_id: Option<u64>) -> bool {
    let body = match serde_json::to_string(msg) {
        Ok(body) => body,
        Err(e) => {
            warn!(client_id = %state.id, error = %e, "dropping unencodable outbound message");
            state.dropped_messages.fetch_add(1, Ordering::SeqCst);
            return true;
        }
    };
    let start = Instant::now();
    loop {
        if state.is_closed() {
            return true;
        }
        match try_post(state, &body, message_id) {
            Ok(()) => return true,
            Err(e) => {
                debug!(client_id = %state.id, error = %e, "message post failed");
                if start.elapsed() >= state.error_debounce {
                    state.fail(ClientError::PostFailed(e.to_string()));
                    return false;
                }
                may::coroutine::sleep(RETRY_DELAY);
            }
        }
    }
}

fn try_post(state: &Arc<ClientState>, body: &str, message_id: Option<u64>) -> io::Result<()> {
    let mut stream = state.endpoint.connect()?;
    let mut target = format!(
        "{}?{}={}",
        state.endpoint.path, CLIENT_ID_PARAM, state.id
    );
    if let Some(n) = message_id {
        target.push_str(&format!("&{MESSAGE_ID_PARAM}={n}"));
    }
    write!(
        stream,
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        target,
        state.endpoint.authority,
        body.len(),
        body
    )?;
    stream.flush()?;

    let mut buf = Vec::new();
    let mut tmp = [0u8; 256];
    loop {
        if buf.windows(2).any(|w| w == b"\r\n") {
            break;
        }
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let status_line = String::from_utf8_lossy(&buf);
    let status = status_line
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed response"))?;
    if !(200..300).contains(&status) {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("post rejected with status {status}"),
        ));
    }
    Ok(())
}
