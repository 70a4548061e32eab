//! # Server Connection
//!
//! Per-client connection state: the inbound and outbound message queues, the
//! attached frame sink, and the keep-alive state machine.
//!
//! ## Architecture
//!
//! Each connection is a single actor coroutine fed by one event channel.
//! Attach/detach from the handler, message submission from the application,
//! POST delivery, keep-alive expiry, and close all arrive as [`ConnEvent`]s
//! and are applied in order, so connection state is only ever mutated from
//! the actor. Cross-actor interaction is by channel submission, never shared
//! mutation.
//!
//! ## State machine
//!
//! ```text
//!             attach (first GET)
//!   [init] ─────────────────────► [LIVE]
//!   [LIVE] ── sink drop, keep-alive unset ─► [CLOSED]
//!   [LIVE] ── sink drop, keep-alive set ───► [KEEP_ALIVE]   (timer armed)
//!   [KEEP_ALIVE] ── new GET, same id ──────► [LIVE]         (timer cancelled)
//!   [KEEP_ALIVE] ── timer expires ─────────► [CLOSED]
//!   [LIVE] ── consumer cancels / close ────► [CLOSED]
//! ```
//!
//! Outbound messages are held in an in-order buffer until a write to the
//! attached sink succeeds. A failed write while keep-alive is configured
//! detaches the sink and leaves the unwritten head buffered, so a reattach
//! within the window replays every pending message in submission order before
//! anything submitted later.

use crate::frame;
use crate::ids::ClientId;
use may::sync::mpsc::{self, Receiver, Sender};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Minimal capability a connection needs from an attached response writer.
///
/// Implemented by the raw TCP stream of a hijacked SSE response and by
/// in-memory doubles in tests; the connection never couples to a framework
/// response object.
pub trait FrameSink: Send {
    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn close(&mut self);
}

/// [`FrameSink`] over an accepted TCP stream.
pub struct TcpFrameSink {
    stream: may::net::TcpStream,
}

impl TcpFrameSink {
    pub fn new(stream: may::net::TcpStream) -> Self {
        Self { stream }
    }
}

impl FrameSink for TcpFrameSink {
    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Events applied, in order, by the connection actor.
pub(crate) enum ConnEvent {
    /// Outbound message from the application.
    Submit(String),
    /// Inbound message decoded from a POST.
    Deliver(String),
    /// A new subscription response body to write frames into.
    Attach(Box<dyn FrameSink>),
    /// Terminate the attached sink as if the transport dropped it.
    CloseSink,
    /// The keep-alive timer armed at generation `n` fired.
    KeepAliveExpired(u64),
    /// Close the connection.
    Close,
}

/// Connection flags observable outside the actor.
pub(crate) struct ConnShared {
    closed: AtomicBool,
    in_keep_alive: AtomicBool,
}

impl ConnShared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            in_keep_alive: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_in_keep_alive(&self) -> bool {
        self.in_keep_alive.load(Ordering::SeqCst)
    }
}

/// Control handle the handler's registry keeps per connection.
pub(crate) struct ConnHandle {
    pub(crate) events: Sender<ConnEvent>,
    pub(crate) shared: Arc<ConnShared>,
}

/// Outbound half of a server connection.
///
/// Submission never blocks on network I/O; messages are queued and drained by
/// the connection actor. Sends after close are silently dropped.
#[derive(Clone)]
pub struct MessageSink {
    events: Sender<ConnEvent>,
    shared: Arc<ConnShared>,
}

impl MessageSink {
    /// Enqueue an outbound message for the client.
    pub fn send(&self, msg: impl Into<String>) {
        if self.shared.is_closed() {
            return;
        }
        let _ = self.events.send(ConnEvent::Submit(msg.into()));
    }

    /// Signal end-of-input: closes the connection.
    pub fn close(&self) {
        let _ = self.events.send(ConnEvent::Close);
    }
}

/// Inbound half of a server connection: a finite, non-restartable sequence of
/// messages the client POSTed, ending when the connection closes.
///
/// Dropping the stream cancels the consumer and closes the connection.
pub struct MessageStream {
    rx: Receiver<String>,
    events: Sender<ConnEvent>,
}

impl MessageStream {
    /// Next inbound message, blocking the calling coroutine. `None` once the
    /// connection has closed and the queue is drained.
    pub fn recv(&self) -> Option<String> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::from_fn(move || self.recv())
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        let _ = self.events.send(ConnEvent::Close);
    }
}

/// A logical client connection as seen by the embedding application.
///
/// Obtained from the handler's `connections` stream. Dropping it cancels the
/// inbound consumer and closes the connection.
pub struct ServerConnection {
    id: ClientId,
    sink: MessageSink,
    stream: MessageStream,
    shared: Arc<ConnShared>,
}

impl ServerConnection {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Outbound sink; cheap to clone out of the connection.
    pub fn sink(&self) -> &MessageSink {
        &self.sink
    }

    /// Inbound message stream.
    pub fn stream(&self) -> &MessageStream {
        &self.stream
    }

    /// True while the connection has lost its sink and the keep-alive timer
    /// is armed awaiting a reattach.
    pub fn is_in_keep_alive_period(&self) -> bool {
        self.shared.is_in_keep_alive()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Terminate the currently attached sink without closing the connection.
    ///
    /// Test support: simulates the transport dropping out from under the
    /// subscription, which is otherwise only observable as a write failure.
    pub fn close_sink(&self) {
        let _ = self.sink.events.send(ConnEvent::CloseSink);
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        self.sink.close();
    }
}

type CloseCallback = Box<dyn FnOnce(&Arc<ConnShared>) + Send>;

/// Spawn the actor coroutine for a new connection.
///
/// Returns the application-facing connection and the control handle the
/// handler registers. `on_close` runs exactly once during teardown, with the
/// connection's own shared flags so the registry can identity-check removal.
pub(crate) fn spawn_connection(
    id: ClientId,
    keep_alive: Option<Duration>,
    stack_size: usize,
    on_close: CloseCallback,
) -> io::Result<(ServerConnection, ConnHandle)> {
    let (events_tx, events_rx) = mpsc::channel::<ConnEvent>();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>();
    let shared = Arc::new(ConnShared::new());

    let actor = ConnectionActor {
        id: id.clone(),
        keep_alive,
        shared: shared.clone(),
        events_tx: events_tx.clone(),
        inbound_tx: Some(inbound_tx),
        sink: None,
        buffer: VecDeque::new(),
        keep_alive_gen: 0,
        closed: false,
        on_close: Some(on_close),
    };

    // The coroutine runtime requires unsafe spawn; the actor owns all of its
    // state and communicates only over channels.
    let spawned = unsafe {
        may::coroutine::Builder::new()
            .stack_size(stack_size)
            .spawn(move || actor.run(events_rx))
    };
    if let Err(e) = spawned {
        return Err(io::Error::other(format!(
            "failed to spawn connection coroutine: {e}"
        )));
    }

    let connection = ServerConnection {
        id,
        sink: MessageSink {
            events: events_tx.clone(),
            shared: shared.clone(),
        },
        stream: MessageStream {
            rx: inbound_rx,
            events: events_tx.clone(),
        },
        shared: shared.clone(),
    };
    let handle = ConnHandle {
        events: events_tx,
        shared,
    };
    Ok((connection, handle))
}

struct ConnectionActor {
    id: ClientId,
    keep_alive: Option<Duration>,
    shared: Arc<ConnShared>,
    events_tx: Sender<ConnEvent>,
    inbound_tx: Option<Sender<String>>,
    sink: Option<Box<dyn FrameSink>>,
    /// Outbound messages not yet written to a sink, in submission order.
    buffer: VecDeque<String>,
    /// Bumped on every attach and detach; stale timer firings are ignored.
    keep_alive_gen: u64,
    closed: bool,
    on_close: Option<CloseCallback>,
}

impl ConnectionActor {
    fn run(mut self, events_rx: Receiver<ConnEvent>) {
        debug!(client_id = %self.id, "connection actor started");
        while let Ok(event) = events_rx.recv() {
            match event {
                ConnEvent::Submit(msg) => {
                    self.buffer.push_back(msg);
                    self.flush();
                }
                ConnEvent::Deliver(msg) => self.deliver(msg),
                ConnEvent::Attach(sink) => self.attach(sink),
                ConnEvent::CloseSink => self.lose_sink(),
                ConnEvent::KeepAliveExpired(gen) => {
                    if gen == self.keep_alive_gen && self.sink.is_none() && !self.closed {
                        info!(client_id = %self.id, "keep-alive window expired");
                        self.close();
                    }
                }
                ConnEvent::Close => self.close(),
            }
            if self.closed {
                break;
            }
        }
        // All senders gone without an explicit close.
        if !self.closed {
            self.close();
        }
    }

    fn attach(&mut self, sink: Box<dyn FrameSink>) {
        if self.closed {
            return;
        }
        // At most one sink at a time; a replacement terminates its predecessor.
        if let Some(mut old) = self.sink.take() {
            warn!(client_id = %self.id, "replacing an attached sink");
            old.close();
        }
        self.keep_alive_gen += 1;
        self.shared.in_keep_alive.store(false, Ordering::SeqCst);
        self.sink = Some(sink);
        info!(client_id = %self.id, buffered = self.buffer.len(), "sink attached");
        self.flush();
    }

    fn deliver(&mut self, msg: String) {
        let delivered = self
            .inbound_tx
            .as_ref()
            .map(|tx| tx.send(msg).is_ok())
            .unwrap_or(false);
        if !delivered {
            // Inbound consumer cancelled.
            debug!(client_id = %self.id, "inbound consumer gone");
            self.close();
        }
    }

    /// Write buffered messages to the attached sink, oldest first. Stops at
    /// the first failure without discarding the unwritten head.
    fn flush(&mut self) {
        while let Some(msg) = self.buffer.front() {
            let Some(sink) = self.sink.as_mut() else {
                return;
            };
            match sink.write_frame(&frame::message_frame(msg)) {
                Ok(()) => {
                    debug!(client_id = %self.id, "frame written");
                    self.buffer.pop_front();
                }
                Err(e) => {
                    debug!(client_id = %self.id, error = %e, "sink write failed");
                    self.lose_sink();
                    return;
                }
            }
        }
    }

    /// The sink dropped out from under the connection: enter the keep-alive
    /// period if configured, close otherwise.
    fn lose_sink(&mut self) {
        if self.closed {
            return;
        }
        self.keep_alive_gen += 1;
        let sink = self.sink.take();
        match self.keep_alive {
            Some(window) => {
                // Flag the keep-alive period before terminating the old
                // sink: a reconnect racing the termination must observe it.
                self.shared.in_keep_alive.store(true, Ordering::SeqCst);
                info!(client_id = %self.id, window_ms = window.as_millis() as u64, "entering keep-alive period");
                let gen = self.keep_alive_gen;
                let events = self.events_tx.clone();
                may::go!(move || {
                    may::coroutine::sleep(window);
                    let _ = events.send(ConnEvent::KeepAliveExpired(gen));
                });
                if let Some(mut sink) = sink {
                    sink.close();
                }
            }
            None => {
                if let Some(mut sink) = sink {
                    sink.close();
                }
                self.close();
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.in_keep_alive.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.take() {
            // Best effort: tell the peer not to reconnect.
            let _ = sink.write_frame(&frame::control_frame(frame::CLOSE_DIRECTIVE));
            sink.close();
        }
        self.buffer.clear();
        // Finalizes the inbound stream.
        self.inbound_tx = None;
        if let Some(on_close) = self.on_close.take() {
            on_close(&self.shared);
        }
        info!(client_id = %self.id, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    /// In-memory sink double recording frames; can be switched to fail.
    #[derive(Clone)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                frames: Arc::new(Mutex::new(Vec::new())),
                fail: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn texts(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink gone"));
            }
            self.frames.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn spawn(keep_alive: Option<Duration>) -> (ServerConnection, ConnHandle) {
        spawn_connection(
            ClientId::from("test-client"),
            keep_alive,
            0x8000,
            Box::new(|_| {}),
        )
        .unwrap()
    }

    fn wait_until(what: &str, pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pred() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_messages_flow_in_order_while_attached() {
        let (conn, handle) = spawn(Some(Duration::from_secs(5)));
        let sink = RecordingSink::new();
        handle
            .events
            .send(ConnEvent::Attach(Box::new(sink.clone())))
            .unwrap();
        conn.sink().send("one");
        conn.sink().send("two");
        wait_until("two frames", || sink.texts().len() == 2);
        assert_eq!(sink.texts(), vec!["data: \"one\"\n\n", "data: \"two\"\n\n"]);
    }

    #[test]
    fn test_write_failure_with_keep_alive_buffers_and_replays() {
        let (conn, handle) = spawn(Some(Duration::from_secs(5)));
        let first = RecordingSink::new();
        handle
            .events
            .send(ConnEvent::Attach(Box::new(first.clone())))
            .unwrap();
        conn.sink().send("before");
        wait_until("first frame", || first.texts().len() == 1);

        first.fail.store(true, Ordering::SeqCst);
        conn.sink().send("one");
        conn.sink().send("two");
        wait_until("keep-alive entered", || conn.is_in_keep_alive_period());
        assert!(!conn.is_closed());

        let second = RecordingSink::new();
        handle
            .events
            .send(ConnEvent::Attach(Box::new(second.clone())))
            .unwrap();
        conn.sink().send("three");
        wait_until("replayed frames", || second.texts().len() == 3);
        assert_eq!(
            second.texts(),
            vec![
                "data: \"one\"\n\n",
                "data: \"two\"\n\n",
                "data: \"three\"\n\n"
            ]
        );
        assert!(!conn.is_in_keep_alive_period());
    }

    #[test]
    fn test_write_failure_without_keep_alive_closes() {
        let (conn, handle) = spawn(None);
        let sink = RecordingSink::new();
        sink.fail.store(true, Ordering::SeqCst);
        handle
            .events
            .send(ConnEvent::Attach(Box::new(sink)))
            .unwrap();
        conn.sink().send("doomed");
        wait_until("closed", || conn.is_closed());
        assert!(conn.stream().recv().is_none());
    }

    #[test]
    fn test_keep_alive_expiry_closes() {
        let (conn, _handle) = spawn(Some(Duration::from_millis(50)));
        conn.close_sink();
        wait_until("keep-alive entered", || conn.is_in_keep_alive_period());
        wait_until("closed after expiry", || conn.is_closed());
    }

    #[test]
    fn test_reattach_cancels_keep_alive_timer() {
        let (conn, handle) = spawn(Some(Duration::from_millis(80)));
        conn.close_sink();
        wait_until("keep-alive entered", || conn.is_in_keep_alive_period());
        let sink = RecordingSink::new();
        handle
            .events
            .send(ConnEvent::Attach(Box::new(sink)))
            .unwrap();
        wait_until("live again", || !conn.is_in_keep_alive_period());
        // Let the stale timer fire; the connection must survive it.
        std::thread::sleep(Duration::from_millis(150));
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_close_writes_control_frame() {
        let (conn, handle) = spawn(Some(Duration::from_secs(5)));
        let sink = RecordingSink::new();
        handle
            .events
            .send(ConnEvent::Attach(Box::new(sink.clone())))
            .unwrap();
        conn.sink().close();
        wait_until("closed", || conn.is_closed());
        assert_eq!(sink.texts(), vec!["event: control\ndata: close\n\n"]);
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_inbound_delivery_and_finalization() {
        let (conn, handle) = spawn(None);
        handle
            .events
            .send(ConnEvent::Deliver("ping".to_string()))
            .unwrap();
        assert_eq!(conn.stream().recv(), Some("ping".to_string()));
        conn.sink().close();
        assert_eq!(conn.stream().recv(), None);
    }

    #[test]
    fn test_dropping_connection_closes_it() {
        let (conn, handle) = spawn(Some(Duration::from_secs(5)));
        let shared = handle.shared.clone();
        drop(conn);
        wait_until("closed after drop", || shared.is_closed());
    }

    #[test]
    fn test_on_close_runs_once_with_shared_identity() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let (conn, handle) = spawn_connection(
            ClientId::from("cb"),
            None,
            0x8000,
            Box::new(move |shared| {
                assert!(shared.is_closed());
                called2.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let _ = handle;
        conn.sink().close();
        wait_until("callback", || called.load(Ordering::SeqCst));
    }
}
