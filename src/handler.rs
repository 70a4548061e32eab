//! # Server Handler
//!
//! HTTP-level dispatcher for the transport: routes SSE GETs to subscription
//! setup and POSTs to inbound delivery, and owns the `id → connection`
//! registry.
//!
//! ## Dispatch rules
//!
//! | Method | `Accept`                  | Action                                   |
//! |--------|---------------------------|------------------------------------------|
//! | GET    | `text/event-stream`       | Hijack, write preamble, attach or create |
//! | POST   | not `text/event-stream`   | Decode body, deliver, respond 200        |
//! | other  | —                         | 404                                      |
//!
//! Requests for any path other than the configured one are 404s. Malformed
//! POST bodies and unknown client ids are logged and still answered 200 so a
//! client's outbound pipeline is never destabilized by a bad message.
//!
//! ## Reattach policy
//!
//! A GET for a registered id reattaches iff that connection is inside its
//! keep-alive period; a duplicate GET for a live connection evicts it and
//! creates a fresh connection under the same id.

use crate::connection::{spawn_connection, ConnEvent, ConnHandle, ServerConnection, TcpFrameSink};
use crate::frame;
use crate::ids::ClientId;
use crate::runtime_config::RuntimeConfig;
use crate::server::{write_empty, write_json_error, HttpRequest, Service};
use http::Method;
use may::net::TcpStream;
use may::sync::mpsc::{self, Receiver, Sender};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Query parameter carrying the client's connection id.
pub const CLIENT_ID_PARAM: &str = "sseClientId";

/// Optional query parameter carrying the client's outbound message counter.
pub const MESSAGE_ID_PARAM: &str = "messageId";

/// Handler configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// URL path the handler answers on.
    pub path: String,
    /// How long a connection survives after losing its sink; `None` closes
    /// it on the first sink loss.
    pub keep_alive: Option<Duration>,
}

impl HandlerConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            keep_alive: None,
        }
    }

    pub fn keep_alive(mut self, window: Duration) -> Self {
        self.keep_alive = Some(window);
        self
    }
}

type Registry = Arc<Mutex<HashMap<ClientId, ConnHandle>>>;

/// Stream of newly accepted connections, emitted once each at creation time.
///
/// Non-restartable; the handler buffers connections until they are taken.
pub struct Connections {
    rx: Option<Receiver<ServerConnection>>,
}

impl Connections {
    /// Next new connection, blocking the calling coroutine.
    pub fn next_connection(&self) -> Option<ServerConnection> {
        self.rx.as_ref().and_then(|rx| rx.recv().ok())
    }

    pub fn try_next(&self) -> Option<ServerConnection> {
        self.rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Iterator for Connections {
    type Item = ServerConnection;

    fn next(&mut self) -> Option<ServerConnection> {
        self.next_connection()
    }
}

/// The transport's server endpoint.
///
/// Embed it into an HTTP server as a [`Service`] (wrap in an [`Arc`] to keep
/// a handle for [`SseHandler::connections`] and [`SseHandler::number_of_clients`]).
pub struct SseHandler {
    config: HandlerConfig,
    stack_size: usize,
    registry: Registry,
    connections_tx: Mutex<Sender<ServerConnection>>,
    connections_rx: Mutex<Option<Receiver<ServerConnection>>>,
}

impl SseHandler {
    pub fn new(config: HandlerConfig) -> Self {
        let (connections_tx, connections_rx) = mpsc::channel();
        Self {
            config,
            stack_size: RuntimeConfig::from_env().stack_size,
            registry: Arc::new(Mutex::new(HashMap::new())),
            connections_tx: Mutex::new(connections_tx),
            connections_rx: Mutex::new(Some(connections_rx)),
        }
    }

    /// Take the stream of newly accepted connections.
    ///
    /// The stream can only be taken once; later calls log a warning and
    /// return a stream that yields nothing.
    pub fn connections(&self) -> Connections {
        let rx = self.connections_rx.lock().unwrap().take();
        if rx.is_none() {
            warn!("connections stream taken more than once");
        }
        Connections { rx }
    }

    /// Number of currently registered (non-closed) connections.
    pub fn number_of_clients(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    fn subscribe(&self, req: HttpRequest, mut stream: TcpStream) -> io::Result<()> {
        let Some(id) = req.query(CLIENT_ID_PARAM) else {
            warn!(path = %req.path, "subscription without client id");
            return write_json_error(&mut stream, 404, serde_json::json!({"error": "Not Found"}));
        };
        let id = ClientId::from(id);
        let origin = req.cors_origin();

        stream.write_all(frame::response_preamble(origin).as_bytes())?;
        stream.flush()?;
        let sink = Box::new(TcpFrameSink::new(stream));

        let mut registry = self.registry.lock().unwrap();
        if let Some(handle) = registry.get(&id) {
            if handle.shared.is_in_keep_alive() && !handle.shared.is_closed() {
                info!(client_id = %id, "reattaching subscription within keep-alive");
                let _ = handle.events.send(ConnEvent::Attach(sink));
                return Ok(());
            }
            // Duplicate GET for a live id: evict and create new.
            info!(client_id = %id, "evicting live connection for duplicate subscription");
            let _ = handle.events.send(ConnEvent::Close);
            registry.remove(&id);
        }

        let on_close = {
            let registry = Arc::clone(&self.registry);
            let id = id.clone();
            Box::new(move |shared: &Arc<crate::connection::ConnShared>| {
                let mut registry = registry.lock().unwrap();
                // Only remove our own slot; a successor under the same id
                // must keep its registration.
                let ours = registry
                    .get(&id)
                    .map(|entry| Arc::ptr_eq(&entry.shared, shared))
                    .unwrap_or(false);
                if ours {
                    registry.remove(&id);
                }
            })
        };
        let (connection, handle) =
            spawn_connection(id.clone(), self.config.keep_alive, self.stack_size, on_close)?;
        let _ = handle.events.send(ConnEvent::Attach(sink));
        registry.insert(id.clone(), handle);
        drop(registry);

        info!(client_id = %id, clients = self.number_of_clients(), "connection accepted");
        let published = self.connections_tx.lock().unwrap().send(connection);
        if published.is_err() {
            debug!(client_id = %id, "connections stream receiver dropped");
        }
        Ok(())
    }

    fn deliver(&self, req: HttpRequest, mut stream: TcpStream) -> io::Result<()> {
        let origin = req.cors_origin().to_string();
        // Recover scope: a bad message must not fail the POST.
        match req.query(CLIENT_ID_PARAM) {
            None => warn!(path = %req.path, "message without client id"),
            Some(id) => match decode_message(&req.body) {
                None => warn!(client_id = %id, "malformed message payload"),
                Some(msg) => {
                    let registry = self.registry.lock().unwrap();
                    match registry.get(&ClientId::from(id)) {
                        Some(handle) => {
                            debug!(
                                client_id = %id,
                                message_id = req.query(MESSAGE_ID_PARAM).unwrap_or("-"),
                                "message delivered"
                            );
                            let _ = handle.events.send(ConnEvent::Deliver(msg));
                        }
                        None => debug!(client_id = %id, "message for unknown client"),
                    }
                }
            },
        }
        write_empty(&mut stream, 200, &origin)
    }
}

fn decode_message(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    serde_json::from_str::<String>(text).ok()
}

impl Service for SseHandler {
    fn call(&self, req: HttpRequest, mut stream: TcpStream) -> io::Result<()> {
        if req.path != self.config.path {
            return write_json_error(
                &mut stream,
                404,
                serde_json::json!({"error": "Not Found", "path": req.path}),
            );
        }
        if req.method == Method::GET && req.wants_event_stream() {
            self.subscribe(req, stream)
        } else if req.method == Method::POST && !req.wants_event_stream() {
            self.deliver(req, stream)
        } else {
            write_json_error(
                &mut stream,
                404,
                serde_json::json!({"error": "Not Found", "method": req.method.as_str()}),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message() {
        assert_eq!(decode_message(b"\"hi\""), Some("hi".to_string()));
        assert_eq!(decode_message(b"{not json"), None);
        assert_eq!(decode_message(b"\xff\xfe"), None);
    }

    #[test]
    fn test_handler_config_builder() {
        let config = HandlerConfig::new("/sse").keep_alive(Duration::from_secs(5));
        assert_eq!(config.path, "/sse");
        assert_eq!(config.keep_alive, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_connections_stream_taken_once() {
        let handler = SseHandler::new(HandlerConfig::new("/sse"));
        let first = handler.connections();
        assert!(first.rx.is_some());
        let second = handler.connections();
        assert!(second.rx.is_none());
        assert!(second.try_next().is_none());
    }
}
