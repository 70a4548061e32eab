//! # brrtchannel
//!
//! A bidirectional message channel built on one-way Server-Sent Events plus
//! ordinary HTTP POST, for environments where WebSockets are unavailable
//! (restricted corporate networks, awkward proxy topologies).
//!
//! ## How it works
//!
//! Each endpoint sees a pair of message streams. Server-to-client messages
//! ride an SSE subscription; client-to-server messages are short-lived POSTs
//! carrying the same client-chosen id:
//!
//! ```text
//! client ──GET ?sseClientId=X (SSE)──► handler ──attach──► connection[X]
//! client ──POST ?sseClientId=X───────► handler ──deliver─► connection[X] ──► app
//! app ──► connection[X].sink ──SSE frame──► client
//! ```
//!
//! A server connection survives transient client disconnects: with a
//! keep-alive window configured, outbound messages buffer while the sink is
//! gone and replay in submission order when the client's EventSource
//! reconnects under the same id.
//!
//! ## Example
//!
//! ```rust,no_run
//! use brrtchannel::{HandlerConfig, HttpServer, SseHandler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> std::io::Result<()> {
//! let handler = Arc::new(SseHandler::new(
//!     HandlerConfig::new("/sse").keep_alive(Duration::from_secs(30)),
//! ));
//! let connections = handler.connections();
//! let server = HttpServer(handler).start("127.0.0.1:8080")?;
//! server.wait_ready()?;
//!
//! for connection in connections {
//!     may::go!(move || {
//!         // Echo everything the client sends.
//!         for msg in connection.stream().iter() {
//!             connection.sink().send(msg);
//!         }
//!     });
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The [`SseClient`] half pairs with the handler (or with a browser's
//! EventSource speaking the same wire protocol), and [`SseProxy`] forwards
//! both directions through an intermediate hop.

pub mod client;
pub mod connection;
pub mod frame;
pub mod handler;
pub mod ids;
pub mod proxy;
pub mod runtime_config;
pub mod server;

pub use client::{ClientConfig, ClientError, SseClient};
pub use connection::{FrameSink, MessageSink, MessageStream, ServerConnection, TcpFrameSink};
pub use handler::{Connections, HandlerConfig, SseHandler};
pub use ids::ClientId;
pub use proxy::SseProxy;
pub use server::{HttpServer, ServerHandle, Service};
