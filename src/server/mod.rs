//! # Server Module
//!
//! The embeddable HTTP server the transport's handler and proxy plug into,
//! built on `may` coroutines.
//!
//! ## Overview
//!
//! This module contains:
//! - [`HttpServer`] - Accept loop dispatching each connection to a [`Service`]
//! - [`Service`] - The handler seam; implementations may hijack the raw stream
//! - Request parsing and response writing helpers
//!
//! ## Architecture
//!
//! ```text
//! TCP Connection → HttpServer → parse_request → Service (SseHandler / SseProxy)
//! ```
//!
//! Unlike a buffering HTTP framework, the server hands the accepted stream to
//! the service together with the parsed request. An SSE subscription takes the
//! stream over and writes `text/event-stream` frames for the life of the
//! connection; everything else writes a short `Connection: close` response.

/// Coroutine-per-connection HTTP server
pub mod http_server;
/// Request parsing and query extraction
pub mod request;
/// Response writing helpers
pub mod response;

pub use http_server::{HttpServer, ServerHandle, Service};
pub use request::{parse_request, HttpRequest};
pub use response::{write_empty, write_json_error};
