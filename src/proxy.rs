//! # Pass-Through Proxy
//!
//! Forwards both directions of the transport while preserving SSE framing and
//! the client-id correlation, so a client can sit behind an intermediate hop
//! without either end noticing.
//!
//! SSE GETs open a streaming upstream request with the original query string
//! and headers (`Host` rewritten, redirects not followed), hijack the
//! downstream response, and pump upstream body bytes through until either
//! side ends. POSTs are forwarded verbatim through a reverse-proxy forwarder
//! created lazily on first use.

use crate::frame;
use crate::server::{write_json_error, HttpRequest, Service};
use http::Method;
use may::net::TcpStream;
use once_cell::sync::OnceCell;
use std::io::{self, Read, Write};
use tracing::{debug, info};

/// Proxy configuration and state.
pub struct SseProxy {
    proxy_path: String,
    upstream: Upstream,
    forwarder: OnceCell<PostForwarder>,
}

#[derive(Debug, Clone)]
struct Upstream {
    host: String,
    port: u16,
    authority: String,
    path: String,
}

impl Upstream {
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

    fn target_for(&self, req: &HttpRequest) -> String {
        match req.raw_query() {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

impl SseProxy {
    /// Create a proxy answering on `proxy_path` and forwarding to the server
    /// endpoint at `server_url`.
    pub fn new(proxy_path: impl Into<String>, server_url: &str) -> io::Result<Self> {
        Ok(Self {
            proxy_path: proxy_path.into(),
            upstream: Upstream::parse(server_url)?,
            forwarder: OnceCell::new(),
        })
    }

    fn pump_subscription(&self, req: HttpRequest, mut downstream: TcpStream) -> io::Result<()> {
        let origin = req.cors_origin().to_string();
        let mut upstream = self.upstream.connect()?;

        // Forward the subscription with the original query string and
        // headers; Host is rewritten to the upstream authority. Redirects
        // are not followed.
        write!(upstream, "GET {} HTTP/1.1\r\n", self.upstream.target_for(&req))?;
        write!(upstream, "Host: {}\r\n", self.upstream.authority)?;
        for (name, value) in &req.headers {
            if name == "host" || name == "connection" {
                continue;
            }
            write!(upstream, "{name}: {value}\r\n")?;
        }
        write!(upstream, "\r\n")?;
        upstream.flush()?;

        let (status, leftover) = read_response_head(&mut upstream)?;
        if status != 200 {
            debug!(status, "upstream refused subscription");
            return write_json_error(
                &mut downstream,
                502,
                serde_json::json!({"error": "Bad Gateway", "status": status}),
            );
        }

        // Hijack the downstream response and start the pump.
        downstream.write_all(frame::response_preamble(&origin).as_bytes())?;
        downstream.flush()?;
        info!(client_id = req.query(crate::handler::CLIENT_ID_PARAM).unwrap_or("-"), "proxying subscription");

        // Downstream is unidirectional at this layer: discard whatever the
        // client sends, and kill the upstream when the client goes away.
        let upstream_clone = upstream.try_clone()?;
        let downstream_clone = downstream.try_clone()?;
        may::go!(move || {
            let mut downstream = downstream_clone;
            let mut buf = [0u8; 512];
            loop {
                match downstream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = upstream_clone.shutdown(std::net::Shutdown::Both);
        });

        if !leftover.is_empty() {
            downstream.write_all(&leftover)?;
            downstream.flush()?;
        }
        let mut buf = [0u8; 4096];
        loop {
            let n = match upstream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if downstream.write_all(&buf[..n]).and_then(|_| downstream.flush()).is_err() {
                break;
            }
        }
        // End of either side cancels the other.
        let _ = upstream.shutdown(std::net::Shutdown::Both);
        let _ = downstream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    fn forward_post(&self, req: HttpRequest, mut downstream: TcpStream) -> io::Result<()> {
        let forwarder = self
            .forwarder
            .get_or_init(|| PostForwarder::new(self.upstream.clone()));
        let response = forwarder.forward(&req)?;
        downstream.write_all(&response)?;
        downstream.flush()
    }
}

impl Service for SseProxy {
    fn call(&self, req: HttpRequest, mut stream: TcpStream) -> io::Result<()> {
        if req.path != self.proxy_path {
            return write_json_error(
                &mut stream,
                404,
                serde_json::json!({"error": "Not Found", "path": req.path}),
            );
        }
        if req.method == Method::GET && req.wants_event_stream() {
            self.pump_subscription(req, stream)
        } else if req.method == Method::POST && !req.wants_event_stream() {
            self.forward_post(req, stream)
        } else {
            write_json_error(
                &mut stream,
                404,
                serde_json::json!({"error": "Not Found", "method": req.method.as_str()}),
            )
        }
    }
}

/// Reverse-proxy forwarder for the transport's POSTs.
struct PostForwarder {
    upstream: Upstream,
}

impl PostForwarder {
    fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }

    /// Forward the request verbatim and return the raw upstream response.
    fn forward(&self, req: &HttpRequest) -> io::Result<Vec<u8>> {
        let mut upstream = self.upstream.connect()?;
        write!(upstream, "POST {} HTTP/1.1\r\n", self.upstream.target_for(req))?;
        write!(upstream, "Host: {}\r\n", self.upstream.authority)?;
        for (name, value) in &req.headers {
            if name == "host" || name == "connection" || name == "content-length" {
                continue;
            }
            write!(upstream, "{name}: {value}\r\n")?;
        }
        write!(upstream, "Content-Length: {}\r\nConnection: close\r\n\r\n", req.body.len())?;
        upstream.write_all(&req.body)?;
        upstream.flush()?;

        let mut response = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            let n = upstream.read(&mut tmp)?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&tmp[..n]);
        }
        Ok(response)
    }
}

fn read_response_head(stream: &mut TcpStream) -> io::Result<(u16, Vec<u8>)> {
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
                "upstream closed before response head",
            ));
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let status = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed upstream response"))?;
    Ok((status, buf[head_end..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_target_preserves_query() {
        let upstream = Upstream::parse("http://127.0.0.1:9000/sse").unwrap();
        let raw = b"GET /proxy?sseClientId=abc&messageId=2 HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let req = crate::server::parse_request(&mut cursor).unwrap();
        assert_eq!(
            upstream.target_for(&req),
            "/sse?sseClientId=abc&messageId=2"
        );
    }
}
