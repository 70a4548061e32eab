use http::Method;
use std::collections::HashMap;
use std::io::{self, Read};

/// Maximum accepted request head size (request line plus headers).
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Parsed HTTP request data handed to a [`Service`](super::Service).
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    /// Path component of the request target, without the query string.
    pub path: String,
    /// Raw request target as it appeared on the request line.
    pub target: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    /// Raw query string of the request target, if any.
    pub fn raw_query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Value to echo into `Access-Control-Allow-Origin`: the request's
    /// `Origin` if present, falling back to `Host` for clients that omit it.
    pub fn cors_origin(&self) -> &str {
        self.header("origin")
            .or_else(|| self.header("host"))
            .unwrap_or("*")
    }

    /// True when the request asks for a `text/event-stream` response.
    pub fn wants_event_stream(&self) -> bool {
        self.header("accept")
            .map(|a| a.contains("text/event-stream"))
            .unwrap_or(false)
    }
}

pub fn parse_query_params(target: &str) -> HashMap<String, String> {
    if let Some(pos) = target.find('?') {
        let query_str = &target[pos + 1..];
        url::form_urlencoded::parse(query_str.as_bytes())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    } else {
        HashMap::new()
    }
}

/// Read and parse one HTTP/1.1 request from `stream`.
///
/// Reads the head up to the blank line, then exactly `Content-Length` body
/// bytes when the header is present. Anything else is left unread.
pub fn parse_request<R: Read>(stream: &mut R) -> io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method: Method = parts
        .next()
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid method"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request target"))?
        .to_string();
    let path = target.split('?').next().unwrap_or("/").to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(n, v)| (n.to_ascii_lowercase(), v.trim().to_string()))
        })
        .collect();
    let query_params = parse_query_params(&target);

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        target,
        headers,
        query_params,
        body,
    })
}
