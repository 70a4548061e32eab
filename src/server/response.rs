use serde_json::Value;
use std::io::{self, Write};

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "OK",
    }
}

/// Write an empty-bodied response carrying the CORS headers the transport
/// requires on every POST reply.
pub fn write_empty(w: &mut impl Write, status: u16, origin: &str) -> io::Result<()> {
    write!(
        w,
        "HTTP/1.1 {} {}\r\n\
         Access-Control-Allow-Credentials: true\r\n\
         Access-Control-Allow-Origin: {}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        status_reason(status),
        origin
    )?;
    w.flush()
}

/// Write a JSON error body with `Connection: close`.
pub fn write_json_error(w: &mut impl Write, status: u16, body: Value) -> io::Result<()> {
    let body = body.to_string();
    write!(
        w,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        status,
        status_reason(status),
        body.len(),
        body
    )?;
    w.flush()
}
