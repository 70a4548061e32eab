use super::request::{parse_request, HttpRequest};
use may::coroutine::JoinHandle;
use may::net::{TcpListener, TcpStream};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// A request handler that may hijack the underlying stream.
///
/// The server parses one request per accepted connection and hands the parsed
/// request plus the raw stream to the service. For short exchanges the service
/// writes a response and lets the stream drop; for an SSE subscription it
/// moves the stream into the connection and keeps writing frames indefinitely.
pub trait Service: Send + Sync + 'static {
    fn call(&self, req: HttpRequest, stream: TcpStream) -> io::Result<()>;
}

impl<T: Service + ?Sized> Service for Arc<T> {
    fn call(&self, req: HttpRequest, stream: TcpStream) -> io::Result<()> {
        (**self).call(req, stream)
    }
}

/// Minimal HTTP/1.1 server dispatching accepted connections to a [`Service`].
///
/// One coroutine accepts; each connection is parsed and served on its own
/// coroutine, so a hijacked SSE stream never blocks the accept loop.
pub struct HttpServer<T>(pub T);

/// Handle to a running HTTP server
///
/// Provides methods for waiting until the server is ready, stopping it
/// gracefully, or joining the server coroutine.
pub struct ServerHandle {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to; useful after binding port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if std::net::TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    pub fn stop(self) {
        unsafe {
            self.handle.coroutine().cancel();
        }
        let _ = self.handle.join();
    }

    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}

impl<T: Service> HttpServer<T> {
    /// Start the HTTP server on the given address
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to bind to (e.g., `"0.0.0.0:8080"` or `"127.0.0.1:0"`)
    ///
    /// # Returns
    ///
    /// A `ServerHandle` for managing the running server
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the port cannot be bound.
    pub fn start<A: ToSocketAddrs>(self, addr: A) -> io::Result<ServerHandle> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let service = Arc::new(self.0);
        let handle = may::go!(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let service = service.clone();
                        may::go!(move || serve_connection(service, stream));
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(ServerHandle { addr, handle })
    }
}

fn serve_connection<T: Service>(service: Arc<T>, mut stream: TcpStream) {
    match parse_request(&mut stream) {
        Ok(req) => {
            let method = req.method.clone();
            let path = req.path.clone();
            if let Err(e) = service.call(req, stream) {
                debug!(method = %method, path = %path, error = %e, "request handling failed");
            }
        }
        Err(e) => {
            debug!(error = %e, "failed to parse request");
        }
    }
}
