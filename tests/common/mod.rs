#![allow(dead_code)]

use brrtchannel::{
    ClientError, Connections, HandlerConfig, HttpServer, ServerHandle, SseClient, SseHandler,
};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

/// Ensures runtime and tracing setup happens only once per test binary.
static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        may::config().set_stack_size(0x8000);
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Start a handler on a loopback port. Returns the shared handler, the
/// connections stream, the server handle, and the endpoint URL.
pub fn start_handler(
    config: HandlerConfig,
) -> (Arc<SseHandler>, Connections, ServerHandle, String) {
    setup();
    let path = config.path.clone();
    let handler = Arc::new(SseHandler::new(config));
    let connections = handler.connections();
    let server = HttpServer(handler.clone()).start("127.0.0.1:0").unwrap();
    server.wait_ready().unwrap();
    let url = format!("http://{}{}", server.addr(), path);
    (handler, connections, server, url)
}

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_until(what: &str, timeout: Duration, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !pred() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Short wait window for state that settles after a few scheduler passes.
pub fn drain(what: &str, pred: impl Fn() -> bool) {
    wait_until(what, Duration::from_secs(2), pred);
}

/// Next inbound item on the client, or `None` if nothing arrives in time.
pub fn next_item(
    client: &SseClient,
    timeout: Duration,
) -> Option<Result<String, ClientError>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(item) = client.try_recv() {
            return Some(item);
        }
        if Instant::now() > deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Next inbound message, panicking on timeout or transport error.
pub fn recv_msg(client: &SseClient) -> String {
    next_item(client, Duration::from_secs(5))
        .expect("timed out waiting for a message")
        .expect("unexpected transport error")
}
