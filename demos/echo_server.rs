use brrtchannel::{HandlerConfig, HttpServer, SseHandler};
use std::io;
use std::sync::Arc;
use std::time::Duration;

fn main() -> io::Result<()> {
    tracing_subscriber::fmt::init();
    may::config().set_stack_size(brrtchannel::runtime_config::RuntimeConfig::from_env().stack_size);

    let handler = Arc::new(SseHandler::new(
        HandlerConfig::new("/sse").keep_alive(Duration::from_secs(30)),
    ));
    let connections = handler.connections();

    let server = HttpServer(handler).start("0.0.0.0:8080")?;
    server.wait_ready()?;
    println!("echo server listening on 0.0.0.0:8080 (endpoint /sse)");

    for connection in connections {
        may::go!(move || {
            for msg in connection.stream().iter() {
                connection.sink().send(msg);
            }
        });
    }
    server.join().map_err(|e| io::Error::other(format!("server error: {e:?}")))
}
