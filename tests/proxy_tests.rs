mod common;

use brrtchannel::{ClientConfig, HandlerConfig, HttpServer, SseClient, SseProxy};
use common::{drain, recv_msg, start_handler};
use std::time::Duration;

fn start_proxy(upstream_url: &str) -> (brrtchannel::ServerHandle, String) {
    let proxy = SseProxy::new("/proxy", upstream_url).unwrap();
    let server = HttpServer(proxy).start("127.0.0.1:0").unwrap();
    server.wait_ready().unwrap();
    let url = format!("http://{}/proxy", server.addr());
    (server, url)
}

#[test]
fn test_round_trip_through_proxy() {
    let (handler, connections, _upstream, upstream_url) =
        start_handler(HandlerConfig::new("/sse").keep_alive(Duration::from_secs(5)));
    let (_proxy_server, proxy_url) = start_proxy(&upstream_url);

    let client = SseClient::new(ClientConfig::new(&proxy_url)).unwrap();
    let connection = connections.next_connection().unwrap();
    assert_eq!(connection.id(), client.client_id());
    assert_eq!(handler.number_of_clients(), 1);

    connection.sink().send("downstream");
    assert_eq!(recv_msg(&client), "downstream");

    client.send("upstream");
    assert_eq!(connection.stream().recv(), Some("upstream".to_string()));
}

#[test]
fn test_ordered_posts_through_proxy() {
    let (_handler, connections, _upstream, upstream_url) =
        start_handler(HandlerConfig::new("/sse"));
    let (_proxy_server, proxy_url) = start_proxy(&upstream_url);

    let client = SseClient::new(ClientConfig::new(&proxy_url).ordered()).unwrap();
    let connection = connections.next_connection().unwrap();
    for i in 0..5 {
        client.send(format!("msg-{i}"));
    }
    let received: Vec<String> = (0..5)
        .map(|_| connection.stream().recv().unwrap())
        .collect();
    let expected: Vec<String> = (0..5).map(|i| format!("msg-{i}")).collect();
    assert_eq!(received, expected);
}

#[test]
fn test_control_close_passes_through_proxy() {
    let (handler, connections, _upstream, upstream_url) =
        start_handler(HandlerConfig::new("/sse").keep_alive(Duration::from_secs(5)));
    let (_proxy_server, proxy_url) = start_proxy(&upstream_url);

    let client = SseClient::new(ClientConfig::new(&proxy_url)).unwrap();
    let connection = connections.next_connection().unwrap();

    connection.sink().close();
    drain("client closed via proxied control frame", || {
        client.is_closed()
    });
    drain("deregistered", || handler.number_of_clients() == 0);
}

#[test]
fn test_proxy_rejects_other_paths() {
    let (_handler, _connections, _upstream, upstream_url) =
        start_handler(HandlerConfig::new("/sse"));
    let (proxy_server, _proxy_url) = start_proxy(&upstream_url);

    use std::io::{Read, Write};
    let mut stream = std::net::TcpStream::connect(proxy_server.addr()).unwrap();
    stream
        .write_all(b"GET /elsewhere HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n")
        .unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 404"));
}
