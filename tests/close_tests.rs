mod common;

use brrtchannel::{ClientConfig, HandlerConfig, SseClient};
use common::{drain, next_item, start_handler};
use std::time::Duration;

#[test]
fn test_server_initiated_close_deregisters() {
    let (handler, connections, _server, url) =
        start_handler(HandlerConfig::new("/sse").keep_alive(Duration::from_secs(5)));
    assert_eq!(handler.number_of_clients(), 0);

    let client = SseClient::new(ClientConfig::new(&url)).unwrap();
    let connection = connections.next_connection().unwrap();
    assert_eq!(handler.number_of_clients(), 1);

    connection.sink().close();
    drain("deregistered", || handler.number_of_clients() == 0);
    assert!(connection.is_closed());
    assert_eq!(connection.stream().try_recv(), None);
    drop(client);
}

#[test]
fn test_control_close_completes_client_stream() {
    let (handler, connections, _server, url) =
        start_handler(HandlerConfig::new("/sse").keep_alive(Duration::from_secs(5)));
    let client = SseClient::new(ClientConfig::new(&url)).unwrap();
    let connection = connections.next_connection().unwrap();

    connection.sink().close();
    // The control frame closes the client without surfacing an error.
    drain("client closed", || client.is_closed());
    assert_eq!(next_item(&client, Duration::from_millis(300)), None);
    assert_eq!(handler.number_of_clients(), 0);
}

#[test]
fn test_inbound_consumer_cancellation_closes() {
    let (handler, connections, _server, url) =
        start_handler(HandlerConfig::new("/sse").keep_alive(Duration::from_secs(5)));
    let client = SseClient::new(ClientConfig::new(&url)).unwrap();
    let connection = connections.next_connection().unwrap();
    assert_eq!(handler.number_of_clients(), 1);

    // Dropping the connection cancels its inbound consumer.
    drop(connection);
    drain("deregistered", || handler.number_of_clients() == 0);
    // The server told the client to stop reconnecting.
    drain("client closed", || client.is_closed());
}

#[test]
fn test_client_close_stops_delivery() {
    let (_handler, connections, _server, url) = start_handler(HandlerConfig::new("/sse"));
    let client = SseClient::new(ClientConfig::new(&url)).unwrap();
    let connection = connections.next_connection().unwrap();

    client.close();
    assert!(client.is_closed());
    assert_eq!(next_item(&client, Duration::from_millis(200)), None);
    // Messages submitted after close are dropped silently.
    client.send("into the void");
    assert_eq!(
        connection.stream().try_recv(),
        None,
        "no delivery after client close"
    );
}
