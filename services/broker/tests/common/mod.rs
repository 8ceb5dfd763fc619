// Test utilities: spawn a broker service on an ephemeral port and drive
// it with a real WebSocket STOMP client.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use socketbox_broker::{Broker, BrokerConfig};
use socketbox_frame::{Command, Message, Parsed};
use socketbox_server::server::{serve, ServerState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a standalone (non-clustered) broker service on an ephemeral port.
pub async fn spawn_broker(config: BrokerConfig) -> (Arc<Broker>, SocketAddr) {
    let broker = Arc::new(Broker::new(config).expect("broker"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(ServerState {
        broker: Arc::clone(&broker),
        cluster: None,
    });
    tokio::spawn(async move {
        let _ = serve(listener, state).await;
    });
    (broker, addr)
}

pub async fn connect_client(addr: SocketAddr) -> WsClient {
    let (client, _response) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("connect");
    client
}

pub async fn send_frame(client: &mut WsClient, message: &Message) {
    let text = String::from_utf8(message.to_bytes().to_vec()).expect("utf8 frame");
    client.send(WsMessage::Text(text)).await.expect("send");
}

/// Next STOMP frame from the server, skipping heart-beats.
pub async fn recv_frame(client: &mut WsClient) -> Message {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");
        match frame {
            WsMessage::Text(text) => match socketbox_frame::parse(text.as_bytes()).expect("parse") {
                Parsed::Frame(message) => return message,
                Parsed::HeartBeat => continue,
            },
            WsMessage::Binary(data) => match socketbox_frame::parse(&data).expect("parse") {
                Parsed::Frame(message) => return message,
                Parsed::HeartBeat => continue,
            },
            _ => continue,
        }
    }
}

/// CONNECT and wait for the CONNECTED reply.
pub async fn stomp_connect(client: &mut WsClient) -> Message {
    send_frame(client, &Message::new(Command::Connect)).await;
    let connected = recv_frame(client).await;
    assert_eq!(connected.command, Command::Connected);
    connected
}

/// SUBSCRIBE with a receipt so the caller knows the broker registered the
/// subscription before anything is published.
pub async fn stomp_subscribe(client: &mut WsClient, destination: &str, id: &str) {
    send_frame(
        client,
        &Message::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("receipt", format!("sub-{id}")),
    )
    .await;
    let receipt = recv_frame(client).await;
    assert_eq!(receipt.command, Command::Receipt);
}

pub async fn stomp_send(client: &mut WsClient, destination: &str, body: &str) {
    send_frame(
        client,
        &Message::new(Command::Send)
            .with_header("destination", destination)
            .with_body(body.to_string()),
    )
    .await;
}

pub fn parse_yaml(yaml: &str) -> BrokerConfig {
    serde_yaml::from_str(yaml).expect("config yaml")
}

/// Assert that nothing more arrives on the socket within the grace window.
pub async fn assert_no_frame(client: &mut WsClient, window: Duration) {
    let outcome = tokio::time::timeout(window, client.next()).await;
    if let Ok(Some(Ok(WsMessage::Text(text)))) = outcome {
        panic!("unexpected frame: {text}");
    }
}
