// WebSocket hosting: accept, upgrade, classify, then pump frames between
// the socket and the broker or cluster manager.
use anyhow::{Context, Result};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use socketbox_broker::{Broker, BrokerError, Channel, ChannelFrame};
use socketbox_cluster::{ChannelClass, ClusterManager, MANAGEMENT_HEADER, MANAGEMENT_NAME_HEADER};
use socketbox_frame::Parsed;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// Everything a connection handler needs, shared across the accept loop.
pub struct ServerState {
    pub broker: Arc<Broker>,
    pub cluster: Option<Arc<ClusterManager>>,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Accept loop: one spawned handler per connection.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    loop {
        let (stream, remote) = listener.accept().await.context("accept connection")?;
        let state = Arc::clone(&state);
        let channel_id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            tracing::debug!(channel = channel_id, remote = %remote, "connection opened");
            if let Err(err) = handle_socket(stream, channel_id, &state).await {
                tracing::debug!(channel = channel_id, error = %err, "connection ended");
            }
        });
    }
}

async fn handle_socket(stream: TcpStream, channel_id: u64, state: &ServerState) -> Result<()> {
    let _ = stream.set_nodelay(true);

    // The management headers are only visible during the upgrade, so they
    // are captured in the handshake callback and classified right after.
    let mut secret: Option<String> = None;
    let mut peer_name: Option<String> = None;
    let websocket = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        secret = header_value(request, MANAGEMENT_HEADER);
        peer_name = header_value(request, MANAGEMENT_NAME_HEADER);
        Ok::<Response, ErrorResponse>(response)
    })
    .await
    .context("websocket upgrade")?;

    let (mut sink, mut source) = websocket.split();
    let (channel, mut outbound) = Channel::pair(channel_id);

    // Classified exactly once per connection.
    let class = match &state.cluster {
        Some(cluster) => {
            cluster.classify_channel(&channel, secret.as_deref(), peer_name.as_deref())
        }
        None => ChannelClass::Client,
    };
    tracing::debug!(channel = channel_id, ?class, "connection classified");

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                ChannelFrame::Text(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                ChannelFrame::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    match class {
        ChannelClass::Client => client_read_loop(&mut source, &channel, &state.broker).await,
        ChannelClass::Management => {
            let cluster = state
                .cluster
                .as_ref()
                .expect("management class implies a cluster manager");
            management_read_loop(&mut source, cluster).await;
        }
        ChannelClass::SelfLink => {
            // Our own advertised URL looped back: drain and ignore so the
            // node never reacts to its own traffic.
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }

    // Cleanup must run before waiting on the writer: it drops the channel
    // clones held in the subscription table and the cluster maps, which is
    // what lets the writer's queue drain to completion.
    state.broker.channel_closed(channel_id);
    if let Some(cluster) = &state.cluster {
        cluster.channel_closed(channel_id);
    }
    drop(channel);
    let _ = writer.await;
    Ok(())
}

async fn client_read_loop(
    source: &mut SplitStream<WebSocketStream<TcpStream>>,
    channel: &Channel,
    broker: &Arc<Broker>,
) {
    while let Some(frame) = source.next().await {
        let payload = match frame {
            Ok(WsMessage::Text(text)) => text.into_bytes(),
            Ok(WsMessage::Binary(data)) => data,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match socketbox_frame::parse(&payload) {
            Ok(Parsed::Frame(message)) => broker.dispatch(channel, message).await,
            Ok(Parsed::HeartBeat) => channel.send_text("\n"),
            Err(err) => {
                broker.reject(channel, &BrokerError::from(err), None).await;
                break;
            }
        }
    }
}

async fn management_read_loop(
    source: &mut SplitStream<WebSocketStream<TcpStream>>,
    cluster: &Arc<ClusterManager>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => cluster.handle_management_text(&text).await,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
