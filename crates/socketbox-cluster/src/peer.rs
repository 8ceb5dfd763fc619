// One outbound WebSocket link to a remote node.
use crate::{ClusterError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upgrade header carrying the shared cluster secret. Compared
/// case-sensitively on the accepting side.
pub const MANAGEMENT_HEADER: &str = "socketbox-management";
/// Upgrade header carrying the sender's advertised URL.
pub const MANAGEMENT_NAME_HEADER: &str = "socketbox-management-name";

// WebSockets allow a single in-flight write, so every sender goes through
// the link mutex; acquisition is bounded so one wedged link cannot pin a
// broker worker forever.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
pub type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Write half of a peer connection. The read half is returned separately
/// at connect time; the cluster manager owns its reader task.
pub struct PeerLink {
    peer_name: String,
    writer: Mutex<WsSink>,
    open: AtomicBool,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_name", &self.peer_name)
            .field("open", &self.is_connection_open())
            .finish()
    }
}

impl PeerLink {
    /// Dial `peer_name` (a WebSocket URL) with the management headers set,
    /// bounded by `connect_timeout`. Returns the link plus the raw read
    /// half for the caller's reader task.
    pub async fn connect(
        peer_name: &str,
        self_name: &str,
        secret_key: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, WsSource)> {
        let mut request = peer_name
            .into_client_request()
            .map_err(|err| ClusterError::Transport(format!("peer url {peer_name}: {err}")))?;
        request.headers_mut().insert(
            MANAGEMENT_HEADER,
            HeaderValue::from_str(secret_key)
                .map_err(|err| ClusterError::Transport(format!("secret header: {err}")))?,
        );
        request.headers_mut().insert(
            MANAGEMENT_NAME_HEADER,
            HeaderValue::from_str(self_name)
                .map_err(|err| ClusterError::Transport(format!("name header: {err}")))?,
        );

        let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| ClusterError::Transport(format!("connect to {peer_name} timed out")))?
            .map_err(|err| ClusterError::Transport(format!("connect to {peer_name}: {err}")))?;

        let (sink, source) = stream.split();
        Ok((
            Self {
                peer_name: peer_name.to_string(),
                writer: Mutex::new(sink),
                open: AtomicBool::new(true),
            },
            source,
        ))
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn is_connection_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the link dead without a write; used by the reader task when the
    /// socket is already gone.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_connection_open() {
            return Err(ClusterError::Transport(format!(
                "link to {} is closed",
                self.peer_name
            )));
        }
        let mut writer = tokio::time::timeout(WRITE_LOCK_TIMEOUT, self.writer.lock())
            .await
            .map_err(|_| {
                ClusterError::Transport(format!("write lock on {} timed out", self.peer_name))
            })?;
        writer
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| {
                self.mark_closed();
                ClusterError::Transport(format!("send to {}: {err}", self.peer_name))
            })
    }

    /// Close the socket; individual failures are swallowed since the link
    /// is being abandoned either way.
    pub async fn close(&self) {
        self.mark_closed();
        if let Ok(mut writer) =
            tokio::time::timeout(Duration::from_secs(1), self.writer.lock()).await
        {
            let _ = writer.send(WsMessage::Close(None)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_unreachable_peer_fails_within_deadline() {
        // Reserved TEST-NET address: nothing listens there.
        let started = std::time::Instant::now();
        let result = PeerLink::connect(
            "ws://192.0.2.1:9/",
            "ws://localhost:0/",
            "secret",
            Duration::from_millis(200),
        )
        .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let result = PeerLink::connect(
            "not a url",
            "ws://localhost:0/",
            "secret",
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(ClusterError::Transport(_))));
    }
}
