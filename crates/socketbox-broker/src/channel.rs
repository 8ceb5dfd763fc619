// Transport-facing side of a connection: a cheap handle the broker can
// clone into subscription entries and cluster maps.
use tokio::sync::mpsc;

/// Outbound unit queued on a channel's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    /// Ask the writer task to close the socket after draining.
    Close,
}

/// Handle to one open WebSocket. The transport owns the socket and its
/// writer task; everything above it only ever enqueues frames here.
///
/// The numeric id doubles as the channel hash: it identifies the
/// connection in subscription keys, the session header, and the cluster
/// channel maps.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    sender: mpsc::UnboundedSender<ChannelFrame>,
}

impl Channel {
    pub fn new(id: u64, sender: mpsc::UnboundedSender<ChannelFrame>) -> Self {
        Self { id, sender }
    }

    /// Create a channel plus the receiving half, for transports and tests.
    pub fn pair(id: u64) -> (Self, mpsc::UnboundedReceiver<ChannelFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(id, sender), receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue a text frame. Delivery is best-effort: a closed channel is
    /// cleaned up by its reader task, not by senders.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.sender.send(ChannelFrame::Text(text.into()));
    }

    /// Ask the transport to close the socket.
    pub fn close(&self) {
        let _ = self.sender.send(ChannelFrame::Close);
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
