// Broker core: connection registry, STOMP command dispatch, and the
// routing entry points the exchange graph re-enters.
use crate::auth::{Access, AllowAll, AuthHandler};
use crate::channel::Channel;
use crate::config::{BrokerConfig, ExchangeConfig};
use crate::destination::ParsedDestination;
use crate::exchange::Exchange;
use crate::subscription::{
    channel_sub_key, AckMode, InternalCallback, Subscriber, SubscriptionTable,
};
use crate::{BrokerError, Result};
use dashmap::DashMap;
use serde::Serialize;
use socketbox_frame::{Command, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

/// Upper bound on exchange re-entries for one routed message. A
/// misconfigured graph (topic -> topic loops and similar) hits this and
/// the message is dropped with an error event.
pub const HOP_LIMIT: u32 = 32;

// Grace period after an ERROR frame so the client can drain it before the
// transport goes away, per the STOMP spec.
const ERROR_DRAIN: Duration = Duration::from_secs(1);

const SERVER_HEADER: &str = concat!("socketbox/", env!("CARGO_PKG_VERSION"));

/// What the broker needs from the cluster layer: wrap an outgoing SEND in
/// a rebroadcast envelope and replay it over every peer link. Implemented
/// by the cluster manager; absent on single-node deployments.
pub trait PeerFanout: Send + Sync {
    fn rebroadcast_send(&self, destination: &str, message: &Message);
}

/// One authenticated STOMP connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub channel: Channel,
    pub login: Option<String>,
    pub connect_date: SystemTime,
    pub metadata: HashMap<String, String>,
}

impl Connection {
    /// The session id is the channel id for the connection's whole life.
    pub fn session_id(&self) -> u64 {
        self.channel.id()
    }
}

/// Snapshot of a connection, served over the cluster RPC built-in.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    #[serde(rename = "sessionID")]
    pub session_id: u64,
    pub login: Option<String>,
    #[serde(rename = "connectedSeconds")]
    pub connected_seconds: u64,
}

pub struct Broker {
    config: RwLock<BrokerConfig>,
    // Arc per exchange so routing never holds the registry lock across a
    // re-entry.
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
    subscriptions: SubscriptionTable,
    connections: DashMap<u64, Connection>,
    auth: Arc<dyn AuthHandler>,
    peer_fanout: RwLock<Option<Arc<dyn PeerFanout>>>,
    internal_counter: AtomicU64,
}

impl Broker {
    /// Build a broker from configuration. Fails without side effects when
    /// an exchange block is invalid, so a process never runs with a
    /// half-built graph.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let exchanges = build_exchanges(&config)?;
        Ok(Self {
            config: RwLock::new(config),
            exchanges: RwLock::new(exchanges),
            subscriptions: SubscriptionTable::new(),
            connections: DashMap::new(),
            auth: Arc::new(AllowAll),
            peer_fanout: RwLock::new(None),
            internal_counter: AtomicU64::new(0),
        })
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthHandler>) -> Self {
        self.auth = auth;
        self
    }

    /// Wire in the cluster fan-out. Called once at service startup when
    /// clustering is enabled.
    pub fn set_peer_fanout(&self, fanout: Arc<dyn PeerFanout>) {
        *self.peer_fanout.write().expect("fanout lock") = Some(fanout);
    }

    pub fn config(&self) -> BrokerConfig {
        self.config.read().expect("config lock").clone()
    }

    pub fn cluster_enabled(&self) -> bool {
        self.config.read().expect("config lock").cluster.enable
    }

    /// Swap in a new configuration, preserving connections and channel
    /// subscriptions. Internal subscriptions are cleared and must be
    /// re-registered by the application against the new graph. On error
    /// the previous graph stays in place.
    pub fn reconfigure(&self, new_config: BrokerConfig) -> Result<()> {
        let exchanges = build_exchanges(&new_config)?;
        *self.exchanges.write().expect("exchange lock") = exchanges;
        *self.config.write().expect("config lock") = new_config;
        self.subscriptions.remove_all_internal();
        tracing::info!("broker reconfigured");
        Ok(())
    }

    /// Register a server-side subscription. Returns the table key
    /// (`internal-<n>`), usable with `unsubscribe_internal`.
    pub fn subscribe_internal(&self, destination: &str, callback: InternalCallback) -> String {
        let key = format!(
            "internal-{}",
            self.internal_counter.fetch_add(1, Ordering::Relaxed)
        );
        let parsed = ParsedDestination::parse(destination);
        self.subscriptions
            .add(&parsed.tail, key.clone(), Subscriber::Internal { callback });
        key
    }

    pub fn unsubscribe_internal(&self, key: &str) {
        self.subscriptions.remove_everywhere(key);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Connection snapshots for the `getSTOMPCConnections` RPC built-in.
    pub fn connection_summaries(&self) -> Vec<ConnectionSummary> {
        self.connections
            .iter()
            .map(|entry| ConnectionSummary {
                session_id: entry.session_id(),
                login: entry.login.clone(),
                connected_seconds: entry
                    .connect_date
                    .elapsed()
                    .map(|elapsed| elapsed.as_secs())
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Entry point for one inbound frame from a client channel. Auth and
    /// authorization failures bubble up from the handlers and are turned
    /// into one ERROR-then-close flow here.
    pub async fn dispatch(&self, channel: &Channel, message: Message) {
        let receipt = message.header("receipt").map(str::to_string);
        let outcome = match message.command {
            Command::Connect | Command::Stomp => self.handle_connect(channel, message).await,
            Command::Send => self.handle_send(channel, message).await,
            Command::Subscribe => self.handle_subscribe(channel, message).await,
            Command::Unsubscribe => {
                self.handle_unsubscribe(channel, &message).await;
                Ok(())
            }
            Command::Disconnect => {
                self.handle_disconnect(channel, &message);
                Ok(())
            }
            Command::Ack
            | Command::Nack
            | Command::Begin
            | Command::Commit
            | Command::Abort => {
                // Recognized but transaction-free: acknowledged only.
                self.send_receipt(channel, &message);
                Ok(())
            }
            other => {
                self.send_error(
                    channel,
                    "unexpected frame",
                    receipt.as_deref(),
                    &format!("server-only command {other} received from client"),
                )
                .await;
                Ok(())
            }
        };
        if let Err(err) = outcome {
            self.reject(channel, &err, receipt.as_deref()).await;
        }
    }

    /// Surface a broker error to the client: ERROR frame with the short
    /// summary as the `message` header and the full rendering as the body,
    /// then the STOMP drain-and-close flow.
    pub async fn reject(&self, channel: &Channel, error: &BrokerError, receipt_id: Option<&str>) {
        metrics::counter!("broker_rejections_total", "kind" => error.summary()).increment(1);
        self.send_error(channel, error.summary(), receipt_id, &error.to_string())
            .await;
    }

    /// The transport observed the socket close; drop all per-channel state.
    pub fn channel_closed(&self, channel_id: u64) {
        let removed = self.subscriptions.remove_by_channel(channel_id);
        if self.connections.remove(&channel_id).is_some() || removed > 0 {
            tracing::debug!(channel = channel_id, removed, "channel cleaned up");
        }
    }

    async fn handle_connect(&self, channel: &Channel, message: Message) -> Result<()> {
        let login = message.header("login").map(str::to_string);
        let passcode = message.header("passcode").map(str::to_string);
        let host = message.header("host").map(str::to_string);
        let mut metadata = HashMap::new();

        let authenticated = self
            .auth
            .authenticate(
                login.as_deref(),
                passcode.as_deref(),
                host.as_deref(),
                channel,
                &mut metadata,
            )
            .await;
        if !authenticated {
            return Err(BrokerError::AuthenticationFailure);
        }

        let connection = Connection {
            channel: channel.clone(),
            login,
            connect_date: SystemTime::now(),
            metadata: metadata.clone(),
        };
        self.connections.insert(channel.id(), connection);

        let (heart_beat_ms, cluster_name) = {
            let config = self.config.read().expect("config lock");
            (config.heart_beat_ms, config.cluster.name.clone())
        };
        let mut reply = Message::new(Command::Connected)
            .with_header("version", "1.2")
            .with_header("heart-beat", format!("{heart_beat_ms},{heart_beat_ms}"))
            .with_header("server", SERVER_HEADER)
            .with_header("session", channel.id().to_string())
            .with_header("host", cluster_name.unwrap_or_else(|| "<unknown>".into()));
        for (key, value) in metadata {
            reply.set_header(format!("connectionMetadata-{key}"), value);
        }
        self.send_frame(channel, &reply);
        tracing::debug!(session = channel.id(), "client connected");
        Ok(())
    }

    async fn handle_send(&self, channel: &Channel, mut message: Message) -> Result<()> {
        let Some(destination) = message.header("destination").map(str::to_string) else {
            self.send_error(
                channel,
                "missing destination",
                message.header("receipt"),
                "SEND requires a destination header",
            )
            .await;
            return Ok(());
        };
        let parsed = ParsedDestination::parse(&destination);
        let login = self.login_of(channel);
        let authorized = self
            .auth
            .authorize(
                login.as_deref(),
                &parsed.exchange,
                &parsed.tail,
                Access::Write,
                channel,
            )
            .await;
        if !authorized {
            return Err(BrokerError::AuthorizationFailure {
                access: Access::Write.as_str().to_string(),
                destination,
            });
        }

        message.set_header("publisher-id", channel.id().to_string());
        self.route_message(&destination, &message, true);
        self.send_receipt(channel, &message);
        Ok(())
    }

    async fn handle_subscribe(&self, channel: &Channel, message: Message) -> Result<()> {
        let (Some(id), Some(destination)) = (
            message.header("id").map(str::to_string),
            message.header("destination").map(str::to_string),
        ) else {
            self.send_error(
                channel,
                "malformed subscribe",
                message.header("receipt"),
                "SUBSCRIBE requires id and destination headers",
            )
            .await;
            return Ok(());
        };
        let parsed = ParsedDestination::parse(&destination);
        let login = self.login_of(channel);
        let authorized = self
            .auth
            .authorize(
                login.as_deref(),
                &parsed.exchange,
                &parsed.tail,
                Access::Read,
                channel,
            )
            .await;
        if !authorized {
            return Err(BrokerError::AuthorizationFailure {
                access: Access::Read.as_str().to_string(),
                destination,
            });
        }

        let ack = AckMode::from_header(message.header("ack"));
        self.subscriptions.add(
            &parsed.tail,
            channel_sub_key(channel.id(), &id),
            Subscriber::Channel {
                channel: channel.clone(),
                subscription_id: id,
                ack,
            },
        );
        self.send_receipt(channel, &message);
        Ok(())
    }

    async fn handle_unsubscribe(&self, channel: &Channel, message: &Message) {
        let Some(id) = message.header("id") else {
            self.send_error(
                channel,
                "malformed unsubscribe",
                message.header("receipt"),
                "UNSUBSCRIBE requires an id header",
            )
            .await;
            return;
        };
        // Unknown ids are a no-op; removal is idempotent.
        self.subscriptions
            .remove_everywhere(&channel_sub_key(channel.id(), id));
        self.send_receipt(channel, message);
    }

    fn handle_disconnect(&self, channel: &Channel, message: &Message) {
        self.subscriptions.remove_by_channel(channel.id());
        self.connections.remove(&channel.id());
        self.send_receipt(channel, message);
        channel.close();
        tracing::debug!(session = channel.id(), "client disconnected");
    }

    /// Route a message through the exchange graph. `rebroadcast` is true
    /// only for locally published SENDs; replays arriving from peers pass
    /// false so a message cannot storm back and forth between nodes.
    pub fn route_message(&self, destination: &str, message: &Message, rebroadcast: bool) {
        metrics::counter!("broker_route_messages_total").increment(1);
        let parsed = ParsedDestination::parse(destination);
        match self.exchange(&parsed.exchange) {
            Some(exchange) => exchange.route(self, &parsed.tail, message, 0),
            None => {
                tracing::debug!(destination = %destination, "no such exchange, message dropped");
                metrics::counter!("broker_route_drops_total", "reason" => "unknown_exchange")
                    .increment(1);
            }
        }
        // Local delivery first, then the cluster copy.
        if rebroadcast && self.cluster_enabled() {
            let fanout = self.peer_fanout.read().expect("fanout lock").clone();
            if let Some(fanout) = fanout {
                fanout.rebroadcast_send(destination, message);
            }
        }
    }

    /// Re-entry from an exchange binding. Undefined targets are dropped
    /// silently; exceeding the hop bound drops with an error event.
    pub(crate) fn reroute(&self, destination: &str, message: &Message, hops: u32) {
        if hops >= HOP_LIMIT {
            // Routing errors are swallowed by policy, so the error only
            // surfaces as an event.
            let err = BrokerError::HopLimitExceeded;
            tracing::error!(destination = %destination, hops, error = %err, "dropping message");
            metrics::counter!("broker_route_drops_total", "reason" => "hop_limit").increment(1);
            return;
        }
        let parsed = ParsedDestination::parse(destination);
        if let Some(exchange) = self.exchange(&parsed.exchange) {
            exchange.route(self, &parsed.tail, message, hops);
        } else {
            tracing::debug!(destination = %destination, "re-entry on undefined exchange dropped");
        }
    }

    /// Deliver to every live subscriber of `destination`: clients get a
    /// per-subscriber MESSAGE frame, internal handlers run synchronously
    /// with the original message.
    pub(crate) fn deliver_local(&self, destination: &str, message: &Message) {
        self.subscriptions.for_each(destination, |_, subscriber| {
            match subscriber {
                Subscriber::Channel {
                    channel,
                    subscription_id,
                    ..
                } => {
                    let mut frame = message.clone();
                    frame.command = Command::Message;
                    frame.set_header("subscription", subscription_id.clone());
                    frame.set_header("message-id", uuid::Uuid::new_v4().to_string());
                    frame.set_header("destination", destination);
                    // Credentials must never leak onto deliveries.
                    frame.remove_header("login");
                    frame.remove_header("passcode");
                    frame.remove_header("receipt");
                    self.send_frame(channel, &frame);
                }
                Subscriber::Internal { callback } => callback(message),
            }
            metrics::counter!("broker_deliveries_total").increment(1);
        });
    }

    /// Emit an ERROR frame, give the client a moment to drain it, then
    /// close the transport.
    pub async fn send_error(
        &self,
        channel: &Channel,
        summary: &str,
        receipt_id: Option<&str>,
        detail: &str,
    ) {
        let mut frame = Message::new(Command::Error)
            .with_header("message", summary)
            .with_body(detail.to_string());
        if let Some(receipt_id) = receipt_id {
            frame.set_header("receipt-id", receipt_id);
        }
        self.send_frame(channel, &frame);
        tokio::time::sleep(ERROR_DRAIN).await;
        channel.close();
        self.channel_closed(channel.id());
    }

    fn send_receipt(&self, channel: &Channel, message: &Message) {
        if let Some(receipt) = message.header("receipt") {
            let frame = Message::new(Command::Receipt).with_header("receipt-id", receipt);
            self.send_frame(channel, &frame);
        }
    }

    fn send_frame(&self, channel: &Channel, frame: &Message) {
        channel.send_text(String::from_utf8_lossy(&frame.to_bytes()).into_owned());
    }

    fn login_of(&self, channel: &Channel) -> Option<String> {
        self.connections
            .get(&channel.id())
            .and_then(|connection| connection.login.clone())
    }

    fn exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges
            .read()
            .expect("exchange lock")
            .get(&name.to_lowercase())
            .cloned()
    }
}

// Builds the full exchange table or fails without touching broker state.
// A default `direct` exchange always exists, even when omitted.
fn build_exchanges(config: &BrokerConfig) -> Result<HashMap<String, Arc<Exchange>>> {
    let mut exchanges = HashMap::with_capacity(config.exchanges.len() + 1);
    for (name, exchange_config) in &config.exchanges {
        let exchange = Exchange::from_config(name, exchange_config)?;
        if exchanges
            .insert(name.to_lowercase(), Arc::new(exchange))
            .is_some()
        {
            return Err(BrokerError::InvalidConfiguration(format!(
                "duplicate exchange name {name:?}"
            )));
        }
    }
    exchanges
        .entry(crate::destination::DEFAULT_EXCHANGE.to_string())
        .or_insert_with(|| {
            Arc::new(
                Exchange::from_config(
                    crate::destination::DEFAULT_EXCHANGE,
                    &ExchangeConfig {
                        class: "direct".into(),
                        bindings: HashMap::new(),
                        distribution_type: None,
                    },
                )
                .expect("default direct exchange"),
            )
        });
    Ok(exchanges)
}
