// Cluster manager: peer connectivity, cache-backed discovery, weak leader
// election, rebroadcast fan-out, and the RPC surface.
//
// Discovery runs on a 2 s keep-alive tick with an adaptive outer delay:
// any membership change pulls the scan cadence back down, a quiet cluster
// stretches it out. Cache writes are not atomic; list maintenance is
// read-modify-write with verify-and-retry, converging within a few ticks.
use crate::envelope::{self, Envelope, RpcRequest, RpcResponse, StompRebroadcast};
use crate::peer::{PeerLink, WsSource};
use crate::rpc::{PeerRpcOutcome, RpcCoordinator, RpcHandler};
use crate::{ClusterError, Result};
use dashmap::DashMap;
use futures_util::StreamExt;
use rand::Rng;
use serde_json::Value;
use socketbox_broker::{Broker, Channel, ClusterConfig, PeerFanout};
use socketbox_frame::{Command, Message};
use socketbox_storage::CacheProvider;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

// Base of every cluster cache key; the configured prefix goes in front.
const PEERS_KEY: &str = "socketbox-cluster-peers";

// Inner keep-alive tick. The outer scan delay is a multiple of this.
const TICK: Duration = Duration::from_secs(2);

// Retry budget for the read-modify-write peer list maintenance.
const LIST_WRITE_RETRIES: u32 = 5;

/// How an accepted socket was classified, decided exactly once per
/// connection from the upgrade headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    /// A regular STOMP client.
    Client,
    /// A management link from another node: speaks envelopes, not STOMP.
    Management,
    /// This node's own advertised URL looped back; all traffic ignored.
    SelfLink,
}

pub struct ClusterManager {
    // Back-reference handed to spawned reader tasks.
    me: Weak<Self>,
    broker: Arc<Broker>,
    // Config snapshot taken at construction; the manager never reads the
    // broker's live config, which keeps the two subsystems acyclic.
    config: ClusterConfig,
    self_name: String,
    cache: Arc<dyn CacheProvider>,
    rpc_handler: Arc<dyn RpcHandler>,
    peers: DashMap<String, Arc<PeerLink>>,
    channels: DashMap<u64, Channel>,
    management_channels: DashMap<u64, Channel>,
    self_channels: DashMap<u64, Channel>,
    rpc: RpcCoordinator,
    started: Instant,
    last_change: Mutex<Instant>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("self_name", &self.self_name)
            .finish_non_exhaustive()
    }
}

impl ClusterManager {
    /// Build a manager from the broker's cluster configuration. Fails when
    /// clustering is off or the node has no advertised name.
    pub fn new(
        broker: Arc<Broker>,
        cache: Arc<dyn CacheProvider>,
        rpc_handler: Arc<dyn RpcHandler>,
    ) -> Result<Arc<Self>> {
        let config = broker.config().cluster;
        if !config.enable {
            return Err(ClusterError::ClusterDisabled);
        }
        let self_name = config
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ClusterError::Config("cluster.name is required".into()))?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            broker,
            config,
            self_name,
            cache,
            rpc_handler,
            peers: DashMap::new(),
            channels: DashMap::new(),
            management_channels: DashMap::new(),
            self_channels: DashMap::new(),
            rpc: RpcCoordinator::new(),
            started: Instant::now(),
            last_change: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Spawn the periodic discovery loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.me.upgrade().expect("manager is alive");
        tokio::spawn(async move { manager.run_loop().await })
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::info!(name = %self.self_name, "cluster discovery loop started");
        // First scan happens on the first tick.
        let mut next_scan = Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK) => {}
            }
            // Keep-alive on every tick so peers never see us as stale.
            self.write_checkin().await;
            if Instant::now() >= next_scan {
                self.scan().await;
                next_scan = Instant::now() + self.current_delay();
            }
        }
        tracing::info!("cluster discovery loop stopped");
    }

    async fn scan(&self) {
        self.ensure_self_listed().await;
        self.reap_stale_peers().await;
        self.sync_peer_links().await;
        self.elect_manager().await;
    }

    async fn write_checkin(&self) {
        self.cache
            .set(&self.checkin_key(&self.self_name), &epoch_secs().to_string())
            .await;
    }

    /// Make sure our own name is on the shared peer list. Writes are not
    /// atomic, so write-then-verify with a jittered backoff; a clobbered
    /// write heals on a later attempt or the next scan.
    pub(crate) async fn ensure_self_listed(&self) {
        for attempt in 0..LIST_WRITE_RETRIES {
            let mut names = self.cached_peer_list().await;
            if names.iter().any(|name| name == &self.self_name) {
                return;
            }
            names.push(self.self_name.clone());
            self.cache.set(&self.peers_key(), &names.join("\n")).await;
            let verify = self.cached_peer_list().await;
            if verify.iter().any(|name| name == &self.self_name) {
                return;
            }
            tracing::warn!(attempt, "peer list write lost, retrying");
            let jitter_ms = rand::thread_rng().gen_range(0..2000);
            tokio::time::sleep(Duration::from_millis(1000 + jitter_ms)).await;
        }
        tracing::warn!("could not ensure own name in peer list");
    }

    /// Drop peers whose checkin is older than the idle timeout. Peers
    /// without any checkin yet are left alone.
    pub(crate) async fn reap_stale_peers(&self) {
        let now = epoch_secs();
        for name in self.cached_peer_list().await {
            if name == self.self_name {
                continue;
            }
            let Some(checkin) = self
                .cache
                .get(&self.checkin_key(&name))
                .await
                .and_then(|value| value.trim().parse::<u64>().ok())
            else {
                continue;
            };
            if now.saturating_sub(checkin) > self.config.peer_idle_timeout_seconds {
                tracing::info!(peer = %name, "reaping stale peer from cache");
                self.remove_peer_from_cache(&name, 1).await;
                self.cluster_updated();
            }
        }
    }

    /// Remove a peer name from the shared list and clear its checkin.
    /// Idempotent; bounded attempts because list writes can race.
    pub(crate) async fn remove_peer_from_cache(&self, name: &str, attempts: u32) {
        for _ in 0..attempts.max(1) {
            let names: Vec<String> = self
                .cached_peer_list()
                .await
                .into_iter()
                .filter(|existing| existing != name)
                .collect();
            self.cache.set(&self.peers_key(), &names.join("\n")).await;
            let verify = self.cached_peer_list().await;
            if !verify.iter().any(|existing| existing == name) {
                break;
            }
        }
        self.cache.clear(&self.checkin_key(name)).await;
    }

    /// Diff desired peers (static config union the cache list, minus self)
    /// against live links: prune dead links, drop removed peers, dial new
    /// ones.
    async fn sync_peer_links(&self) {
        let mut desired: HashSet<String> = self.config.peers.iter().cloned().collect();
        desired.extend(self.cached_peer_list().await);
        desired.remove(&self.self_name);

        let mut changed = false;
        for name in self.peer_names() {
            let closed = self
                .peers
                .get(&name)
                .map(|link| !link.is_connection_open())
                .unwrap_or(false);
            if closed {
                tracing::info!(peer = %name, "pruning dead peer link");
                self.peers.remove(&name);
                changed = true;
            } else if !desired.contains(&name) {
                tracing::info!(peer = %name, "peer no longer listed, disconnecting");
                if let Some((_, link)) = self.peers.remove(&name) {
                    link.close().await;
                }
                changed = true;
            }
        }
        for name in desired {
            if self.peers.contains_key(&name) {
                continue;
            }
            changed = true;
            if let Err(err) = self.connect_peer(&name).await {
                // Transient by definition: unresolved names, refused or
                // timed-out connects retry on the next scan.
                tracing::warn!(peer = %name, error = %err, "peer connect failed");
            }
        }
        if changed {
            self.cluster_updated();
        }
    }

    async fn connect_peer(&self, name: &str) -> Result<()> {
        let (link, source) = PeerLink::connect(
            name,
            &self.self_name,
            &self.config.secret_key,
            Duration::from_secs(self.config.peer_connection_timeout_seconds),
        )
        .await?;
        let link = Arc::new(link);
        self.peers.insert(name.to_string(), Arc::clone(&link));
        self.spawn_link_reader(name.to_string(), link, source);
        metrics::counter!("cluster_peer_connects_total").increment(1);
        tracing::info!(peer = %name, "peer link established");
        // Tell the rest of the mesh so everyone converges on the new node
        // without waiting for their own cache scans.
        self.broadcast_management_message(&envelope::wrap(envelope::PEER_DISCOVERED, name), name)
            .await;
        Ok(())
    }

    fn spawn_link_reader(&self, name: String, link: Arc<PeerLink>, mut source: WsSource) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => manager.handle_management_text(&text).await,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // The socket is already gone; just drop our side of the entry.
            link.mark_closed();
            manager.peer_link_closed(&name);
        });
    }

    fn peer_link_closed(&self, name: &str) {
        if self.peers.remove(name).is_some() {
            tracing::info!(peer = %name, "peer link closed");
            self.cluster_updated();
        }
    }

    /// Connect to a peer if we do not already hold an open link to it.
    pub async fn ensure_peer(&self, name: &str) {
        if name.is_empty() || name == self.self_name {
            return;
        }
        if let Some(link) = self.peers.get(name) {
            if link.is_connection_open() {
                return;
            }
        }
        if let Err(err) = self.connect_peer(name).await {
            tracing::warn!(peer = %name, error = %err, "ensure_peer connect failed");
        }
        self.cluster_updated();
    }

    /// Weak leader election over the shared cache: claim the manager key
    /// when it is empty or names a peer we cannot see. Eventually
    /// consistent; suitable only for non-critical single-node tasks.
    pub(crate) async fn elect_manager(&self) {
        let current = self
            .cache
            .get(&self.manager_key())
            .await
            .unwrap_or_default();
        let current = current.trim().to_string();
        let stale = !current.is_empty()
            && current != self.self_name
            && !self.peers.contains_key(&current);
        if current.is_empty() || stale {
            self.cache.set(&self.manager_key(), &self.self_name).await;
            tracing::info!("claimed cluster manager role");
        }
    }

    pub async fn is_manager(&self) -> bool {
        self.cache
            .get(&self.manager_key())
            .await
            .map(|value| value.trim() == self.self_name)
            .unwrap_or(false)
    }

    /// Record that cluster membership changed so the scan cadence resets.
    pub fn cluster_updated(&self) {
        *self.last_change.lock().expect("last change lock") = Instant::now();
    }

    fn current_delay(&self) -> Duration {
        let stable_for = self.last_change.lock().expect("last change lock").elapsed();
        delay_for(stable_for)
    }

    // --- connection classification -------------------------------------

    /// Classify an accepted socket from its upgrade headers. Called exactly
    /// once per connection; the three maps stay pairwise disjoint.
    pub fn classify_channel(
        &self,
        channel: &Channel,
        secret: Option<&str>,
        peer_name: Option<&str>,
    ) -> ChannelClass {
        let secret_ok =
            !self.config.secret_key.is_empty() && secret == Some(self.config.secret_key.as_str());
        if secret_ok {
            if peer_name == Some(self.self_name.as_str()) {
                self.self_channels.insert(channel.id(), channel.clone());
                ChannelClass::SelfLink
            } else {
                self.management_channels.insert(channel.id(), channel.clone());
                ChannelClass::Management
            }
        } else {
            self.channels.insert(channel.id(), channel.clone());
            ChannelClass::Client
        }
    }

    /// Forget a channel in whichever map holds it.
    pub fn channel_closed(&self, channel_id: u64) {
        self.channels.remove(&channel_id);
        self.management_channels.remove(&channel_id);
        self.self_channels.remove(&channel_id);
    }

    pub fn client_channel_count(&self) -> usize {
        self.channels.len()
    }

    // --- broadcast ------------------------------------------------------

    /// Send a raw management frame over every peer link except
    /// `exclude_peer`. Self-links never appear in the peer map.
    pub async fn broadcast_management_message(&self, text: &str, exclude_peer: &str) {
        let links: Vec<Arc<PeerLink>> = self
            .peers
            .iter()
            .filter(|entry| entry.key().as_str() != exclude_peer)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for link in links {
            if let Err(err) = link.send_text(text).await {
                tracing::warn!(peer = %link.peer_name(), error = %err, "management send failed");
            }
        }
    }

    /// Deliver raw text to every local client channel; with `rebroadcast`
    /// also wrap it and repeat it cluster-wide.
    pub async fn broadcast_message(&self, text: &str, rebroadcast: bool) {
        for entry in self.channels.iter() {
            entry.value().send_text(text);
        }
        if rebroadcast {
            self.broadcast_management_message(
                &envelope::wrap(envelope::MESSAGE_REBROADCAST, text),
                "",
            )
            .await;
        }
    }

    // --- management frame dispatch ---------------------------------------

    /// Demultiplex one management frame, from either an inbound management
    /// channel or an outbound link's reader.
    pub async fn handle_management_text(&self, text: &str) {
        match envelope::parse(text) {
            Some(Envelope::MessageRebroadcast(payload)) => {
                // Replays never fan back out; that is how storms are avoided.
                self.broadcast_message(payload, false).await;
            }
            Some(Envelope::StompRebroadcast(json)) => self.handle_stomp_rebroadcast(json),
            Some(Envelope::PeerDiscovered(name)) => {
                let name = name.to_string();
                self.ensure_peer(&name).await;
            }
            Some(Envelope::RpcRequest(json)) => self.handle_rpc_request(json).await,
            Some(Envelope::RpcResponse(json)) => self.handle_rpc_response(json),
            None => tracing::debug!("unrecognized management frame dropped"),
        }
    }

    fn handle_stomp_rebroadcast(&self, json: &str) {
        let payload: StompRebroadcast = match serde_json::from_str(json) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "bad stomp rebroadcast payload");
                return;
            }
        };
        let mut message = Message::new(Command::Send);
        for (name, value) in payload.headers {
            message.push_header(name, value);
        }
        message.body = payload.message_data.into();
        metrics::counter!("cluster_rebroadcasts_received_total").increment(1);
        self.broker
            .route_message(&payload.destination, &message, false);
    }

    // --- rpc --------------------------------------------------------------

    async fn handle_rpc_request(&self, json: &str) {
        let request: RpcRequest = match serde_json::from_str(json) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "bad rpc request payload");
                return;
            }
        };
        metrics::counter!("rpc_requests_total").increment(1);
        let (result, success, error) =
            match self.execute_rpc(&request.operation, &request.args).await {
                Ok(result) => (result, true, None),
                Err(error) => (Value::Null, false, Some(error)),
            };
        self.send_rpc_response(&request.id, &request.peer_name, result, success, error)
            .await;
    }

    async fn execute_rpc(
        &self,
        operation: &str,
        args: &Value,
    ) -> std::result::Result<Value, String> {
        match operation {
            "uptime" => Ok(Value::from(self.started.elapsed().as_secs())),
            "getSTOMPCConnections" => serde_json::to_value(self.broker.connection_summaries())
                .map_err(|err| err.to_string()),
            _ => self.rpc_handler.handle(operation, args).await,
        }
    }

    /// Send one response for a handled request, addressed by peer name.
    pub async fn send_rpc_response(
        &self,
        id: &str,
        peer_name: &str,
        result: Value,
        success: bool,
        error: Option<String>,
    ) {
        let response = RpcResponse {
            id: id.to_string(),
            result,
            success,
            error,
            execution_time_ms: None,
        };
        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "could not encode rpc response");
                return;
            }
        };
        let link = self.peers.get(peer_name).map(|entry| Arc::clone(entry.value()));
        match link {
            Some(link) => {
                if let Err(err) = link
                    .send_text(envelope::wrap(envelope::RPC_RESPONSE, &json))
                    .await
                {
                    tracing::warn!(peer = %peer_name, error = %err, "rpc response send failed");
                }
            }
            None => {
                tracing::warn!(peer = %peer_name, "rpc response dropped, peer not connected");
            }
        }
    }

    fn handle_rpc_response(&self, json: &str) {
        match serde_json::from_str::<RpcResponse>(json) {
            Ok(response) => self.rpc.complete(response),
            Err(err) => tracing::warn!(error = %err, "bad rpc response payload"),
        }
    }

    /// Call one operation on one peer and wait for its response.
    ///
    /// With `default` supplied, a missing peer or a timeout yields the
    /// default instead of an error. A response that arrives after the
    /// deadline is dropped on arrival.
    pub async fn rpc_request(
        &self,
        peer_name: &str,
        operation: &str,
        args: Value,
        timeout: Option<Duration>,
        default: Option<Value>,
    ) -> Result<Value> {
        let Some(link) = self.peers.get(peer_name).map(|entry| Arc::clone(entry.value()))
        else {
            return match default {
                Some(value) => Ok(value),
                None => Err(ClusterError::PeerNotFound(peer_name.to_string())),
            };
        };

        let id = uuid::Uuid::new_v4().to_string();
        let receiver = self.rpc.register(&id);
        let request = RpcRequest {
            operation: operation.to_string(),
            peer_name: self.self_name.clone(),
            args,
            id: id.clone(),
        };
        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(err) => {
                self.rpc.cancel(&id);
                return Err(ClusterError::Transport(format!("encode rpc request: {err}")));
            }
        };
        if let Err(err) = link
            .send_text(envelope::wrap(envelope::RPC_REQUEST, &json))
            .await
        {
            self.rpc.cancel(&id);
            tracing::warn!(peer = %peer_name, error = %err, "rpc request send failed");
            return match default {
                Some(value) => Ok(value),
                None => Err(err),
            };
        }

        let wait =
            timeout.unwrap_or(Duration::from_secs(self.config.default_rpc_timeout_seconds));
        match tokio::time::timeout(wait, receiver).await {
            Ok(Ok(response)) => {
                if response.success {
                    Ok(response.result)
                } else {
                    Err(ClusterError::Rpc(
                        response
                            .error
                            .unwrap_or_else(|| "remote operation failed".to_string()),
                    ))
                }
            }
            Ok(Err(_)) | Err(_) => {
                self.rpc.cancel(&id);
                metrics::counter!("rpc_timeouts_total").increment(1);
                match default {
                    Some(value) => Ok(value),
                    None => Err(ClusterError::RpcTimeout {
                        peer: peer_name.to_string(),
                        operation: operation.to_string(),
                        seconds: wait.as_secs(),
                    }),
                }
            }
        }
    }

    /// Call one operation on every connected peer concurrently. Per-peer
    /// failures land in the mapping; they never fail the cluster call.
    pub async fn rpc_cluster_request(
        &self,
        operation: &str,
        args: Value,
        timeout: Option<Duration>,
        default: Option<Value>,
    ) -> HashMap<String, PeerRpcOutcome> {
        let peer_names = self.peer_names();
        let calls = peer_names.into_iter().map(|name| {
            let args = args.clone();
            let default = default.clone();
            async move {
                let outcome = match self
                    .rpc_request(&name, operation, args, timeout, default)
                    .await
                {
                    Ok(result) => PeerRpcOutcome {
                        success: true,
                        result,
                        error: None,
                    },
                    Err(err) => PeerRpcOutcome {
                        success: false,
                        result: Value::Null,
                        error: Some(err.to_string()),
                    },
                };
                (name, outcome)
            }
        });
        futures_util::future::join_all(calls).await.into_iter().collect()
    }

    // --- shutdown ---------------------------------------------------------

    /// Stop the discovery loop, hand off the manager role, and close every
    /// link. Individual close failures are swallowed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.cache.set(&self.manager_key(), "").await;
        self.remove_peer_from_cache(&self.self_name, 2).await;
        let links: Vec<Arc<PeerLink>> = self
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for link in links {
            link.close().await;
        }
        self.peers.clear();
        tracing::info!("cluster manager shut down");
    }

    // --- cache keys -------------------------------------------------------

    async fn cached_peer_list(&self) -> Vec<String> {
        self.cache
            .get(&self.peers_key())
            .await
            .map(|list| {
                list.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn peers_key(&self) -> String {
        format!("{}{PEERS_KEY}", self.config.cache_prefix)
    }

    fn checkin_key(&self, name: &str) -> String {
        format!("{}{PEERS_KEY}-{name}", self.config.cache_prefix)
    }

    fn manager_key(&self) -> String {
        format!("{}{PEERS_KEY}-manager", self.config.cache_prefix)
    }
}

impl PeerFanout for ClusterManager {
    /// Wrap an outgoing SEND and replay it over every peer link. Sending
    /// happens on a spawned task so routing never blocks on a slow peer.
    fn rebroadcast_send(&self, destination: &str, message: &Message) {
        let links: Vec<Arc<PeerLink>> = self
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if links.is_empty() {
            return;
        }
        let payload = StompRebroadcast {
            destination: destination.to_string(),
            message_data: message.body_text(),
            headers: message.headers().to_vec(),
        };
        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "could not encode rebroadcast");
                return;
            }
        };
        let text = envelope::wrap(envelope::STOMP_MESSAGE_REBROADCAST, &json);
        metrics::counter!("cluster_rebroadcasts_total").increment(1);
        tokio::spawn(async move {
            for link in links {
                if let Err(err) = link.send_text(text.clone()).await {
                    tracing::warn!(peer = %link.peer_name(), error = %err, "rebroadcast send failed");
                }
            }
        });
    }
}

// Adaptive outer delay: fast scans while the cluster is changing, long
// quiet periods once it has been stable for a while.
fn delay_for(stable_for: Duration) -> Duration {
    let secs = stable_for.as_secs();
    if secs < 10 {
        Duration::from_secs(2 + rand::thread_rng().gen_range(0..=2))
    } else if secs < 30 {
        Duration::from_secs(5)
    } else if secs < 60 {
        Duration::from_secs(10)
    } else if secs < 300 {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(60)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::NoRpcHandlers;
    use socketbox_broker::{BrokerConfig, ChannelFrame};
    use socketbox_storage::EphemeralCache;

    fn cluster_config(name: &str) -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.cluster.enable = true;
        config.cluster.name = Some(name.to_string());
        config.cluster.secret_key = "s3cret".to_string();
        config
    }

    fn manager_with_cache(name: &str, cache: Arc<dyn CacheProvider>) -> Arc<ClusterManager> {
        let broker = Arc::new(Broker::new(cluster_config(name)).expect("broker"));
        ClusterManager::new(broker, cache, Arc::new(NoRpcHandlers)).expect("manager")
    }

    fn manager(name: &str) -> Arc<ClusterManager> {
        manager_with_cache(name, Arc::new(EphemeralCache::new()))
    }

    #[tokio::test]
    async fn new_requires_clustering_enabled() {
        let broker = Arc::new(Broker::new(BrokerConfig::default()).expect("broker"));
        let err = ClusterManager::new(
            broker,
            Arc::new(EphemeralCache::new()),
            Arc::new(NoRpcHandlers),
        )
        .expect_err("disabled");
        assert!(matches!(err, ClusterError::ClusterDisabled));
    }

    #[tokio::test]
    async fn new_requires_a_node_name() {
        let mut config = BrokerConfig::default();
        config.cluster.enable = true;
        let broker = Arc::new(Broker::new(config).expect("broker"));
        let err = ClusterManager::new(
            broker,
            Arc::new(EphemeralCache::new()),
            Arc::new(NoRpcHandlers),
        )
        .expect_err("no name");
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[tokio::test]
    async fn classification_keeps_maps_disjoint() {
        let manager = manager("ws://self:9000/");
        let (client, _rx1) = Channel::pair(1);
        let (peer, _rx2) = Channel::pair(2);
        let (looped, _rx3) = Channel::pair(3);

        assert_eq!(
            manager.classify_channel(&client, None, None),
            ChannelClass::Client
        );
        assert_eq!(
            manager.classify_channel(&peer, Some("s3cret"), Some("ws://other:9000/")),
            ChannelClass::Management
        );
        assert_eq!(
            manager.classify_channel(&looped, Some("s3cret"), Some("ws://self:9000/")),
            ChannelClass::SelfLink
        );
        // Wrong secret falls through to a regular client.
        let (imposter, _rx4) = Channel::pair(4);
        assert_eq!(
            manager.classify_channel(&imposter, Some("wrong"), Some("ws://other:9000/")),
            ChannelClass::Client
        );

        assert_eq!(manager.channels.len(), 2);
        assert_eq!(manager.management_channels.len(), 1);
        assert_eq!(manager.self_channels.len(), 1);

        manager.channel_closed(1);
        manager.channel_closed(2);
        manager.channel_closed(3);
        manager.channel_closed(4);
        assert_eq!(manager.channels.len(), 0);
        assert_eq!(manager.management_channels.len(), 0);
        assert_eq!(manager.self_channels.len(), 0);
    }

    #[tokio::test]
    async fn ensure_self_listed_is_idempotent() {
        let cache: Arc<dyn CacheProvider> = Arc::new(EphemeralCache::new());
        let manager = manager_with_cache("ws://self:9000/", Arc::clone(&cache));
        manager.ensure_self_listed().await;
        manager.ensure_self_listed().await;
        let list = cache.get("socketbox-cluster-peers").await.expect("list");
        assert_eq!(list, "ws://self:9000/");
    }

    #[tokio::test]
    async fn peer_list_survives_other_entries() {
        let cache: Arc<dyn CacheProvider> = Arc::new(EphemeralCache::new());
        cache.set("socketbox-cluster-peers", "ws://other:9000/").await;
        let manager = manager_with_cache("ws://self:9000/", Arc::clone(&cache));
        manager.ensure_self_listed().await;
        let list = cache.get("socketbox-cluster-peers").await.expect("list");
        assert!(list.contains("ws://other:9000/"));
        assert!(list.contains("ws://self:9000/"));
    }

    #[tokio::test]
    async fn remove_peer_from_cache_is_idempotent() {
        let cache: Arc<dyn CacheProvider> = Arc::new(EphemeralCache::new());
        cache
            .set("socketbox-cluster-peers", "ws://a:1/\nws://b:2/")
            .await;
        cache.set("socketbox-cluster-peers-ws://a:1/", "123").await;
        let manager = manager_with_cache("ws://self:9000/", Arc::clone(&cache));

        manager.remove_peer_from_cache("ws://a:1/", 2).await;
        manager.remove_peer_from_cache("ws://a:1/", 2).await;
        let list = cache.get("socketbox-cluster-peers").await.expect("list");
        assert_eq!(list, "ws://b:2/");
        assert!(cache.get("socketbox-cluster-peers-ws://a:1/").await.is_none());
    }

    #[tokio::test]
    async fn stale_peers_are_reaped_and_fresh_ones_kept() {
        let cache: Arc<dyn CacheProvider> = Arc::new(EphemeralCache::new());
        cache
            .set("socketbox-cluster-peers", "ws://old:1/\nws://fresh:2/")
            .await;
        cache.set("socketbox-cluster-peers-ws://old:1/", "1").await;
        cache
            .set(
                "socketbox-cluster-peers-ws://fresh:2/",
                &epoch_secs().to_string(),
            )
            .await;
        let manager = manager_with_cache("ws://self:9000/", Arc::clone(&cache));

        manager.reap_stale_peers().await;
        let list = cache.get("socketbox-cluster-peers").await.expect("list");
        assert!(!list.contains("ws://old:1/"));
        assert!(list.contains("ws://fresh:2/"));
    }

    #[tokio::test]
    async fn election_claims_empty_and_stale_keys() {
        let cache: Arc<dyn CacheProvider> = Arc::new(EphemeralCache::new());
        let manager = manager_with_cache("ws://self:9000/", Arc::clone(&cache));

        // Empty key: claim it.
        manager.elect_manager().await;
        assert!(manager.is_manager().await);

        // Key naming an unconnected peer: take over.
        cache
            .set("socketbox-cluster-peers-manager", "ws://gone:9000/")
            .await;
        manager.elect_manager().await;
        assert!(manager.is_manager().await);

        // Key already naming self: stays.
        manager.elect_manager().await;
        assert!(manager.is_manager().await);
    }

    #[tokio::test]
    async fn broadcast_message_reaches_clients_only() {
        let manager = manager("ws://self:9000/");
        let (client, mut client_rx) = Channel::pair(1);
        let (peer, mut peer_rx) = Channel::pair(2);
        manager.classify_channel(&client, None, None);
        manager.classify_channel(&peer, Some("s3cret"), Some("ws://other:9000/"));

        manager.broadcast_message("announcement", false).await;
        assert_eq!(
            client_rx.recv().await,
            Some(ChannelFrame::Text("announcement".into()))
        );
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stomp_rebroadcast_replays_through_broker() {
        let broker = Arc::new(Broker::new(cluster_config("ws://self:9000/")).expect("broker"));
        let manager = ClusterManager::new(
            Arc::clone(&broker),
            Arc::new(EphemeralCache::new()),
            Arc::new(NoRpcHandlers),
        )
        .expect("manager");

        // A local subscriber on the destination the remote SEND targets.
        let (subscriber, mut sub_rx) = Channel::pair(1);
        broker
            .dispatch(&subscriber, Message::new(Command::Connect))
            .await;
        let _connected = sub_rx.recv().await;
        broker
            .dispatch(
                &subscriber,
                Message::new(Command::Subscribe)
                    .with_header("id", "s1")
                    .with_header("destination", "direct/hello"),
            )
            .await;

        let payload = StompRebroadcast {
            destination: "direct/hello".into(),
            message_data: "from-peer".into(),
            headers: vec![("publisher-id".into(), "99".into())],
        };
        let text = envelope::wrap(
            envelope::STOMP_MESSAGE_REBROADCAST,
            &serde_json::to_string(&payload).expect("encode"),
        );
        manager.handle_management_text(&text).await;

        let Some(ChannelFrame::Text(frame)) = sub_rx.recv().await else {
            panic!("expected delivery");
        };
        assert!(frame.contains("from-peer"));
        assert!(frame.contains("destination:hello"));
    }

    #[tokio::test]
    async fn rpc_request_to_unknown_peer_uses_default_or_fails() {
        let manager = manager("ws://self:9000/");
        let fallback = manager
            .rpc_request(
                "ws://gone:9000/",
                "uptime",
                Value::Null,
                Some(Duration::from_secs(1)),
                Some(Value::from(-1)),
            )
            .await
            .expect("default");
        assert_eq!(fallback, Value::from(-1));

        let err = manager
            .rpc_request(
                "ws://gone:9000/",
                "uptime",
                Value::Null,
                Some(Duration::from_secs(1)),
                None,
            )
            .await
            .expect_err("no default");
        assert!(matches!(err, ClusterError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn cluster_request_with_no_peers_is_empty() {
        let manager = manager("ws://self:9000/");
        let outcomes = manager
            .rpc_cluster_request("uptime", Value::Null, Some(Duration::from_secs(1)), None)
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn builtin_rpc_operations_answer_locally() {
        let manager = manager("ws://self:9000/");
        let uptime = manager
            .execute_rpc("uptime", &Value::Null)
            .await
            .expect("uptime");
        assert!(uptime.as_u64().is_some());

        let connections = manager
            .execute_rpc("getSTOMPCConnections", &Value::Null)
            .await
            .expect("connections");
        assert!(connections.as_array().is_some());

        let err = manager
            .execute_rpc("unknown-op", &Value::Null)
            .await
            .expect_err("unknown");
        assert!(err.contains("unknown-op"));
    }

    #[tokio::test]
    async fn shutdown_blanks_manager_key_and_removes_self() {
        let cache: Arc<dyn CacheProvider> = Arc::new(EphemeralCache::new());
        let manager = manager_with_cache("ws://self:9000/", Arc::clone(&cache));
        manager.ensure_self_listed().await;
        manager.elect_manager().await;
        assert!(manager.is_manager().await);

        manager.shutdown().await;
        assert_eq!(
            cache
                .get("socketbox-cluster-peers-manager")
                .await
                .as_deref(),
            Some("")
        );
        let list = cache.get("socketbox-cluster-peers").await.unwrap_or_default();
        assert!(!list.contains("ws://self:9000/"));
    }

    #[test]
    fn scan_delay_grows_with_stability() {
        let fast = delay_for(Duration::from_secs(0));
        assert!(fast >= Duration::from_secs(2) && fast <= Duration::from_secs(4));
        assert_eq!(delay_for(Duration::from_secs(15)), Duration::from_secs(5));
        assert_eq!(delay_for(Duration::from_secs(45)), Duration::from_secs(10));
        assert_eq!(delay_for(Duration::from_secs(120)), Duration::from_secs(30));
        assert_eq!(delay_for(Duration::from_secs(600)), Duration::from_secs(60));
    }
}
