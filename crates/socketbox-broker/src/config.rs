// Broker configuration: exchange graph definitions plus cluster settings.
use serde::Deserialize;
use std::collections::HashMap;

const DEFAULT_HEART_BEAT_MS: u64 = 10_000;
const DEFAULT_PEER_CONNECTION_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_PEER_IDLE_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_RPC_TIMEOUT_SECONDS: u64 = 15;

/// Declarative broker configuration.
///
/// Internal (server-side) subscriptions are function values and therefore
/// registered programmatically via `Broker::subscribe_internal`, not here.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Advertised both ways on the CONNECTED `heart-beat` header.
    #[serde(default = "default_heart_beat_ms")]
    pub heart_beat_ms: u64,
    /// Debug mode allows live `reconfigure` calls that rebuild the
    /// exchange graph while preserving connections and subscriptions.
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_heart_beat_ms() -> u64 {
    DEFAULT_HEART_BEAT_MS
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heart_beat_ms: DEFAULT_HEART_BEAT_MS,
            debug_mode: false,
            exchanges: HashMap::new(),
            cluster: ClusterConfig::default(),
        }
    }
}

/// One exchange definition. `class` selects the routing behavior;
/// `bindings` is interpreted per class (single target for direct/topic,
/// target lists for fanout/distribution).
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub class: String,
    #[serde(default)]
    pub bindings: HashMap<String, BindingTargets>,
    /// Distribution only: `random` or `roundrobin`.
    #[serde(default, rename = "type")]
    pub distribution_type: Option<String>,
}

/// Binding value: a single target or a list, accepted interchangeably so
/// YAML stays terse for the common one-target case.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BindingTargets {
    One(String),
    Many(Vec<String>),
}

impl BindingTargets {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            BindingTargets::One(target) => vec![target],
            BindingTargets::Many(targets) => targets,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enable: bool,
    /// Shared secret validated on the management upgrade headers.
    #[serde(default)]
    pub secret_key: String,
    /// This node's advertised WebSocket URL; the only cluster-wide identity.
    #[serde(default)]
    pub name: Option<String>,
    /// Static peers, always attempted in addition to discovered ones.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Prepended to every cluster cache key.
    #[serde(default)]
    pub cache_prefix: String,
    #[serde(default = "default_peer_connection_timeout")]
    pub peer_connection_timeout_seconds: u64,
    #[serde(default = "default_peer_idle_timeout")]
    pub peer_idle_timeout_seconds: u64,
    #[serde(default = "default_rpc_timeout")]
    pub default_rpc_timeout_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            secret_key: String::new(),
            name: None,
            peers: Vec::new(),
            cache_prefix: String::new(),
            peer_connection_timeout_seconds: DEFAULT_PEER_CONNECTION_TIMEOUT_SECONDS,
            peer_idle_timeout_seconds: DEFAULT_PEER_IDLE_TIMEOUT_SECONDS,
            default_rpc_timeout_seconds: DEFAULT_RPC_TIMEOUT_SECONDS,
        }
    }
}

fn default_peer_connection_timeout() -> u64 {
    DEFAULT_PEER_CONNECTION_TIMEOUT_SECONDS
}

fn default_peer_idle_timeout() -> u64 {
    DEFAULT_PEER_IDLE_TIMEOUT_SECONDS
}

fn default_rpc_timeout() -> u64 {
    DEFAULT_RPC_TIMEOUT_SECONDS
}
