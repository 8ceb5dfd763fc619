//! STOMP broker core: the exchange graph, the subscription table, and the
//! per-connection command dispatcher.
//!
//! # Purpose
//! Everything between the transport (WebSocket frames in/out) and the
//! cluster layer lives here. The transport hands inbound frames to
//! [`Broker::dispatch`]; deliveries flow back out through [`Channel`]
//! handles the transport owns.
//!
//! # Notes
//! The cluster layer plugs in through the narrow [`PeerFanout`] trait so
//! the two subsystems stay acyclic.
pub mod auth;
pub mod broker;
pub mod channel;
pub mod config;
pub mod destination;
pub mod exchange;
pub mod subscription;

pub use auth::{Access, AllowAll, AuthHandler};
pub use broker::{Broker, Connection, ConnectionSummary, PeerFanout, HOP_LIMIT};
pub use channel::{Channel, ChannelFrame};
pub use config::{BindingTargets, BrokerConfig, ClusterConfig, ExchangeConfig};
pub use destination::{ParsedDestination, DEFAULT_EXCHANGE};
pub use exchange::{DistributionType, Exchange};
pub use subscription::{channel_sub_key, AckMode, InternalCallback, Subscriber, SubscriptionTable};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("authentication failed")]
    AuthenticationFailure,
    #[error("not authorized to {access} {destination}")]
    AuthorizationFailure { access: String, destination: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unknown distribution type: {0}")]
    UnknownDistributionType(String),
    #[error("routing exceeded the hop limit")]
    HopLimitExceeded,
    #[error(transparent)]
    Frame(#[from] socketbox_frame::Error),
}

impl BrokerError {
    /// Short, stable text used as the ERROR frame `message` header; the
    /// full `Display` rendering goes in the frame body.
    pub fn summary(&self) -> &'static str {
        match self {
            BrokerError::AuthenticationFailure => "authentication failed",
            BrokerError::AuthorizationFailure { .. } => "access denied",
            BrokerError::InvalidConfiguration(_) | BrokerError::UnknownDistributionType(_) => {
                "invalid configuration"
            }
            BrokerError::HopLimitExceeded => "routing loop",
            BrokerError::Frame(_) => "malformed frame",
        }
    }
}
