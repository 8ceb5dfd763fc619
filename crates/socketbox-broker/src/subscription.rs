// Destination -> subscriber table.
//
// Buckets keep insertion order so per-subscriber delivery order is stable,
// and are created lazily with a double-checked lookup so two racing
// subscribers to a fresh destination cannot clobber each other.
use crate::channel::Channel;
use socketbox_frame::Message;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Server-side handler invoked synchronously for internal subscriptions.
pub type InternalCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// STOMP subscription acknowledgement modes. Recorded per subscription;
/// redelivery bookkeeping is out of scope so the mode is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("client") => AckMode::Client,
            Some("client-individual") => AckMode::ClientIndividual,
            _ => AckMode::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

/// One live interest in a destination.
#[derive(Clone)]
pub enum Subscriber {
    /// A client: deliveries are serialized MESSAGE frames.
    Channel {
        channel: Channel,
        subscription_id: String,
        ack: AckMode,
    },
    /// A server-side callback registered at configure time.
    Internal { callback: InternalCallback },
}

impl Subscriber {
    pub fn channel_id(&self) -> Option<u64> {
        match self {
            Subscriber::Channel { channel, .. } => Some(channel.id()),
            Subscriber::Internal { .. } => None,
        }
    }
}

/// Table key for a client subscription: a client may reuse the same
/// subscription id across connections, so the channel id disambiguates.
pub fn channel_sub_key(channel_id: u64, subscription_id: &str) -> String {
    format!("{channel_id}:{subscription_id}")
}

type Bucket = Vec<(String, Subscriber)>;

#[derive(Default)]
pub struct SubscriptionTable {
    // Outer map keyed by lowercased destination; destination comparisons
    // are case-insensitive throughout routing.
    buckets: RwLock<HashMap<String, Arc<RwLock<Bucket>>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, destination: &str) -> Arc<RwLock<Bucket>> {
        let key = destination.to_lowercase();
        // Fast path: bucket already exists.
        if let Some(bucket) = self.buckets.read().expect("bucket map lock").get(&key) {
            return Arc::clone(bucket);
        }
        // Double-checked creation under the write lock.
        let mut guard = self.buckets.write().expect("bucket map lock");
        Arc::clone(guard.entry(key).or_default())
    }

    /// Insert or replace the subscription stored under `key`.
    pub fn add(&self, destination: &str, key: impl Into<String>, subscriber: Subscriber) {
        let key = key.into();
        let bucket = self.bucket(destination);
        let mut guard = bucket.write().expect("bucket lock");
        if let Some(entry) = guard.iter_mut().find(|(existing, _)| *existing == key) {
            entry.1 = subscriber;
        } else {
            guard.push((key, subscriber));
        }
    }

    /// Remove `key` from one destination. Unknown keys are a no-op.
    pub fn remove(&self, destination: &str, key: &str) -> bool {
        let lowered = destination.to_lowercase();
        let Some(bucket) = self
            .buckets
            .read()
            .expect("bucket map lock")
            .get(&lowered)
            .cloned()
        else {
            return false;
        };
        let mut guard = bucket.write().expect("bucket lock");
        let before = guard.len();
        guard.retain(|(existing, _)| existing != key);
        guard.len() != before
    }

    /// Remove `key` wherever it appears. Used by UNSUBSCRIBE, which does
    /// not carry the destination.
    pub fn remove_everywhere(&self, key: &str) -> usize {
        let buckets: Vec<_> = self
            .buckets
            .read()
            .expect("bucket map lock")
            .values()
            .cloned()
            .collect();
        let mut removed = 0;
        for bucket in buckets {
            let mut guard = bucket.write().expect("bucket lock");
            let before = guard.len();
            guard.retain(|(existing, _)| existing != key);
            removed += before - guard.len();
        }
        removed
    }

    /// Drop every subscription owned by a channel, across all destinations.
    pub fn remove_by_channel(&self, channel_id: u64) -> usize {
        let buckets: Vec<_> = self
            .buckets
            .read()
            .expect("bucket map lock")
            .values()
            .cloned()
            .collect();
        let mut removed = 0;
        for bucket in buckets {
            let mut guard = bucket.write().expect("bucket lock");
            let before = guard.len();
            guard.retain(|(_, subscriber)| subscriber.channel_id() != Some(channel_id));
            removed += before - guard.len();
        }
        removed
    }

    /// Drop every internal subscription; called on reconfigure so the
    /// application can re-register its callbacks against the new graph.
    pub fn remove_all_internal(&self) {
        let buckets: Vec<_> = self
            .buckets
            .read()
            .expect("bucket map lock")
            .values()
            .cloned()
            .collect();
        for bucket in buckets {
            bucket
                .write()
                .expect("bucket lock")
                .retain(|(_, subscriber)| !matches!(subscriber, Subscriber::Internal { .. }));
        }
    }

    /// Visit live subscribers of one destination in insertion order. The
    /// bucket is snapshotted first so a visitor may re-enter the table
    /// (an internal callback republishing, a racing unsubscribe) without
    /// deadlocking.
    pub fn for_each(&self, destination: &str, mut visit: impl FnMut(&str, &Subscriber)) {
        let lowered = destination.to_lowercase();
        let Some(bucket) = self
            .buckets
            .read()
            .expect("bucket map lock")
            .get(&lowered)
            .cloned()
        else {
            return;
        };
        let snapshot: Vec<(String, Subscriber)> =
            bucket.read().expect("bucket lock").clone();
        for (key, subscriber) in &snapshot {
            visit(key, subscriber);
        }
    }

    /// Total subscription count, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .expect("bucket map lock")
            .values()
            .map(|bucket| bucket.read().expect("bucket lock").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_sub(channel: &Channel, id: &str) -> Subscriber {
        Subscriber::Channel {
            channel: channel.clone(),
            subscription_id: id.to_string(),
            ack: AckMode::Auto,
        }
    }

    #[test]
    fn add_and_visit_in_insertion_order() {
        let table = SubscriptionTable::new();
        let (a, _rx_a) = Channel::pair(1);
        let (b, _rx_b) = Channel::pair(2);
        table.add("room", channel_sub_key(1, "s"), channel_sub(&a, "s"));
        table.add("room", channel_sub_key(2, "s"), channel_sub(&b, "s"));

        let mut seen = Vec::new();
        table.for_each("room", |key, _| seen.push(key.to_string()));
        assert_eq!(seen, vec!["1:s", "2:s"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let table = SubscriptionTable::new();
        let (a, _rx) = Channel::pair(1);
        table.add("Room", channel_sub_key(1, "s"), channel_sub(&a, "s"));
        let mut count = 0;
        table.for_each("rOOM", |_, _| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn add_with_same_key_replaces() {
        let table = SubscriptionTable::new();
        let (a, _rx) = Channel::pair(1);
        table.add("room", "1:s", channel_sub(&a, "s"));
        table.add(
            "room",
            "1:s",
            Subscriber::Channel {
                channel: a.clone(),
                subscription_id: "s".into(),
                ack: AckMode::Client,
            },
        );
        assert_eq!(table.len(), 1);
        table.for_each("room", |_, subscriber| {
            assert!(matches!(
                subscriber,
                Subscriber::Channel { ack: AckMode::Client, .. }
            ));
        });
    }

    #[test]
    fn remove_unknown_key_is_noop() {
        let table = SubscriptionTable::new();
        assert!(!table.remove("room", "1:s"));
        assert_eq!(table.remove_everywhere("1:s"), 0);
    }

    #[test]
    fn remove_by_channel_clears_all_destinations() {
        let table = SubscriptionTable::new();
        let (a, _rx_a) = Channel::pair(1);
        let (b, _rx_b) = Channel::pair(2);
        table.add("room", channel_sub_key(1, "s1"), channel_sub(&a, "s1"));
        table.add("lobby", channel_sub_key(1, "s2"), channel_sub(&a, "s2"));
        table.add("room", channel_sub_key(2, "s1"), channel_sub(&b, "s1"));

        assert_eq!(table.remove_by_channel(1), 2);
        assert_eq!(table.len(), 1);
        let mut remaining = Vec::new();
        table.for_each("room", |key, _| remaining.push(key.to_string()));
        assert_eq!(remaining, vec!["2:s1"]);
    }

    #[test]
    fn remove_all_internal_keeps_channel_subs() {
        let table = SubscriptionTable::new();
        let (a, _rx) = Channel::pair(1);
        table.add("room", channel_sub_key(1, "s"), channel_sub(&a, "s"));
        table.add(
            "room",
            "internal-1",
            Subscriber::Internal {
                callback: Arc::new(|_| {}),
            },
        );
        assert_eq!(table.len(), 2);
        table.remove_all_internal();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ack_mode_parsing_defaults_to_auto() {
        assert_eq!(AckMode::from_header(None), AckMode::Auto);
        assert_eq!(AckMode::from_header(Some("client")), AckMode::Client);
        assert_eq!(
            AckMode::from_header(Some("client-individual")),
            AckMode::ClientIndividual
        );
        assert_eq!(AckMode::from_header(Some("bogus")), AckMode::Auto);
    }
}
