// The exchange graph: polymorphic routing nodes that deliver to local
// subscribers or chain into one another through the broker.
use crate::broker::Broker;
use crate::config::ExchangeConfig;
use crate::{BrokerError, Result};
use rand::Rng;
use regex::Regex;
use socketbox_frame::Message;
use std::sync::Mutex;

/// A named routing node. All variants share one `route` entry point;
/// Topic/Fanout/Distribution re-enter the broker, so routing carries a hop
/// counter that the broker bounds.
#[derive(Debug)]
pub enum Exchange {
    Direct(DirectExchange),
    Topic(TopicExchange),
    Fanout(FanoutExchange),
    Distribution(DistributionExchange),
}

impl Exchange {
    /// Build an exchange from its configuration block. Errors here are
    /// fatal at configure time; the broker rolls back to the previous
    /// graph rather than run with a half-built table.
    pub fn from_config(name: &str, config: &ExchangeConfig) -> Result<Self> {
        match config.class.as_str() {
            "direct" => Ok(Exchange::Direct(DirectExchange::new(name, config)?)),
            "topic" => Ok(Exchange::Topic(TopicExchange::new(name, config)?)),
            "fanout" => Ok(Exchange::Fanout(FanoutExchange::new(config))),
            "distribution" => Ok(Exchange::Distribution(DistributionExchange::new(
                name, config,
            )?)),
            other => Err(BrokerError::InvalidConfiguration(format!(
                "exchange {name}: unknown class {other:?}"
            ))),
        }
    }

    pub fn route(&self, broker: &Broker, destination: &str, message: &Message, hops: u32) {
        match self {
            Exchange::Direct(exchange) => exchange.route(broker, destination, message, hops),
            Exchange::Topic(exchange) => exchange.route(broker, destination, message, hops),
            Exchange::Fanout(exchange) => exchange.route(broker, destination, message, hops),
            Exchange::Distribution(exchange) => exchange.route(broker, destination, message, hops),
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Exchange::Direct(_) => "direct",
            Exchange::Topic(_) => "topic",
            Exchange::Fanout(_) => "fanout",
            Exchange::Distribution(_) => "distribution",
        }
    }
}

// Extracts the single target form used by direct/topic bindings.
fn single_target(exchange: &str, pattern: &str, targets: Vec<String>) -> Result<String> {
    if targets.len() != 1 {
        return Err(BrokerError::InvalidConfiguration(format!(
            "exchange {exchange}: binding {pattern:?} expects exactly one target, got {}",
            targets.len()
        )));
    }
    Ok(targets.into_iter().next().expect("single target"))
}

/// Exact-match routing: deliver to subscribers of the destination, then
/// chain through any binding whose name equals the destination.
#[derive(Debug)]
pub struct DirectExchange {
    // (lowercased name, target)
    bindings: Vec<(String, String)>,
}

impl DirectExchange {
    fn new(name: &str, config: &ExchangeConfig) -> Result<Self> {
        let mut bindings = Vec::with_capacity(config.bindings.len());
        for (pattern, targets) in &config.bindings {
            let target = single_target(name, pattern, targets.clone().into_vec())?;
            bindings.push((pattern.to_lowercase(), target));
        }
        Ok(Self { bindings })
    }

    fn route(&self, broker: &Broker, destination: &str, message: &Message, hops: u32) {
        broker.deliver_local(destination, message);
        let lowered = destination.to_lowercase();
        for (name, target) in &self.bindings {
            if *name == lowered {
                broker.reroute(target, message, hops + 1);
            }
        }
    }
}

/// Pattern routing: every matching binding re-routes; delivery always
/// happens through another exchange (typically direct).
#[derive(Debug)]
pub struct TopicExchange {
    bindings: Vec<(Regex, String)>,
}

impl TopicExchange {
    fn new(name: &str, config: &ExchangeConfig) -> Result<Self> {
        let mut bindings = Vec::with_capacity(config.bindings.len());
        for (pattern, targets) in &config.bindings {
            let target = single_target(name, pattern, targets.clone().into_vec())?;
            bindings.push((compile_topic_pattern(name, pattern)?, target));
        }
        Ok(Self { bindings })
    }

    fn route(&self, broker: &Broker, destination: &str, message: &Message, hops: u32) {
        let lowered = destination.to_lowercase();
        for (pattern, target) in &self.bindings {
            if pattern.is_match(&lowered) {
                broker.reroute(target, message, hops + 1);
            }
        }
    }
}

/// Broadcast routing: a matching name re-routes to every bound target.
#[derive(Debug)]
pub struct FanoutExchange {
    bindings: Vec<(String, Vec<String>)>,
}

impl FanoutExchange {
    fn new(config: &ExchangeConfig) -> Self {
        let bindings = config
            .bindings
            .iter()
            .map(|(name, targets)| (name.to_lowercase(), targets.clone().into_vec()))
            .collect();
        Self { bindings }
    }

    fn route(&self, broker: &Broker, destination: &str, message: &Message, hops: u32) {
        let lowered = destination.to_lowercase();
        for (name, targets) in &self.bindings {
            if *name == lowered {
                for target in targets {
                    broker.reroute(target, message, hops + 1);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionType {
    Random,
    RoundRobin,
}

impl DistributionType {
    fn parse(name: &str, value: Option<&str>) -> Result<Self> {
        match value {
            Some("random") => Ok(DistributionType::Random),
            Some("roundrobin") => Ok(DistributionType::RoundRobin),
            other => Err(BrokerError::UnknownDistributionType(format!(
                "exchange {name}: {:?}",
                other.unwrap_or("<missing>")
            ))),
        }
    }
}

/// Load-splitting routing: a matching name re-routes to exactly one of the
/// bound targets, picked uniformly or round-robin.
#[derive(Debug)]
pub struct DistributionExchange {
    bindings: Vec<(String, Vec<String>)>,
    kind: DistributionType,
    // Monotonic round-robin cursor shared by all bindings of the exchange.
    cursor: Mutex<u64>,
}

impl DistributionExchange {
    fn new(name: &str, config: &ExchangeConfig) -> Result<Self> {
        let kind = DistributionType::parse(name, config.distribution_type.as_deref())?;
        let bindings = config
            .bindings
            .iter()
            .map(|(pattern, targets)| (pattern.to_lowercase(), targets.clone().into_vec()))
            .collect();
        Ok(Self {
            bindings,
            kind,
            cursor: Mutex::new(0),
        })
    }

    fn choose<'a>(&self, targets: &'a [String]) -> Option<&'a String> {
        if targets.is_empty() {
            // No targets bound: treated as "no route".
            return None;
        }
        let index = match self.kind {
            DistributionType::Random => rand::thread_rng().gen_range(0..targets.len()),
            DistributionType::RoundRobin => {
                let mut cursor = self.cursor.lock().expect("cursor lock");
                let index = (*cursor as usize) % targets.len();
                *cursor += 1;
                index
            }
        };
        targets.get(index)
    }

    fn route(&self, broker: &Broker, destination: &str, message: &Message, hops: u32) {
        let lowered = destination.to_lowercase();
        for (name, targets) in &self.bindings {
            if *name != lowered {
                continue;
            }
            match self.choose(targets) {
                Some(target) => broker.reroute(target, message, hops + 1),
                None => {
                    tracing::debug!(destination = %destination, "distribution binding has no targets");
                }
            }
        }
    }
}

// Topic pattern translation: `.` separates segments, `*` matches one
// segment, `#` matches any remainder ("a.#" also matches the bare "a").
// Patterns are lowercased and anchored; matching input is lowercased too.
fn compile_topic_pattern(exchange: &str, pattern: &str) -> Result<Regex> {
    let lowered = pattern.to_lowercase();
    let mut source = String::with_capacity(lowered.len() + 8);
    source.push('^');
    let mut chars = lowered.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '.' if chars.peek() == Some(&'#') => {
                chars.next();
                source.push_str("(?:\\..*)?");
            }
            '.' => source.push_str("\\."),
            '*' => source.push_str("[^.]*"),
            '#' => source.push_str(".*"),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|err| {
        BrokerError::InvalidConfiguration(format!(
            "exchange {exchange}: topic pattern {pattern:?}: {err}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn topic_matches(pattern: &str, destination: &str) -> bool {
        compile_topic_pattern("topic", pattern)
            .expect("pattern")
            .is_match(&destination.to_lowercase())
    }

    #[test]
    fn hash_matches_any_depth_including_bare_prefix() {
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("a.#", "a.b"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(!topic_matches("a.#", "b.a"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(topic_matches("a.*", "a.b"));
        assert!(!topic_matches("a.*", "a"));
        assert!(!topic_matches("a.*", "a.b.c"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(topic_matches("Orders.*", "ORDERS.new"));
        assert!(topic_matches("orders.#", "Orders.New.EU"));
    }

    #[test]
    fn literal_dots_do_not_act_as_wildcards() {
        assert!(!topic_matches("a.b", "aXb"));
        assert!(topic_matches("a.b", "a.b"));
    }

    #[test]
    fn regex_metacharacters_are_escaped() {
        assert!(topic_matches("a+b", "a+b"));
        assert!(!topic_matches("a+b", "aab"));
    }

    #[test]
    fn unknown_distribution_type_is_rejected() {
        let config = ExchangeConfig {
            class: "distribution".into(),
            bindings: HashMap::new(),
            distribution_type: Some("fastest".into()),
        };
        let err = Exchange::from_config("split", &config).expect_err("type");
        assert!(matches!(err, BrokerError::UnknownDistributionType(_)));
    }

    #[test]
    fn missing_distribution_type_is_rejected() {
        let config = ExchangeConfig {
            class: "distribution".into(),
            bindings: HashMap::new(),
            distribution_type: None,
        };
        let err = Exchange::from_config("split", &config).expect_err("type");
        assert!(matches!(err, BrokerError::UnknownDistributionType(_)));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let config = ExchangeConfig {
            class: "quantum".into(),
            bindings: HashMap::new(),
            distribution_type: None,
        };
        let err = Exchange::from_config("x", &config).expect_err("class");
        assert!(matches!(err, BrokerError::InvalidConfiguration(_)));
    }

    #[test]
    fn direct_binding_requires_single_target() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "room".to_string(),
            crate::config::BindingTargets::Many(vec!["a".into(), "b".into()]),
        );
        let config = ExchangeConfig {
            class: "direct".into(),
            bindings,
            distribution_type: None,
        };
        let err = Exchange::from_config("direct", &config).expect_err("single target");
        assert!(matches!(err, BrokerError::InvalidConfiguration(_)));
    }

    #[test]
    fn round_robin_cycles_through_targets() {
        let config = ExchangeConfig {
            class: "distribution".into(),
            bindings: HashMap::new(),
            distribution_type: Some("roundrobin".into()),
        };
        let Exchange::Distribution(exchange) =
            Exchange::from_config("split", &config).expect("exchange")
        else {
            panic!("expected distribution");
        };
        let targets = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let picks: Vec<_> = (0..4)
            .map(|_| exchange.choose(&targets).expect("target").clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn single_target_distribution_always_returns_it() {
        for kind in ["random", "roundrobin"] {
            let config = ExchangeConfig {
                class: "distribution".into(),
                bindings: HashMap::new(),
                distribution_type: Some(kind.into()),
            };
            let Exchange::Distribution(exchange) =
                Exchange::from_config("split", &config).expect("exchange")
            else {
                panic!("expected distribution");
            };
            let targets = vec!["only".to_string()];
            for _ in 0..5 {
                assert_eq!(exchange.choose(&targets), Some(&"only".to_string()));
            }
        }
    }

    #[test]
    fn empty_target_list_routes_nowhere() {
        let config = ExchangeConfig {
            class: "distribution".into(),
            bindings: HashMap::new(),
            distribution_type: Some("random".into()),
        };
        let Exchange::Distribution(exchange) =
            Exchange::from_config("split", &config).expect("exchange")
        else {
            panic!("expected distribution");
        };
        assert_eq!(exchange.choose(&[]), None);
    }
}
