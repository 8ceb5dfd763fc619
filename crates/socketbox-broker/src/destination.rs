/// A destination split into its exchange and the routable tail.
///
/// `"<exchange>/<tail>"` selects an exchange by name; a bare string routes
/// through the default `direct` exchange with the whole string as tail.
/// The tail may itself contain `/` and is re-parsed whenever an exchange
/// re-routes it.
///
/// ```
/// use socketbox_broker::ParsedDestination;
///
/// let parsed = ParsedDestination::parse("topic/orders.new");
/// assert_eq!(parsed.exchange, "topic");
/// assert_eq!(parsed.tail, "orders.new");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDestination {
    pub exchange: String,
    pub tail: String,
}

pub const DEFAULT_EXCHANGE: &str = "direct";

impl ParsedDestination {
    pub fn parse(destination: &str) -> Self {
        match destination.split_once('/') {
            Some((exchange, tail)) => Self {
                exchange: exchange.to_string(),
                tail: tail.to_string(),
            },
            None => Self {
                exchange: DEFAULT_EXCHANGE.to_string(),
                tail: destination.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_slash() {
        let parsed = ParsedDestination::parse("fanout/broadcast/all");
        assert_eq!(parsed.exchange, "fanout");
        assert_eq!(parsed.tail, "broadcast/all");
    }

    #[test]
    fn bare_destination_uses_direct() {
        let parsed = ParsedDestination::parse("room");
        assert_eq!(parsed.exchange, DEFAULT_EXCHANGE);
        assert_eq!(parsed.tail, "room");
    }

    #[test]
    fn empty_tail_is_preserved() {
        let parsed = ParsedDestination::parse("direct/");
        assert_eq!(parsed.exchange, "direct");
        assert_eq!(parsed.tail, "");
    }
}
