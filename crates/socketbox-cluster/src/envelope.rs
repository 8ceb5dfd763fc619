// Management envelopes carried over peer links. Each frame is a tag
// prefix followed by an opaque payload; receivers match on the prefix and
// hand the remainder to the matching handler.
use serde::{Deserialize, Serialize};

pub const MESSAGE_REBROADCAST: &str = "__message_rebroadcast__";
pub const STOMP_MESSAGE_REBROADCAST: &str = "__STOMP_message_rebroadcast__";
pub const PEER_DISCOVERED: &str = "__peer_discovered__";
pub const RPC_REQUEST: &str = "__rpc_request__";
pub const RPC_RESPONSE: &str = "__rpc_response__";

/// A recognized management frame, borrowing its payload from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope<'a> {
    /// Raw text replayed to every local client channel.
    MessageRebroadcast(&'a str),
    /// A SEND from another node, replayed through the broker with
    /// rebroadcast disabled.
    StompRebroadcast(&'a str),
    /// A peer name this node should ensure a link to.
    PeerDiscovered(&'a str),
    RpcRequest(&'a str),
    RpcResponse(&'a str),
}

pub fn parse(text: &str) -> Option<Envelope<'_>> {
    if let Some(payload) = text.strip_prefix(STOMP_MESSAGE_REBROADCAST) {
        // Checked before the plain rebroadcast tag: prefixes are distinct,
        // so order only matters for readability.
        return Some(Envelope::StompRebroadcast(payload));
    }
    if let Some(payload) = text.strip_prefix(MESSAGE_REBROADCAST) {
        return Some(Envelope::MessageRebroadcast(payload));
    }
    if let Some(payload) = text.strip_prefix(PEER_DISCOVERED) {
        return Some(Envelope::PeerDiscovered(payload));
    }
    if let Some(payload) = text.strip_prefix(RPC_REQUEST) {
        return Some(Envelope::RpcRequest(payload));
    }
    if let Some(payload) = text.strip_prefix(RPC_RESPONSE) {
        return Some(Envelope::RpcResponse(payload));
    }
    None
}

pub fn wrap(tag: &str, payload: &str) -> String {
    format!("{tag}{payload}")
}

/// Payload of a `__STOMP_message_rebroadcast__` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StompRebroadcast {
    pub destination: String,
    #[serde(rename = "messageData")]
    pub message_data: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// Payload of a `__rpc_request__` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub operation: String,
    /// The sender's advertised URL, used to address the response.
    #[serde(rename = "peerName")]
    pub peer_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    pub id: String,
}

/// Payload of a `__rpc_response__` frame. `execution_time_ms` is stamped
/// by the receiver when the response arrives, not carried on the wire by
/// the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default)]
    pub result: serde_json::Value,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "executionTimeMS", skip_serializing_if = "Option::is_none", default)]
    pub execution_time_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_matched_exactly() {
        assert_eq!(
            parse("__message_rebroadcast__hello"),
            Some(Envelope::MessageRebroadcast("hello"))
        );
        assert_eq!(
            parse("__STOMP_message_rebroadcast__{}"),
            Some(Envelope::StompRebroadcast("{}"))
        );
        assert_eq!(
            parse("__peer_discovered__ws://node:9000/"),
            Some(Envelope::PeerDiscovered("ws://node:9000/"))
        );
        assert_eq!(parse("__rpc_request__{}"), Some(Envelope::RpcRequest("{}")));
        assert_eq!(parse("__rpc_response__{}"), Some(Envelope::RpcResponse("{}")));
    }

    #[test]
    fn unknown_payloads_are_rejected() {
        assert_eq!(parse("PING"), None);
        assert_eq!(parse("__rpc__{}"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn wrap_is_the_inverse_of_parse() {
        let text = wrap(PEER_DISCOVERED, "ws://a:1/");
        assert_eq!(parse(&text), Some(Envelope::PeerDiscovered("ws://a:1/")));
    }

    #[test]
    fn rpc_request_json_round_trip() {
        let request = RpcRequest {
            operation: "uptime".into(),
            peer_name: "ws://node-1:9000/".into(),
            args: serde_json::json!({}),
            id: "abc".into(),
        };
        let json = serde_json::to_string(&request).expect("encode");
        assert!(json.contains("\"peerName\""));
        let decoded: RpcRequest = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded.operation, "uptime");
        assert_eq!(decoded.id, "abc");
    }

    #[test]
    fn rpc_response_execution_time_is_not_serialized_when_absent() {
        let response = RpcResponse {
            id: "abc".into(),
            result: serde_json::json!(42),
            success: true,
            error: None,
            execution_time_ms: None,
        };
        let json = serde_json::to_string(&response).expect("encode");
        assert!(!json.contains("executionTimeMS"));
        let decoded: RpcResponse = serde_json::from_str(&json).expect("decode");
        assert!(decoded.success);
        assert_eq!(decoded.result, serde_json::json!(42));
    }

    #[test]
    fn stomp_rebroadcast_uses_wire_field_names() {
        let payload = StompRebroadcast {
            destination: "direct/room".into(),
            message_data: "hi".into(),
            headers: vec![("publisher-id".into(), "7".into())],
        };
        let json = serde_json::to_string(&payload).expect("encode");
        assert!(json.contains("\"messageData\""));
        let decoded: StompRebroadcast = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded.destination, "direct/room");
        assert_eq!(decoded.headers.len(), 1);
    }
}
