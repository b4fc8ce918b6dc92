//! Protocol message types.
//!
//! This module defines the messages exchanged with consumers and producers:
//! - Server → Client: Hello, Delta, full documents, path lists
//! - Client → Server: deltas, documents, Get, List, Subscribe, Unsubscribe
//!
//! Messages are JSON, carried in WebSocket text frames or one per line on TCP.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use signalk_hub_core::{Delta, GetRequest, ListRequest, ListResponse};

/// Subscription request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub context: String,
    pub subscribe: Vec<Subscription>,
}

/// A single subscription specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub path: String,
    /// Delivery period in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<SubscriptionFormat>,
}

/// Payload shape of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionFormat {
    /// Changed leaves only, as a Signal K delta.
    #[default]
    Delta,
    /// The subscribed subtrees, shaped like the canonical document.
    Full,
}

/// Unsubscribe request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub context: String,
    pub unsubscribe: Vec<UnsubscribeSpec>,
}

/// Unsubscribe specification. `"*"` removes every subscription of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeSpec {
    pub path: String,
}

impl UnsubscribeSpec {
    pub const ALL: &'static str = "*";

    pub fn is_all(&self) -> bool {
        self.path == Self::ALL
    }
}

// ============================================================================
// Hello Message (Server → Client on connect)
// ============================================================================

/// Hello message sent by server immediately on WebSocket connection.
///
/// This message identifies the server and provides the client's context.
///
/// # Example
/// ```json
/// {
///   "name": "signalk-hub",
///   "version": "1.7.0",
///   "self": "vessels.urn:mrn:signalk:uuid:c0d79334-4e25-4245-8892-54e8ccc8021d",
///   "roles": ["main"],
///   "timestamp": "2024-01-17T10:30:00.000Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Server name identifier.
    pub name: String,

    /// SignalK protocol version supported.
    pub version: String,

    /// The "self" context identifier for this vessel.
    #[serde(rename = "self")]
    pub self_context: String,

    /// Server roles (e.g., ["main"], ["main", "master"]).
    pub roles: Vec<String>,

    /// Current server timestamp in ISO 8601 format.
    pub timestamp: String,
}

impl HelloMessage {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        self_context: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            self_context: self_context.into(),
            roles: vec!["main".to_string()],
            timestamp: signalk_hub_core::format_timestamp(&chrono::Utc::now()),
        }
    }
}

// ============================================================================
// Unified Message Enums
// ============================================================================

/// Messages that can be sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Hello message sent on connection.
    Hello(HelloMessage),

    /// Changed leaves, in the 1.x delta form.
    Delta(Delta),

    /// Response to a LIST query.
    PathList(ListResponse),

    /// A document shaped like the canonical model (full subscriptions, GET).
    Full(Value),
}

/// A decoded inbound message, classified by the members it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A whole document starting at `vessels`.
    Document(Value),

    /// A delta, flat or 1.x. Kept as JSON; the merger does the decoding.
    Delta(Value),

    Get(GetRequest),

    List(ListRequest),

    Subscribe(SubscribeRequest),

    Unsubscribe(UnsubscribeRequest),
}

impl InboundMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Document(_) => "document",
            InboundMessage::Delta(_) => "delta",
            InboundMessage::Get(_) => "get",
            InboundMessage::List(_) => "list",
            InboundMessage::Subscribe(_) => "subscribe",
            InboundMessage::Unsubscribe(_) => "unsubscribe",
        }
    }
}

// ============================================================================
// Discovery Endpoint
// ============================================================================

/// Discovery response for `/signalk` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub endpoints: DiscoveryEndpoints,
    pub server: DiscoveryServer,
}

/// Endpoints advertised in discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEndpoints {
    pub v1: DiscoveryV1,
}

/// Version 1 API endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryV1 {
    pub version: String,
    #[serde(rename = "signalk-http")]
    pub signalk_http: String,
    #[serde(rename = "signalk-ws")]
    pub signalk_ws: String,
    #[serde(rename = "signalk-tcp")]
    pub signalk_tcp: String,
}

/// Server identification in discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryServer {
    pub id: String,
    pub version: String,
}

impl DiscoveryResponse {
    /// Create a discovery response for the given host and listener ports.
    pub fn new(name: &str, version: &str, host: &str, http_port: u16, ws_port: u16, tcp_port: u16) -> Self {
        Self {
            endpoints: DiscoveryEndpoints {
                v1: DiscoveryV1 {
                    version: version.to_string(),
                    signalk_http: format!("http://{}:{}/signalk/v1/api", host, http_port),
                    signalk_ws: format!("ws://{}:{}/signalk/v1/stream", host, ws_port),
                    signalk_tcp: format!("tcp://{}:{}", host, tcp_port),
                },
            },
            server: DiscoveryServer {
                id: name.to_string(),
                version: version.to_string(),
            },
        }
    }
}
