//! WebSocket message types: inbound parsing and the outbound envelope.
//!
//! Inbound messages are parsed into the closed [`ClientMessage`] union with
//! an exhaustive dispatch on the `type` tag; unknown tags are rejected by
//! name. Outbound traffic always uses the [`ServerMessage`] envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EventScope, SubscriptionFilter, SubscriptionId};
use crate::error::GatewayError;

/// Raw inbound envelope: one JSON object per WebSocket text frame.
#[derive(Debug, Clone, Deserialize)]
struct ClientEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    message_id: Option<String>,
}

/// Parsed client message, one variant per supported `type` tag.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Liveness probe / heartbeat acknowledgment.
    Ping,
    /// Authentication request; the payload goes to the credential
    /// validator untouched.
    Auth {
        /// Credential payload (claims, token, identity attributes).
        payload: serde_json::Value,
    },
    /// Event stream registration.
    Subscribe {
        /// Event type to subscribe to.
        event_type: String,
        /// Audience scope; defaults to `user` when omitted.
        scope: EventScope,
        /// Optional field filter.
        filter: SubscriptionFilter,
    },
    /// Removal of a previously registered subscription.
    Unsubscribe {
        /// The subscription to remove; must be owned by the caller.
        subscription_id: SubscriptionId,
    },
    /// Application data; echoed back to the sender.
    Data {
        /// Opaque payload.
        payload: serde_json::Value,
    },
}

/// A [`ClientMessage`] together with the client's optional `message_id`,
/// used to correlate the response envelope.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// The dispatched message.
    pub message: ClientMessage,
    /// Client-provided correlation id, if any.
    pub message_id: Option<String>,
}

/// Parses one inbound text frame.
///
/// # Errors
///
/// - [`GatewayError::InvalidJson`] when the frame is not valid JSON.
/// - [`GatewayError::UnknownMessageType`] naming an unrecognized tag.
/// - [`GatewayError::InvalidMessage`] when a known tag's payload fails
///   validation.
pub fn parse_client_message(text: &str) -> Result<ParsedMessage, GatewayError> {
    let envelope: ClientEnvelope =
        serde_json::from_str(text).map_err(|_| GatewayError::InvalidJson)?;

    let message = match envelope.msg_type.as_str() {
        "ping" => ClientMessage::Ping,
        "auth" => ClientMessage::Auth {
            payload: envelope.payload,
        },
        "subscribe" => parse_subscribe(&envelope.payload)?,
        "unsubscribe" => parse_unsubscribe(&envelope.payload)?,
        "data" => ClientMessage::Data {
            payload: envelope.payload,
        },
        other => return Err(GatewayError::UnknownMessageType(other.to_string())),
    };

    Ok(ParsedMessage {
        message,
        message_id: envelope.message_id,
    })
}

fn parse_subscribe(payload: &serde_json::Value) -> Result<ClientMessage, GatewayError> {
    let event_type = payload
        .get("event_type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| GatewayError::InvalidMessage("missing event_type".to_string()))?
        .to_string();

    let scope = match payload.get("scope").and_then(serde_json::Value::as_str) {
        Some(raw) => raw.parse().map_err(GatewayError::InvalidMessage)?,
        None => EventScope::User,
    };

    let filter = match payload.get("filters") {
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::InvalidMessage(format!("invalid filters: {e}")))?,
        None => SubscriptionFilter::new(),
    };

    Ok(ClientMessage::Subscribe {
        event_type,
        scope,
        filter,
    })
}

fn parse_unsubscribe(payload: &serde_json::Value) -> Result<ClientMessage, GatewayError> {
    let subscription_id = payload
        .get("subscription_id")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse::<uuid::Uuid>().ok())
        .ok_or_else(|| {
            GatewayError::InvalidMessage("missing or invalid subscription_id".to_string())
        })?;
    Ok(ClientMessage::Unsubscribe {
        subscription_id: SubscriptionId::from_uuid(subscription_id),
    })
}

/// Discriminator for outbound message types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageType {
    /// Authentication accepted; payload carries capability limits.
    AuthSuccess,
    /// Authentication rejected.
    AuthFailed,
    /// Subscription registered; payload carries the subscription record.
    SubscriptionSuccess,
    /// Subscription refused.
    SubscriptionFailed,
    /// Welcome notices, echoes, and event payloads.
    Data,
    /// Server liveness probe (and ping reply).
    Heartbeat,
    /// Protocol or validation error.
    Error,
    /// Send admission denied; payload carries `retry_after_seconds`.
    RateLimit,
}

/// Outbound server envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: ServerMessageType,
    /// Event type for `data` event deliveries, `null` otherwise.
    pub event_type: Option<String>,
    /// Variant-specific payload.
    pub payload: serde_json::Value,
    /// ISO-8601 timestamp.
    pub timestamp: DateTime<Utc>,
    /// Server-generated message id.
    pub message_id: String,
    /// Client `message_id` this envelope answers, if any.
    pub correlation_id: Option<String>,
    /// Free-form envelope metadata (e.g. delivery scope).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ServerMessage {
    /// Creates an envelope of `msg_type` with the given payload.
    #[must_use]
    pub fn new(msg_type: ServerMessageType, payload: serde_json::Value) -> Self {
        Self {
            msg_type,
            event_type: None,
            payload,
            timestamp: Utc::now(),
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Sets the correlation id from a client `message_id`.
    #[must_use]
    pub fn correlated(mut self, message_id: Option<String>) -> Self {
        self.correlation_id = message_id;
        self
    }

    /// A `data` envelope (welcome notices and echoes).
    #[must_use]
    pub fn data(payload: serde_json::Value) -> Self {
        Self::new(ServerMessageType::Data, payload)
    }

    /// A `data` envelope carrying a matched event.
    #[must_use]
    pub fn event(event_type: &str, scope: EventScope, payload: serde_json::Value) -> Self {
        let mut msg = Self::new(ServerMessageType::Data, payload);
        msg.event_type = Some(event_type.to_string());
        msg.metadata
            .insert("scope".to_string(), serde_json::json!(scope.as_str()));
        msg
    }

    /// A `heartbeat` envelope.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(ServerMessageType::Heartbeat, serde_json::json!({}))
    }

    /// An `error` envelope carrying the error's wire code and message.
    #[must_use]
    pub fn error(err: &GatewayError) -> Self {
        Self::new(
            ServerMessageType::Error,
            serde_json::json!({
                "code": err.error_code(),
                "message": err.to_string(),
            }),
        )
    }

    /// A `rate_limit` envelope telling the client when to retry.
    #[must_use]
    pub fn rate_limit(retry_after_secs: u64) -> Self {
        Self::new(
            ServerMessageType::RateLimit,
            serde_json::json!({ "retry_after_seconds": retry_after_secs }),
        )
    }

    /// Serializes the envelope to its wire form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
