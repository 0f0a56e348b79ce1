//! Connection records and the connection lifecycle state machine.
//!
//! One [`Connection`] exists per attached client transport. The record owns
//! the transport handle (a bounded mpsc sender drained by the socket writer
//! task), identity attributes once authenticated, liveness timestamps, the
//! rate-limit bucket, and back-references to its subscriptions.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::{ConnectionId, SubscriptionId, TokenBucket};
use crate::ws::messages::ServerMessage;

/// Metadata key holding the elevated-capability flag required for
/// global-scope subscriptions.
pub const ELEVATED_CAPABILITY: &str = "elevated";

/// Lifecycle state of a connection.
///
/// `Connecting → Connected → Authenticated → Subscribed`, with
/// `Disconnecting → Disconnected` as the terminal path and `Error`
/// reachable from any non-terminal state. `Subscribed` is not sticky: it
/// means "has at least one active subscription" and demotes back to
/// `Authenticated` when the last subscription is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport attached, handshake not yet acknowledged.
    Connecting,
    /// Handshake complete, welcome delivered, not authenticated.
    Connected,
    /// Identity established and indexed.
    Authenticated,
    /// Authenticated with at least one active subscription.
    Subscribed,
    /// Teardown in progress.
    Disconnecting,
    /// Terminal; the identifier is never reused.
    Disconnected,
    /// Transport or internal failure; teardown follows.
    Error,
}

impl ConnectionState {
    /// `true` once the connection has established an identity.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Subscribed)
    }

    /// `true` if new subscriptions may be registered in this state.
    ///
    /// `Disconnecting`, `Disconnected`, and `Error` uniformly reject.
    #[must_use]
    pub const fn accepts_subscriptions(&self) -> bool {
        self.is_authenticated()
    }

    /// `true` for states on the teardown path.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnecting | Self::Disconnected | Self::Error)
    }
}

/// One logical client attachment to the gateway.
#[derive(Debug)]
pub struct Connection {
    /// Server-generated identifier, never reused.
    pub id: ConnectionId,
    /// Outbound transport handle; the paired receiver is drained by the
    /// socket writer task.
    sender: mpsc::Sender<ServerMessage>,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// User identity, set by authentication.
    pub user_id: Option<String>,
    /// Organization identity, set by authentication.
    pub organization_id: Option<String>,
    /// Session identity, set by authentication.
    pub session_id: Option<String>,
    /// Transport attach time.
    pub connected_at: DateTime<Utc>,
    /// Last client-originated activity (or state transition).
    pub last_activity: DateTime<Utc>,
    /// Last server-initiated heartbeat probe.
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    /// Last client heartbeat acknowledgment (ping).
    pub last_heartbeat_ack: Option<DateTime<Utc>>,
    /// Messages delivered to this connection.
    pub messages_sent: u64,
    /// Identifiers of subscriptions owned by this connection
    /// (back-references; the subscription registry owns the records).
    pub subscriptions: HashSet<SubscriptionId>,
    /// Rate-limit bucket for the send path.
    pub bucket: TokenBucket,
    /// Free-form attributes (capability flags, client info).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Connection {
    /// Creates a record in `Connecting` state with a full rate bucket.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
        rate_capacity: u32,
        rate_window_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            sender,
            state: ConnectionState::Connecting,
            user_id: None,
            organization_id: None,
            session_id: None,
            connected_at: now,
            last_activity: now,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            messages_sent: 0,
            subscriptions: HashSet::new(),
            bucket: TokenBucket::new(rate_capacity, rate_window_secs, now),
            metadata: HashMap::new(),
        }
    }

    /// Returns the outbound transport handle.
    #[must_use]
    pub const fn transport(&self) -> &mpsc::Sender<ServerMessage> {
        &self.sender
    }

    /// Moves the connection to `next` and stamps `last_activity`.
    pub fn transition(&mut self, next: ConnectionState) {
        self.state = next;
        self.last_activity = Utc::now();
    }

    /// Records client-originated activity.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// `true` if the metadata carries the elevated capability flag.
    #[must_use]
    pub fn is_elevated(&self) -> bool {
        self.metadata
            .get(ELEVATED_CAPABILITY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Time this connection has been attached.
    #[must_use]
    pub fn duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.connected_at
    }
}
