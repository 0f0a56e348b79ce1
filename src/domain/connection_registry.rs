//! Concurrent connection storage with per-connection fine-grained locking.
//!
//! [`ConnectionRegistry`] stores every attached connection in a `HashMap`
//! where each entry is individually protected by a
//! [`tokio::sync::RwLock`], alongside user and organization indexes kept
//! consistent under the outer lock. Lock order across registries is always
//! connection registry before subscription registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::connection::{Connection, ConnectionState};
use super::{ConnectionId, SubscriptionId};
use crate::error::GatewayError;

/// Snapshot of a connection taken at removal time, used for subscription
/// teardown and disconnect statistics.
#[derive(Debug, Clone)]
pub struct DisconnectSummary {
    /// The removed connection.
    pub id: ConnectionId,
    /// User index entry that was cleared, if any.
    pub user_id: Option<String>,
    /// Organization index entry that was cleared, if any.
    pub organization_id: Option<String>,
    /// Attach time, for duration statistics.
    pub connected_at: DateTime<Utc>,
    /// Messages delivered over the connection's lifetime.
    pub messages_sent: u64,
    /// Subscriptions the connection owned at removal.
    pub subscriptions: HashSet<SubscriptionId>,
}

#[derive(Debug, Default)]
struct ConnectionStore {
    connections: HashMap<ConnectionId, Arc<RwLock<Connection>>>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
    by_org: HashMap<String, HashSet<ConnectionId>>,
}

/// Central store for all attached connections.
///
/// Uses a `RwLock<HashMap<...>>` for the outer store and per-entry
/// `Arc<RwLock<Connection>>` for fine-grained per-connection locking.
///
/// # Concurrency
///
/// - Lookups clone the entry `Arc` and release the outer lock before
///   touching the connection.
/// - Index mutations (`authenticate`, `remove`) hold the outer write lock
///   so indexes never drift from records.
/// - The outer lock may be held while locking an entry, never the reverse.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<ConnectionStore>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly created connection record.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the identifier is already
    /// present (should never happen with UUID v4).
    pub async fn insert(&self, connection: Connection) -> Result<ConnectionId, GatewayError> {
        let id = connection.id;
        let mut store = self.inner.write().await;
        if store.connections.contains_key(&id) {
            return Err(GatewayError::Internal(format!(
                "connection {id} already registered"
            )));
        }
        store
            .connections
            .insert(id, Arc::new(RwLock::new(connection)));
        Ok(id)
    }

    /// Returns a shared handle to the connection entry.
    pub async fn get(&self, id: ConnectionId) -> Option<Arc<RwLock<Connection>>> {
        self.inner.read().await.connections.get(&id).cloned()
    }

    /// Promotes a connection from `Connecting` to `Connected`.
    ///
    /// Returns `false` for unknown identifiers.
    pub async fn mark_connected(&self, id: ConnectionId) -> bool {
        let Some(entry) = self.get(id).await else {
            return false;
        };
        let mut conn = entry.write().await;
        if conn.state == ConnectionState::Connecting {
            conn.transition(ConnectionState::Connected);
        }
        true
    }

    /// Establishes (or overwrites) the connection's identity and re-indexes
    /// it under the new user and organization.
    ///
    /// Returns `false` without state change for unknown identifiers.
    pub async fn authenticate(
        &self,
        id: ConnectionId,
        user_id: String,
        organization_id: Option<String>,
        session_id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> bool {
        let mut store = self.inner.write().await;
        let Some(entry) = store.connections.get(&id).cloned() else {
            return false;
        };
        let mut conn = entry.write().await;

        // Re-authentication drops the previous index entries first.
        if let Some(old_user) = conn.user_id.take() {
            remove_index_entry(&mut store.by_user, &old_user, id);
        }
        if let Some(old_org) = conn.organization_id.take() {
            remove_index_entry(&mut store.by_org, &old_org, id);
        }

        store.by_user.entry(user_id.clone()).or_default().insert(id);
        if let Some(org) = &organization_id {
            store.by_org.entry(org.clone()).or_default().insert(id);
        }

        conn.user_id = Some(user_id);
        conn.organization_id = organization_id;
        conn.session_id = session_id;
        conn.metadata.extend(metadata);
        let next = if conn.subscriptions.is_empty() {
            ConnectionState::Authenticated
        } else {
            ConnectionState::Subscribed
        };
        conn.transition(next);
        true
    }

    /// Atomically removes a connection and its index entries.
    ///
    /// Idempotent under races: exactly one concurrent caller receives the
    /// summary, all others observe `None`. The record is moved through
    /// `Disconnecting` to `Disconnected` so that holders of the entry `Arc`
    /// see a terminal state.
    pub async fn remove(&self, id: ConnectionId) -> Option<DisconnectSummary> {
        let mut store = self.inner.write().await;
        let entry = store.connections.remove(&id)?;
        let mut conn = entry.write().await;
        conn.transition(ConnectionState::Disconnecting);

        if let Some(user) = &conn.user_id {
            remove_index_entry(&mut store.by_user, user, id);
        }
        if let Some(org) = &conn.organization_id {
            remove_index_entry(&mut store.by_org, org, id);
        }

        let summary = DisconnectSummary {
            id,
            user_id: conn.user_id.clone(),
            organization_id: conn.organization_id.clone(),
            connected_at: conn.connected_at,
            messages_sent: conn.messages_sent,
            subscriptions: conn.subscriptions.clone(),
        };
        conn.transition(ConnectionState::Disconnected);
        Some(summary)
    }

    /// Snapshot of the connection ids indexed under `user_id`.
    pub async fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the connection ids indexed under `organization_id`.
    pub async fn connections_for_organization(&self, organization_id: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_org
            .get(organization_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every connection id.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.inner.read().await.connections.keys().copied().collect()
    }

    /// Number of currently attached connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Returns `true` if no connections are attached.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    /// Number of connections in an authenticated state.
    pub async fn count_authenticated(&self) -> usize {
        let entries: Vec<_> = {
            let store = self.inner.read().await;
            store.connections.values().cloned().collect()
        };
        let mut count = 0;
        for entry in entries {
            if entry.read().await.state.is_authenticated() {
                count += 1;
            }
        }
        count
    }
}

fn remove_index_entry(
    index: &mut HashMap<String, HashSet<ConnectionId>>,
    key: &str,
    id: ConnectionId,
) {
    if let Some(set) = index.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}
