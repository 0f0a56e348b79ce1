//! Subscription storage with event-type and scope indexes.
//!
//! [`SubscriptionRegistry`] owns every subscription record and keeps two
//! secondary indexes used by event matching: by event type and by scope.
//! All state lives behind one `RwLock`, so indexes can never drift from the
//! records. Matching is a pure read.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;

use super::subscription::{Subscription, SubscriptionFilter};
use super::{ConnectionId, Event, EventScope, SubscriptionId};

/// One subscription selected by [`SubscriptionRegistry::match_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchTarget {
    /// The matched subscription.
    pub subscription_id: SubscriptionId,
    /// The connection that owns it.
    pub connection_id: ConnectionId,
}

#[derive(Debug, Default)]
struct SubscriptionStore {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    by_event_type: HashMap<String, HashSet<SubscriptionId>>,
    by_scope: HashMap<EventScope, HashSet<SubscriptionId>>,
}

/// Central store for all active subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<SubscriptionStore>,
    sequence: AtomicU64,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription for `connection_id` and indexes it.
    ///
    /// Authorization and capacity checks happen in the delivery engine
    /// before this is called; the registry itself only stores.
    pub async fn insert(
        &self,
        connection_id: ConnectionId,
        event_type: impl Into<String>,
        scope: EventScope,
        filter: SubscriptionFilter,
    ) -> Subscription {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription::new(connection_id, event_type, scope, filter, sequence);
        let mut store = self.inner.write().await;
        store
            .by_event_type
            .entry(subscription.event_type.clone())
            .or_default()
            .insert(subscription.id);
        store
            .by_scope
            .entry(subscription.scope)
            .or_default()
            .insert(subscription.id);
        store
            .subscriptions
            .insert(subscription.id, subscription.clone());
        subscription
    }

    /// Removes a subscription, failing closed on ownership.
    ///
    /// Returns `false` unless the subscription exists **and** is owned by
    /// `caller`, so one connection can never unsubscribe another's
    /// registration.
    pub async fn remove(&self, caller: ConnectionId, id: SubscriptionId) -> bool {
        let mut store = self.inner.write().await;
        let owned = store
            .subscriptions
            .get(&id)
            .is_some_and(|sub| sub.connection_id == caller);
        if !owned {
            return false;
        }
        detach(&mut store, id);
        true
    }

    /// Removes every subscription owned by `connection_id`, returning the
    /// removed ids. Used by connection teardown.
    pub async fn remove_for_connection(&self, connection_id: ConnectionId) -> Vec<SubscriptionId> {
        let mut store = self.inner.write().await;
        let ids: Vec<SubscriptionId> = store
            .subscriptions
            .values()
            .filter(|sub| sub.connection_id == connection_id)
            .map(|sub| sub.id)
            .collect();
        for id in &ids {
            detach(&mut store, *id);
        }
        ids
    }

    /// Returns a snapshot of the subscription record.
    pub async fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.inner.read().await.subscriptions.get(&id).cloned()
    }

    /// Finds every subscription matching `event`, ordered by registration
    /// sequence. Candidates are the event-type index intersected with the
    /// scope index; each candidate's filter is then evaluated against the
    /// event payload. Pure read, no state mutation.
    pub async fn match_event(&self, event: &Event) -> Vec<MatchTarget> {
        let store = self.inner.read().await;
        let Some(by_type) = store.by_event_type.get(&event.event_type) else {
            return Vec::new();
        };
        let Some(by_scope) = store.by_scope.get(&event.scope) else {
            return Vec::new();
        };

        let mut matched: Vec<(u64, MatchTarget)> = by_type
            .intersection(by_scope)
            .filter_map(|id| store.subscriptions.get(id))
            .filter(|sub| sub.filter.matches(&event.payload))
            .map(|sub| {
                (
                    sub.sequence,
                    MatchTarget {
                        subscription_id: sub.id,
                        connection_id: sub.connection_id,
                    },
                )
            })
            .collect();
        matched.sort_unstable_by_key(|(sequence, _)| *sequence);
        matched.into_iter().map(|(_, target)| target).collect()
    }

    /// Stamps a successful delivery on the subscription's match counters.
    pub async fn record_match(&self, id: SubscriptionId) {
        let mut store = self.inner.write().await;
        if let Some(sub) = store.subscriptions.get_mut(&id) {
            sub.match_count = sub.match_count.saturating_add(1);
            sub.last_matched = Some(Utc::now());
        }
    }

    /// Number of active subscriptions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.subscriptions.len()
    }

    /// Returns `true` if no subscriptions are registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.subscriptions.is_empty()
    }

    /// Subscription counts grouped by event type.
    pub async fn count_by_event_type(&self) -> HashMap<String, usize> {
        let store = self.inner.read().await;
        store
            .by_event_type
            .iter()
            .map(|(event_type, set)| (event_type.clone(), set.len()))
            .collect()
    }

    /// Subscription counts grouped by scope wire name.
    pub async fn count_by_scope(&self) -> HashMap<String, usize> {
        let store = self.inner.read().await;
        store
            .by_scope
            .iter()
            .map(|(scope, set)| (scope.as_str().to_string(), set.len()))
            .collect()
    }

    /// Ids of the subscriptions owned by `connection_id`, for invariant
    /// checks against the connection's back-reference set.
    pub async fn ids_for_connection(&self, connection_id: ConnectionId) -> HashSet<SubscriptionId> {
        self.inner
            .read()
            .await
            .subscriptions
            .values()
            .filter(|sub| sub.connection_id == connection_id)
            .map(|sub| sub.id)
            .collect()
    }
}

fn detach(store: &mut SubscriptionStore, id: SubscriptionId) {
    let Some(sub) = store.subscriptions.remove(&id) else {
        return;
    };
    if let Some(set) = store.by_event_type.get_mut(&sub.event_type) {
        set.remove(&id);
        if set.is_empty() {
            store.by_event_type.remove(&sub.event_type);
        }
    }
    if let Some(set) = store.by_scope.get_mut(&sub.scope) {
        set.remove(&id);
        if set.is_empty() {
            store.by_scope.remove(&sub.scope);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_event(event_type: &str, scope: EventScope, payload: serde_json::Value) -> Event {
        Event::new(event_type, scope, payload)
    }

    #[tokio::test]
    async fn insert_indexes_by_type_and_scope() {
        let registry = SubscriptionRegistry::new();
        let conn = ConnectionId::new();
        let sub = registry
            .insert(conn, "order.created", EventScope::User, SubscriptionFilter::new())
            .await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(
            registry.count_by_event_type().await.get("order.created"),
            Some(&1)
        );
        assert_eq!(registry.count_by_scope().await.get("user"), Some(&1));
        assert_eq!(registry.get(sub.id).await.map(|s| s.connection_id), Some(conn));
    }

    #[tokio::test]
    async fn match_requires_type_and_scope_intersection() {
        let registry = SubscriptionRegistry::new();
        let conn = ConnectionId::new();
        registry
            .insert(conn, "order.created", EventScope::User, SubscriptionFilter::new())
            .await;

        let same = make_event("order.created", EventScope::User, json!({}));
        assert_eq!(registry.match_event(&same).await.len(), 1);

        let wrong_type = make_event("order.deleted", EventScope::User, json!({}));
        assert!(registry.match_event(&wrong_type).await.is_empty());

        let wrong_scope = make_event("order.created", EventScope::Room, json!({}));
        assert!(registry.match_event(&wrong_scope).await.is_empty());
    }

    #[tokio::test]
    async fn match_applies_filters() {
        let registry = SubscriptionRegistry::new();
        let conn = ConnectionId::new();
        registry
            .insert(
                conn,
                "chat.message",
                EventScope::Room,
                SubscriptionFilter::new().with_field("room", json!("A")),
            )
            .await;

        let in_room = make_event("chat.message", EventScope::Room, json!({"room": "A"}));
        assert_eq!(registry.match_event(&in_room).await.len(), 1);

        let other_room = make_event("chat.message", EventScope::Room, json!({"room": "B"}));
        assert!(registry.match_event(&other_room).await.is_empty());

        let no_room = make_event("chat.message", EventScope::Room, json!({}));
        assert!(registry.match_event(&no_room).await.is_empty());
    }

    #[tokio::test]
    async fn match_order_follows_registration_sequence() {
        let registry = SubscriptionRegistry::new();
        let first = registry
            .insert(
                ConnectionId::new(),
                "tick",
                EventScope::Global,
                SubscriptionFilter::new(),
            )
            .await;
        let second = registry
            .insert(
                ConnectionId::new(),
                "tick",
                EventScope::Global,
                SubscriptionFilter::new(),
            )
            .await;

        let targets = registry
            .match_event(&make_event("tick", EventScope::Global, json!({})))
            .await;
        let ids: Vec<SubscriptionId> = targets.iter().map(|t| t.subscription_id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn remove_fails_closed_on_ownership() {
        let registry = SubscriptionRegistry::new();
        let owner = ConnectionId::new();
        let stranger = ConnectionId::new();
        let sub = registry
            .insert(owner, "tick", EventScope::User, SubscriptionFilter::new())
            .await;

        assert!(!registry.remove(stranger, sub.id).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(owner, sub.id).await);
        assert!(registry.is_empty().await);
        assert!(!registry.remove(owner, sub.id).await);
    }

    #[tokio::test]
    async fn remove_for_connection_clears_all_and_indexes() {
        let registry = SubscriptionRegistry::new();
        let conn = ConnectionId::new();
        let other = ConnectionId::new();
        for event_type in ["a", "b", "c"] {
            registry
                .insert(conn, event_type, EventScope::User, SubscriptionFilter::new())
                .await;
        }
        registry
            .insert(other, "a", EventScope::User, SubscriptionFilter::new())
            .await;

        let removed = registry.remove_for_connection(conn).await;
        assert_eq!(removed.len(), 3);
        assert!(registry.ids_for_connection(conn).await.is_empty());
        assert_eq!(registry.len().await, 1);
        // Index buckets emptied by the teardown are dropped entirely.
        assert!(!registry.count_by_event_type().await.contains_key("b"));
    }

    #[tokio::test]
    async fn record_match_increments_counters() {
        let registry = SubscriptionRegistry::new();
        let sub = registry
            .insert(
                ConnectionId::new(),
                "tick",
                EventScope::User,
                SubscriptionFilter::new(),
            )
            .await;
        registry.record_match(sub.id).await;
        registry.record_match(sub.id).await;

        let Some(stored) = registry.get(sub.id).await else {
            panic!("subscription missing");
        };
        assert_eq!(stored.match_count, 2);
        assert!(stored.last_matched.is_some());
    }
}
