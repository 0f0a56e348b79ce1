//! Delivery engine: connection lifecycle, subscriptions, and fan-out.
//!
//! [`RealtimeEngine`] coordinates the two registries, the per-connection
//! rate limiter, and the statistics collector. It is explicitly
//! constructed from a [`GatewayConfig`], shared as an `Arc` by the
//! WebSocket layer and by producers, and owns its background tasks so that
//! shutdown can cancel and join them deterministically.
//!
//! Every mutation follows the pattern: acquire lock → update record →
//! release → emit statistics. The transport write is a non-blocking
//! enqueue on the connection's bounded outbound queue, so no registry or
//! connection lock is ever held across a socket write.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use super::auth::{AuthIdentity, ClaimsValidator, CredentialValidator};
use super::liveness::LivenessMonitor;
use super::stats::{DisconnectRecord, HealthReport, StatsCollector, StatsSnapshot};
use crate::config::GatewayConfig;
use crate::domain::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionState, Event, EventScope,
    Subscription, SubscriptionFilter, SubscriptionId, SubscriptionRegistry,
};
use crate::error::GatewayError;
use crate::ws::messages::{
    ClientMessage, ServerMessage, ServerMessageType, parse_client_message,
};

/// Disconnect reasons recorded in statistics.
pub mod reason {
    /// Client closed the socket or the read side failed.
    pub const CLIENT_DISCONNECT: &str = "client_disconnect";
    /// Outbound write failed or the delivery queue overflowed.
    pub const SEND_ERROR: &str = "send_error";
    /// The read side of the transport failed abruptly.
    pub const TRANSPORT_ERROR: &str = "transport_error";
    /// Liveness monitor evicted a silent connection.
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
    /// Engine teardown force-disconnected the connection.
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

/// Coordination core for connections, subscriptions, and delivery.
#[derive(Debug)]
pub struct RealtimeEngine {
    config: GatewayConfig,
    connections: ConnectionRegistry,
    subscriptions: SubscriptionRegistry,
    stats: StatsCollector,
    validator: Arc<dyn CredentialValidator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cached_health: RwLock<Option<HealthReport>>,
}

impl RealtimeEngine {
    /// Creates an engine with the default claims-based validator.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        Self::with_validator(config, Arc::new(ClaimsValidator))
    }

    /// Creates an engine with a custom credential validator.
    #[must_use]
    pub fn with_validator(config: GatewayConfig, validator: Arc<dyn CredentialValidator>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            stats: StatsCollector::new(config.history_capacity),
            config,
            connections: ConnectionRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            validator,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            cached_health: RwLock::new(None),
        })
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Returns the connection registry.
    #[must_use]
    pub const fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Returns the subscription registry.
    #[must_use]
    pub const fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Returns the statistics collector.
    #[must_use]
    pub const fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    /// Registers a new connection for the given transport handle.
    ///
    /// The record is created in `Connecting`, promoted to `Connected`
    /// (the upgrade handshake has already completed by the time the
    /// transport exists), and a welcome notice is enqueued. The welcome
    /// bypasses the rate limiter: it is lifecycle traffic, not producer
    /// traffic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] on an identifier collision
    /// (should never happen with UUID v4).
    pub async fn register_connection(
        &self,
        transport: mpsc::Sender<ServerMessage>,
    ) -> Result<ConnectionId, GatewayError> {
        let connection = Connection::new(
            ConnectionId::new(),
            transport,
            self.config.rate_limit_max_messages,
            self.config.rate_limit_window_secs,
        );
        let id = self.connections.insert(connection).await?;
        self.stats.record_connected();
        self.connections.mark_connected(id).await;

        let welcome = ServerMessage::data(serde_json::json!({
            "message": "connected",
            "connection_id": id,
        }));
        if let Some(entry) = self.connections.get(id).await {
            let mut conn = entry.write().await;
            if conn.transport().try_send(welcome).is_ok() {
                conn.messages_sent += 1;
                drop(conn);
                self.stats.record_sent(Utc::now());
            }
        }
        tracing::debug!(connection = %id, "connection registered");
        Ok(id)
    }

    /// Establishes the connection's identity and indexes it.
    ///
    /// Returns `false` without state change for unknown connections.
    /// Re-authentication overwrites the identity and re-indexes.
    pub async fn authenticate(&self, id: ConnectionId, identity: AuthIdentity) -> bool {
        let user = identity.user_id.clone();
        let ok = self
            .connections
            .authenticate(
                id,
                identity.user_id,
                identity.organization_id,
                identity.session_id,
                identity.metadata,
            )
            .await;
        if ok {
            tracing::info!(connection = %id, user = %user, "connection authenticated");
        }
        ok
    }

    /// Registers a subscription for the connection.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ConnectionNotFound`] for unknown connections.
    /// - [`GatewayError::AuthenticationRequired`] unless the connection is
    ///   authenticated (teardown states uniformly reject).
    /// - [`GatewayError::SubscriptionLimitReached`] at the per-connection
    ///   cap.
    /// - [`GatewayError::ScopeNotPermitted`] when `Global` is requested
    ///   without the elevated capability, or `Organization` without an
    ///   organization identity.
    pub async fn subscribe(
        &self,
        id: ConnectionId,
        event_type: &str,
        scope: EventScope,
        filter: SubscriptionFilter,
    ) -> Result<Subscription, GatewayError> {
        let Some(entry) = self.connections.get(id).await else {
            return Err(GatewayError::ConnectionNotFound(*id.as_uuid()));
        };
        let mut conn = entry.write().await;

        if !conn.state.accepts_subscriptions() {
            return Err(GatewayError::AuthenticationRequired);
        }
        if conn.subscriptions.len() >= self.config.max_subscriptions_per_connection {
            return Err(GatewayError::SubscriptionLimitReached {
                max: self.config.max_subscriptions_per_connection,
            });
        }
        match scope {
            EventScope::Global if !conn.is_elevated() => {
                return Err(GatewayError::ScopeNotPermitted {
                    scope,
                    reason: "requires the elevated capability".to_string(),
                });
            }
            EventScope::Organization if conn.organization_id.is_none() => {
                return Err(GatewayError::ScopeNotPermitted {
                    scope,
                    reason: "connection has no organization".to_string(),
                });
            }
            _ => {}
        }

        // The connection lock is held across the registry insert so a
        // racing disconnect cannot slip between the insert and the
        // back-reference update.
        let subscription = self
            .subscriptions
            .insert(id, event_type, scope, filter)
            .await;
        conn.subscriptions.insert(subscription.id);
        conn.transition(ConnectionState::Subscribed);
        drop(conn);

        tracing::debug!(
            connection = %id,
            subscription = %subscription.id,
            event_type,
            scope = %scope,
            "subscription registered"
        );
        Ok(subscription)
    }

    /// Removes a subscription owned by the calling connection.
    ///
    /// Fails closed: returns `false` unless the subscription exists and
    /// belongs to `id`. Dropping the last subscription demotes the
    /// connection back to `Authenticated`.
    pub async fn unsubscribe(&self, id: ConnectionId, subscription_id: SubscriptionId) -> bool {
        let Some(entry) = self.connections.get(id).await else {
            return false;
        };
        let mut conn = entry.write().await;
        if !self.subscriptions.remove(id, subscription_id).await {
            return false;
        }
        conn.subscriptions.remove(&subscription_id);
        if conn.subscriptions.is_empty() && conn.state == ConnectionState::Subscribed {
            conn.transition(ConnectionState::Authenticated);
        } else {
            conn.touch();
        }
        true
    }

    /// Delivers one message to one connection through rate-limit admission.
    ///
    /// A denied send enqueues a `rate_limit` notice (which bypasses the
    /// limiter) and returns `false` without delivering the message. A full
    /// or closed outbound queue is a transport write failure: the
    /// connection is disconnected with reason `send_error` and the send is
    /// never retried.
    pub async fn send_to_connection(&self, id: ConnectionId, message: ServerMessage) -> bool {
        let Some(entry) = self.connections.get(id).await else {
            return false;
        };
        let mut conn = entry.write().await;
        if conn.state.is_terminal() {
            return false;
        }

        let now = Utc::now();
        if !conn.bucket.admit(now) {
            self.stats.record_rate_limited();
            let retry = conn.bucket.retry_after_secs(now);
            let _ = conn.transport().try_send(ServerMessage::rate_limit(retry));
            return false;
        }

        match conn.transport().try_send(message) {
            Ok(()) => {
                conn.last_activity = now;
                conn.messages_sent += 1;
                drop(conn);
                self.stats.record_sent(now);
                true
            }
            Err(_) => {
                drop(conn);
                self.stats.record_send_failure(id, reason::SEND_ERROR);
                self.disconnect(id, reason::SEND_ERROR).await;
                false
            }
        }
    }

    /// Sends a liveness probe, bypassing the rate limiter.
    ///
    /// Stamps `last_heartbeat_sent` but deliberately leaves
    /// `last_activity` untouched: only client-originated traffic keeps a
    /// connection alive.
    pub async fn send_heartbeat(&self, id: ConnectionId) -> bool {
        let Some(entry) = self.connections.get(id).await else {
            return false;
        };
        let mut conn = entry.write().await;
        if conn.state.is_terminal() {
            return false;
        }
        match conn.transport().try_send(ServerMessage::heartbeat()) {
            Ok(()) => {
                conn.last_heartbeat_sent = Some(Utc::now());
                conn.messages_sent += 1;
                drop(conn);
                self.stats.record_sent(Utc::now());
                true
            }
            Err(_) => {
                drop(conn);
                self.stats.record_send_failure(id, reason::SEND_ERROR);
                self.disconnect(id, reason::SEND_ERROR).await;
                false
            }
        }
    }

    /// Delivers a payload to every connection of a user.
    ///
    /// The index set is snapshotted before iterating, so concurrent
    /// mutation does not affect the current fan-out. Returns the number of
    /// successful deliveries.
    pub async fn send_to_user(&self, user_id: &str, payload: serde_json::Value) -> usize {
        let ids = self.connections.connections_for_user(user_id).await;
        self.fan_out(ids, payload).await
    }

    /// Delivers a payload to every connection of an organization.
    pub async fn send_to_organization(
        &self,
        organization_id: &str,
        payload: serde_json::Value,
    ) -> usize {
        let ids = self
            .connections
            .connections_for_organization(organization_id)
            .await;
        self.fan_out(ids, payload).await
    }

    async fn fan_out(&self, ids: Vec<ConnectionId>, payload: serde_json::Value) -> usize {
        let mut delivered = 0;
        for id in ids {
            if self
                .send_to_connection(id, ServerMessage::data(payload.clone()))
                .await
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Delivers an event to every matching subscription.
    ///
    /// Subscriptions owned by excluded connections are skipped even when
    /// they match. Delivery follows match-set order; each successful
    /// delivery stamps the subscription's match counters. Returns the
    /// number of successful deliveries.
    pub async fn broadcast(
        &self,
        event: &Event,
        exclude: Option<&HashSet<ConnectionId>>,
    ) -> usize {
        let targets = self.subscriptions.match_event(event).await;
        let mut delivered = 0;
        for target in targets {
            if exclude.is_some_and(|set| set.contains(&target.connection_id)) {
                continue;
            }
            let message = ServerMessage::event(&event.event_type, event.scope, event.payload.clone());
            if self.send_to_connection(target.connection_id, message).await {
                self.subscriptions.record_match(target.subscription_id).await;
                delivered += 1;
            }
        }
        tracing::debug!(event_type = %event.event_type, delivered, "broadcast complete");
        delivered
    }

    /// Producer-facing broadcast entry point.
    ///
    /// `match_attrs` are routing attributes merged into the payload before
    /// matching, so producers can target filtered subscriptions (e.g.
    /// `{"room": "A"}`) without restructuring their domain payload.
    pub async fn broadcast_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        scope: EventScope,
        match_attrs: Option<serde_json::Map<String, serde_json::Value>>,
        exclude: Option<&HashSet<ConnectionId>>,
    ) -> usize {
        let mut payload = payload;
        if let Some(attrs) = match_attrs {
            if payload.is_null() {
                payload = serde_json::Value::Object(serde_json::Map::new());
            }
            if let Some(obj) = payload.as_object_mut() {
                obj.extend(attrs);
            }
        }
        let event = Event::new(event_type, scope, payload);
        self.broadcast(&event, exclude).await
    }

    /// Tears down a connection: removes the record and its index entries,
    /// destroys every owned subscription, and records the disconnect.
    ///
    /// Idempotent and race-safe: the read loop, the liveness monitor, and
    /// the delivery engine may all call this concurrently; exactly one
    /// wins and the rest observe a no-op.
    pub async fn disconnect(&self, id: ConnectionId, reason: &str) {
        let Some(summary) = self.connections.remove(id).await else {
            return;
        };
        let removed = self.subscriptions.remove_for_connection(id).await;

        let now = Utc::now();
        let duration_secs = (now - summary.connected_at).num_milliseconds() as f64 / 1000.0;
        if reason == reason::SEND_ERROR || reason == reason::TRANSPORT_ERROR {
            self.stats.record_connection_error();
        }
        self.stats.record_disconnect(DisconnectRecord {
            reason: reason.to_string(),
            duration_secs,
            messages_sent: summary.messages_sent,
            at: now,
        });
        tracing::info!(
            connection = %id,
            reason,
            subscriptions = removed.len(),
            messages = summary.messages_sent,
            "connection closed"
        );
    }

    /// Stamps client-originated activity on the connection.
    pub async fn record_activity(&self, id: ConnectionId, heartbeat_ack: bool) {
        let Some(entry) = self.connections.get(id).await else {
            return;
        };
        let mut conn = entry.write().await;
        conn.touch();
        if heartbeat_ack {
            conn.last_heartbeat_ack = Some(Utc::now());
        }
    }

    /// Handles one inbound text frame: parse, dispatch, reply.
    ///
    /// Protocol, authorization, and capacity failures are answered on the
    /// connection, which stays open; only transport failures are fatal.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        self.stats.record_received();

        let parsed = match parse_client_message(text) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.record_activity(id, false).await;
                self.send_to_connection(id, ServerMessage::error(&err)).await;
                return;
            }
        };
        let correlation = parsed.message_id;

        match parsed.message {
            ClientMessage::Ping => {
                self.record_activity(id, true).await;
                self.send_to_connection(id, ServerMessage::heartbeat().correlated(correlation))
                    .await;
            }
            ClientMessage::Auth { payload } => {
                self.record_activity(id, false).await;
                self.handle_auth(id, &payload, correlation).await;
            }
            ClientMessage::Subscribe {
                event_type,
                scope,
                filter,
            } => {
                self.record_activity(id, false).await;
                let reply = match self.subscribe(id, &event_type, scope, filter).await {
                    Ok(sub) => ServerMessage::new(
                        ServerMessageType::SubscriptionSuccess,
                        serde_json::json!({
                            "subscription_id": sub.id,
                            "event_type": sub.event_type,
                            "scope": sub.scope.as_str(),
                            "filters": sub.filter,
                        }),
                    ),
                    Err(err) => ServerMessage::new(
                        ServerMessageType::SubscriptionFailed,
                        serde_json::json!({
                            "code": err.error_code(),
                            "message": err.to_string(),
                        }),
                    ),
                };
                self.send_to_connection(id, reply.correlated(correlation)).await;
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                self.record_activity(id, false).await;
                let reply = if self.unsubscribe(id, subscription_id).await {
                    ServerMessage::data(serde_json::json!({
                        "unsubscribed": subscription_id,
                    }))
                } else {
                    ServerMessage::error(&GatewayError::SubscriptionNotFound(
                        *subscription_id.as_uuid(),
                    ))
                };
                self.send_to_connection(id, reply.correlated(correlation)).await;
            }
            ClientMessage::Data { payload } => {
                self.record_activity(id, false).await;
                self.send_to_connection(id, ServerMessage::data(payload).correlated(correlation))
                    .await;
            }
        }
    }

    async fn handle_auth(
        &self,
        id: ConnectionId,
        payload: &serde_json::Value,
        correlation: Option<String>,
    ) {
        let Some(identity) = self.validator.validate(payload) else {
            let reply = ServerMessage::new(
                ServerMessageType::AuthFailed,
                serde_json::json!({"reason": "invalid credentials"}),
            )
            .correlated(correlation);
            self.send_to_connection(id, reply).await;
            return;
        };

        let user_id = identity.user_id.clone();
        let organization_id = identity.organization_id.clone();
        if !self.authenticate(id, identity).await {
            return;
        }

        let scopes: Vec<&str> = EventScope::ALL.iter().map(EventScope::as_str).collect();
        let reply = ServerMessage::new(
            ServerMessageType::AuthSuccess,
            serde_json::json!({
                "user_id": user_id,
                "organization_id": organization_id,
                "scopes": scopes,
                "limits": {
                    "max_subscriptions_per_connection":
                        self.config.max_subscriptions_per_connection,
                    "rate_limit_messages": self.config.rate_limit_max_messages,
                    "rate_limit_window_secs": self.config.rate_limit_window_secs,
                },
            }),
        )
        .correlated(correlation);
        self.send_to_connection(id, reply).await;
    }

    /// Computes a fresh statistics snapshot from the registries and
    /// counters.
    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        let active = self.connections.len().await;
        let authenticated = self.connections.count_authenticated().await;
        let total = self.subscriptions.len().await;
        let by_event_type = self.subscriptions.count_by_event_type().await;
        let by_scope = self.subscriptions.count_by_scope().await;
        self.stats
            .snapshot(active, authenticated, total, by_event_type, by_scope, Utc::now())
    }

    /// Recomputes and caches the health report. Runs on the stats refresh
    /// interval; also invoked directly when no cache exists yet.
    pub async fn refresh_stats(&self) -> HealthReport {
        let statistics = self.stats_snapshot().await;
        let status = self
            .stats
            .health(statistics.connections.active, self.config.max_active_connections);
        let report = HealthReport {
            status,
            statistics,
            last_updated: Utc::now(),
        };
        *self.cached_health.write().await = Some(report.clone());
        report
    }

    /// Returns the cached health report, computing one if none exists.
    pub async fn health_report(&self) -> HealthReport {
        if let Some(report) = self.cached_health.read().await.clone() {
            return report;
        }
        self.refresh_stats().await
    }

    /// Operator action: zeroes counters and clears histories.
    pub async fn reset_stats(&self) {
        self.stats.reset();
        *self.cached_health.write().await = None;
        tracing::info!("statistics reset");
    }

    /// Spawns the background tasks (liveness sweep, stats refresh) under
    /// this engine's lifecycle.
    pub async fn start_background(self: Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let monitor = LivenessMonitor::new(Arc::clone(&self));
        tasks.push(tokio::spawn(monitor.run(self.shutdown_tx.subscribe())));

        let engine = Arc::clone(&self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let refresh_secs = self.config.stats_refresh_secs.max(1);
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(refresh_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.refresh_stats().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Tears the engine down: cancels and joins background tasks, then
    /// force-disconnects every remaining connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);

        for id in self.connections.ids().await {
            self.disconnect(id, reason::SERVER_SHUTDOWN).await;
        }
        tracing::info!("engine shut down");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::ws::messages::ServerMessageType;
    use serde_json::json;
    use std::collections::HashMap;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            rate_limit_max_messages: 100,
            max_subscriptions_per_connection: 5,
            ..GatewayConfig::default()
        }
    }

    async fn attach(engine: &RealtimeEngine) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(64);
        let Ok(id) = engine.register_connection(tx).await else {
            panic!("registration failed");
        };
        let Ok(welcome) = rx.try_recv() else {
            panic!("welcome not delivered");
        };
        assert_eq!(welcome.msg_type, ServerMessageType::Data);
        (id, rx)
    }

    fn identity(user: &str, org: Option<&str>) -> AuthIdentity {
        AuthIdentity {
            user_id: user.to_string(),
            organization_id: org.map(ToString::to_string),
            session_id: None,
            metadata: HashMap::new(),
        }
    }

    async fn attach_authed(
        engine: &RealtimeEngine,
        user: &str,
        org: Option<&str>,
    ) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (id, rx) = attach(engine).await;
        assert!(engine.authenticate(id, identity(user, org)).await);
        (id, rx)
    }

    #[tokio::test]
    async fn subscribe_requires_authentication() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach(&engine).await;

        let result = engine
            .subscribe(id, "tick", EventScope::User, SubscriptionFilter::new())
            .await;
        assert!(matches!(result, Err(GatewayError::AuthenticationRequired)));
        assert!(engine.subscriptions().is_empty().await);
    }

    #[tokio::test]
    async fn subscribe_enforces_per_connection_cap() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", None).await;

        for i in 0..5 {
            let result = engine
                .subscribe(
                    id,
                    &format!("event-{i}"),
                    EventScope::User,
                    SubscriptionFilter::new(),
                )
                .await;
            assert!(result.is_ok());
        }
        let result = engine
            .subscribe(id, "one-too-many", EventScope::User, SubscriptionFilter::new())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::SubscriptionLimitReached { max: 5 })
        ));
    }

    #[tokio::test]
    async fn global_scope_requires_elevated_capability() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", None).await;

        let result = engine
            .subscribe(id, "tick", EventScope::Global, SubscriptionFilter::new())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::ScopeNotPermitted { .. })
        ));
        assert!(engine.subscriptions().is_empty().await);

        // Elevated metadata unlocks the scope.
        let mut meta = HashMap::new();
        meta.insert("elevated".to_string(), json!(true));
        let elevated = AuthIdentity {
            user_id: "user-1".to_string(),
            organization_id: None,
            session_id: None,
            metadata: meta,
        };
        assert!(engine.authenticate(id, elevated).await);
        let result = engine
            .subscribe(id, "tick", EventScope::Global, SubscriptionFilter::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn organization_scope_requires_org_identity() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", None).await;

        let result = engine
            .subscribe(id, "tick", EventScope::Organization, SubscriptionFilter::new())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::ScopeNotPermitted { .. })
        ));

        let (with_org, _rx2) = attach_authed(&engine, "user-2", Some("org-1")).await;
        let result = engine
            .subscribe(
                with_org,
                "tick",
                EventScope::Organization,
                SubscriptionFilter::new(),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn subscription_sets_stay_consistent() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", None).await;

        let Ok(first) = engine
            .subscribe(id, "a", EventScope::User, SubscriptionFilter::new())
            .await
        else {
            panic!("subscribe failed");
        };
        let Ok(_second) = engine
            .subscribe(id, "b", EventScope::User, SubscriptionFilter::new())
            .await
        else {
            panic!("subscribe failed");
        };

        let Some(entry) = engine.connections().get(id).await else {
            panic!("connection missing");
        };
        let owned = entry.read().await.subscriptions.clone();
        assert_eq!(owned, engine.subscriptions().ids_for_connection(id).await);

        assert!(engine.unsubscribe(id, first.id).await);
        let owned = entry.read().await.subscriptions.clone();
        assert_eq!(owned, engine.subscriptions().ids_for_connection(id).await);
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_fails_closed_across_connections() {
        let engine = RealtimeEngine::new(test_config());
        let (owner, _rx1) = attach_authed(&engine, "user-1", None).await;
        let (stranger, _rx2) = attach_authed(&engine, "user-2", None).await;

        let Ok(sub) = engine
            .subscribe(owner, "tick", EventScope::User, SubscriptionFilter::new())
            .await
        else {
            panic!("subscribe failed");
        };
        assert!(!engine.unsubscribe(stranger, sub.id).await);
        assert_eq!(engine.subscriptions().len().await, 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_demotes_to_authenticated() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", None).await;

        let Ok(sub) = engine
            .subscribe(id, "tick", EventScope::User, SubscriptionFilter::new())
            .await
        else {
            panic!("subscribe failed");
        };
        let Some(entry) = engine.connections().get(id).await else {
            panic!("connection missing");
        };
        assert_eq!(entry.read().await.state, ConnectionState::Subscribed);

        assert!(engine.unsubscribe(id, sub.id).await);
        assert_eq!(entry.read().await.state, ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn disconnect_removes_subscriptions_and_indexes() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", Some("org-1")).await;

        for event_type in ["a", "b", "c"] {
            let result = engine
                .subscribe(id, event_type, EventScope::User, SubscriptionFilter::new())
                .await;
            assert!(result.is_ok());
        }

        engine.disconnect(id, reason::CLIENT_DISCONNECT).await;

        assert!(engine.connections().get(id).await.is_none());
        assert!(engine.subscriptions().ids_for_connection(id).await.is_empty());
        assert!(engine.subscriptions().is_empty().await);
        assert!(engine.connections().connections_for_user("user-1").await.is_empty());
        assert!(
            engine
                .connections()
                .connections_for_organization("org-1")
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_in_statistics() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", None).await;

        engine.disconnect(id, reason::CLIENT_DISCONNECT).await;
        engine.disconnect(id, reason::CLIENT_DISCONNECT).await;

        assert_eq!(engine.stats().recent_disconnects().len(), 1);
    }

    #[tokio::test]
    async fn rate_limiter_caps_sends_per_window() {
        let config = GatewayConfig {
            rate_limit_max_messages: 3,
            ..test_config()
        };
        let engine = RealtimeEngine::new(config);
        let (id, mut rx) = attach_authed(&engine, "user-1", None).await;

        let mut admitted = 0;
        for _ in 0..4 {
            if engine.send_to_connection(id, ServerMessage::data(json!({}))).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);

        // Three data deliveries, then the rate-limit notice.
        for _ in 0..3 {
            let Ok(msg) = rx.try_recv() else {
                panic!("expected delivery");
            };
            assert_eq!(msg.msg_type, ServerMessageType::Data);
        }
        let Ok(notice) = rx.try_recv() else {
            panic!("expected rate-limit notice");
        };
        assert_eq!(notice.msg_type, ServerMessageType::RateLimit);
        assert!(notice.payload.get("retry_after_seconds").is_some());

        let snapshot = engine.stats_snapshot().await;
        assert_eq!(snapshot.messages.rate_limited, 1);
    }

    #[tokio::test]
    async fn full_outbound_queue_disconnects_the_connection() {
        let engine = RealtimeEngine::new(test_config());
        let (tx, _rx) = mpsc::channel(1);
        let Ok(id) = engine.register_connection(tx).await else {
            panic!("registration failed");
        };
        // The welcome filled the single-slot queue; the next send overflows.
        assert!(!engine.send_to_connection(id, ServerMessage::data(json!({}))).await);
        assert!(engine.connections().get(id).await.is_none());

        let records = engine.stats().recent_disconnects();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records.first().map(|r| r.reason.as_str()),
            Some(reason::SEND_ERROR)
        );
        assert_eq!(engine.stats().connection_errors(), 1);
    }

    #[tokio::test]
    async fn broadcast_delivers_to_matching_subscriptions_only() {
        let engine = RealtimeEngine::new(test_config());
        let (room_a, mut rx_a) = attach_authed(&engine, "user-1", None).await;
        let (room_b, mut rx_b) = attach_authed(&engine, "user-2", None).await;

        let result = engine
            .subscribe(
                room_a,
                "chat.message",
                EventScope::Room,
                SubscriptionFilter::new().with_field("room", json!("A")),
            )
            .await;
        assert!(result.is_ok());
        let result = engine
            .subscribe(
                room_b,
                "chat.message",
                EventScope::Room,
                SubscriptionFilter::new().with_field("room", json!("B")),
            )
            .await;
        assert!(result.is_ok());

        let event = Event::new("chat.message", EventScope::Room, json!({"room": "A", "text": "hi"}));
        let delivered = engine.broadcast(&event, None).await;
        assert_eq!(delivered, 1);

        let Ok(msg) = rx_a.try_recv() else {
            panic!("room A should receive");
        };
        assert_eq!(msg.event_type.as_deref(), Some("chat.message"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_respects_exclusions() {
        let engine = RealtimeEngine::new(test_config());
        let (excluded, mut rx_excluded) = attach_authed(&engine, "user-1", None).await;
        let (included, mut rx_included) = attach_authed(&engine, "user-2", None).await;

        for id in [excluded, included] {
            let result = engine
                .subscribe(id, "tick", EventScope::User, SubscriptionFilter::new())
                .await;
            assert!(result.is_ok());
        }

        let event = Event::new("tick", EventScope::User, json!({}));
        let mut skip = HashSet::new();
        skip.insert(excluded);
        let delivered = engine.broadcast(&event, Some(&skip)).await;

        assert_eq!(delivered, 1);
        assert!(rx_excluded.try_recv().is_err());
        assert!(rx_included.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_records_match_counters() {
        let engine = RealtimeEngine::new(test_config());
        let (id, _rx) = attach_authed(&engine, "user-1", None).await;
        let Ok(sub) = engine
            .subscribe(id, "tick", EventScope::User, SubscriptionFilter::new())
            .await
        else {
            panic!("subscribe failed");
        };

        let event = Event::new("tick", EventScope::User, json!({}));
        engine.broadcast(&event, None).await;
        engine.broadcast(&event, None).await;

        let Some(stored) = engine.subscriptions().get(sub.id).await else {
            panic!("subscription missing");
        };
        assert_eq!(stored.match_count, 2);
    }

    #[tokio::test]
    async fn send_to_user_fans_out_over_all_connections() {
        let engine = RealtimeEngine::new(test_config());
        let (_a, mut rx_a) = attach_authed(&engine, "user-1", None).await;
        let (_b, mut rx_b) = attach_authed(&engine, "user-1", None).await;
        let (_c, mut rx_c) = attach_authed(&engine, "user-2", None).await;

        let delivered = engine.send_to_user("user-1", json!({"note": 1})).await;
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_organization_uses_org_index() {
        let engine = RealtimeEngine::new(test_config());
        let (_a, mut rx_a) = attach_authed(&engine, "user-1", Some("org-1")).await;
        let (_b, mut rx_b) = attach_authed(&engine, "user-2", Some("org-2")).await;

        let delivered = engine.send_to_organization("org-1", json!({})).await;
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_event_merges_match_attrs() {
        let engine = RealtimeEngine::new(test_config());
        let (id, mut rx) = attach_authed(&engine, "user-1", None).await;
        let result = engine
            .subscribe(
                id,
                "chat.message",
                EventScope::Room,
                SubscriptionFilter::new().with_field("room", json!("A")),
            )
            .await;
        assert!(result.is_ok());

        let mut attrs = serde_json::Map::new();
        attrs.insert("room".to_string(), json!("A"));
        let delivered = engine
            .broadcast_event(
                "chat.message",
                json!({"text": "hi"}),
                EventScope::Room,
                Some(attrs),
                None,
            )
            .await;
        assert_eq!(delivered, 1);
        let Ok(msg) = rx.try_recv() else {
            panic!("expected delivery");
        };
        assert_eq!(msg.payload.get("room"), Some(&json!("A")));
        assert_eq!(msg.payload.get("text"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn handle_text_dispatches_auth_and_subscribe() {
        let engine = RealtimeEngine::new(test_config());
        let (id, mut rx) = attach(&engine).await;

        engine
            .handle_text(
                id,
                r#"{"type": "auth", "payload": {"user_id": "user-1"}, "message_id": "m-1"}"#,
            )
            .await;
        let Ok(reply) = rx.try_recv() else {
            panic!("expected auth reply");
        };
        assert_eq!(reply.msg_type, ServerMessageType::AuthSuccess);
        assert_eq!(reply.correlation_id.as_deref(), Some("m-1"));
        assert!(reply.payload.get("limits").is_some());

        engine
            .handle_text(
                id,
                r#"{"type": "subscribe", "payload": {"event_type": "tick"}, "message_id": "m-2"}"#,
            )
            .await;
        let Ok(reply) = rx.try_recv() else {
            panic!("expected subscribe reply");
        };
        assert_eq!(reply.msg_type, ServerMessageType::SubscriptionSuccess);
        assert_eq!(reply.correlation_id.as_deref(), Some("m-2"));
    }

    #[tokio::test]
    async fn handle_text_rejects_unknown_types_and_bad_json() {
        let engine = RealtimeEngine::new(test_config());
        let (id, mut rx) = attach(&engine).await;

        engine.handle_text(id, "{broken").await;
        let Ok(reply) = rx.try_recv() else {
            panic!("expected error reply");
        };
        assert_eq!(reply.msg_type, ServerMessageType::Error);
        assert_eq!(
            reply.payload.get("message"),
            Some(&json!("Invalid JSON format"))
        );

        engine
            .handle_text(id, r#"{"type": "teleport", "payload": {}}"#)
            .await;
        let Ok(reply) = rx.try_recv() else {
            panic!("expected error reply");
        };
        assert_eq!(reply.msg_type, ServerMessageType::Error);
        let Some(message) = reply.payload.get("message").and_then(|m| m.as_str()) else {
            panic!("message missing");
        };
        assert!(message.contains("teleport"));

        // Protocol errors never tear the connection down.
        assert!(engine.connections().get(id).await.is_some());
    }

    #[tokio::test]
    async fn handle_text_answers_ping_with_heartbeat() {
        let engine = RealtimeEngine::new(test_config());
        let (id, mut rx) = attach(&engine).await;

        engine
            .handle_text(id, r#"{"type": "ping", "message_id": "p-1"}"#)
            .await;
        let Ok(reply) = rx.try_recv() else {
            panic!("expected heartbeat reply");
        };
        assert_eq!(reply.msg_type, ServerMessageType::Heartbeat);
        assert_eq!(reply.correlation_id.as_deref(), Some("p-1"));

        let Some(entry) = engine.connections().get(id).await else {
            panic!("connection missing");
        };
        assert!(entry.read().await.last_heartbeat_ack.is_some());
    }

    #[tokio::test]
    async fn shutdown_disconnects_everything() {
        let engine = RealtimeEngine::new(test_config());
        Arc::clone(&engine).start_background().await;
        let (_a, _rx_a) = attach_authed(&engine, "user-1", None).await;
        let (_b, _rx_b) = attach_authed(&engine, "user-2", None).await;

        engine.shutdown().await;

        assert!(engine.connections().is_empty().await);
        assert!(engine.subscriptions().is_empty().await);
        let records = engine.stats().recent_disconnects();
        assert_eq!(records.len(), 2);
        assert!(
            records
                .iter()
                .all(|r| r.reason == reason::SERVER_SHUTDOWN)
        );
    }
}
