//! Delivery statistics: counters, bounded histories, and health status.
//!
//! [`StatsCollector`] accumulates monotonic counters and three
//! fixed-capacity ring buffers (disconnect history, sent-message
//! timestamps, failed deliveries). Ring buffers evict oldest-first on
//! overflow, so memory stays bounded without a trimming pass. Counters
//! reset only through the operator endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::ConnectionId;

/// Window used for the messages-per-second rate.
const RATE_WINDOW_SECS: i64 = 60;

/// Gateway health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Error ratio and load within bounds.
    Healthy,
    /// Active connections exceed the configured ceiling.
    Warning,
    /// Connection error ratio above 5%.
    Degraded,
    /// Connection error ratio above 10%.
    Critical,
}

impl HealthStatus {
    /// Classifies health from the error ratio and active load.
    #[must_use]
    pub fn classify(errors: u64, total_connections: u64, active: usize, ceiling: usize) -> Self {
        if total_connections > 0 {
            let ratio = errors as f64 / total_connections as f64;
            if ratio > 0.10 {
                return Self::Critical;
            }
            if ratio > 0.05 {
                return Self::Degraded;
            }
        }
        if active > ceiling {
            return Self::Warning;
        }
        Self::Healthy
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

/// One entry in the disconnect history ring.
#[derive(Debug, Clone, Serialize)]
pub struct DisconnectRecord {
    /// Why the connection ended.
    pub reason: String,
    /// Seconds the connection was attached.
    pub duration_secs: f64,
    /// Messages delivered over its lifetime.
    pub messages_sent: u64,
    /// When the disconnect happened.
    pub at: DateTime<Utc>,
}

/// One entry in the failed-delivery history ring.
#[derive(Debug, Clone, Serialize)]
pub struct FailedDelivery {
    /// Target connection of the failed write.
    pub connection_id: ConnectionId,
    /// Failure reason.
    pub reason: String,
    /// When the failure happened.
    pub at: DateTime<Utc>,
}

/// Connection counters in a statistics snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConnectionStats {
    /// Connections ever registered.
    pub total: u64,
    /// Connections currently attached.
    pub active: usize,
    /// Connections currently authenticated.
    pub authenticated: usize,
}

/// Message counters in a statistics snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MessageStats {
    /// Messages delivered to clients.
    pub sent: u64,
    /// Messages received from clients.
    pub received: u64,
    /// Delivery attempts that failed at the transport.
    pub failed: u64,
    /// Sends rejected by the rate limiter.
    pub rate_limited: u64,
}

/// Subscription counters in a statistics snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SubscriptionStats {
    /// Active subscriptions.
    pub total: usize,
    /// Active subscriptions grouped by event type.
    pub by_event_type: HashMap<String, usize>,
    /// Active subscriptions grouped by scope.
    pub by_scope: HashMap<String, usize>,
}

/// Derived performance figures in a statistics snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PerformanceStats {
    /// Delivery rate over the trailing 60 seconds.
    pub messages_per_second: f64,
    /// Mean connection lifetime over the disconnect history.
    pub avg_connection_duration_secs: f64,
}

/// Full statistics snapshot served by the operational endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatsSnapshot {
    /// Connection counters.
    pub connections: ConnectionStats,
    /// Message counters.
    pub messages: MessageStats,
    /// Subscription counters.
    pub subscriptions: SubscriptionStats,
    /// Derived rates.
    pub performance: PerformanceStats,
}

/// Health endpoint body: status, full statistics, and cache age.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthReport {
    /// Derived health classification.
    pub status: HealthStatus,
    /// The snapshot the classification was derived from.
    pub statistics: StatsSnapshot,
    /// When the snapshot was computed.
    pub last_updated: DateTime<Utc>,
}

/// Process-wide statistics accumulator.
///
/// Counter updates are lock-free; the history rings use a `std` mutex held
/// only for push/prune, never across an await point.
#[derive(Debug)]
pub struct StatsCollector {
    history_capacity: usize,
    connections_total: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_failed: AtomicU64,
    rate_limit_rejections: AtomicU64,
    connection_errors: AtomicU64,
    disconnects: Mutex<VecDeque<DisconnectRecord>>,
    sent_at: Mutex<VecDeque<DateTime<Utc>>>,
    failed: Mutex<VecDeque<FailedDelivery>>,
}

impl StatsCollector {
    /// Creates a collector whose history rings hold `history_capacity`
    /// entries each.
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history_capacity,
            connections_total: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            rate_limit_rejections: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            disconnects: Mutex::new(VecDeque::new()),
            sent_at: Mutex::new(VecDeque::new()),
            failed: Mutex::new(VecDeque::new()),
        }
    }

    /// Counts a newly registered connection.
    pub fn record_connected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one delivered message.
    pub fn record_sent(&self, now: DateTime<Utc>) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let Ok(mut ring) = self.sent_at.lock() else {
            return;
        };
        push_bounded(&mut ring, now, self.history_capacity);
    }

    /// Counts one received client message.
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a transport delivery failure.
    pub fn record_send_failure(&self, connection_id: ConnectionId, reason: &str) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
        let Ok(mut ring) = self.failed.lock() else {
            return;
        };
        push_bounded(
            &mut ring,
            FailedDelivery {
                connection_id,
                reason: reason.to_string(),
                at: Utc::now(),
            },
            self.history_capacity,
        );
    }

    /// Counts a rate-limiter rejection.
    pub fn record_rate_limited(&self) {
        self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one connection lost to a transport-level error. Called once
    /// per connection by the winning disconnect, so racing send failures
    /// never double-count.
    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Appends a disconnect record to the history ring.
    pub fn record_disconnect(&self, record: DisconnectRecord) {
        let Ok(mut ring) = self.disconnects.lock() else {
            return;
        };
        push_bounded(&mut ring, record, self.history_capacity);
    }

    /// Messages ever delivered.
    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Connections ever registered.
    #[must_use]
    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Transport-level connection errors.
    #[must_use]
    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    /// Builds a snapshot from the counters plus registry-derived figures
    /// supplied by the engine.
    #[must_use]
    pub fn snapshot(
        &self,
        active: usize,
        authenticated: usize,
        subscriptions_total: usize,
        by_event_type: HashMap<String, usize>,
        by_scope: HashMap<String, usize>,
        now: DateTime<Utc>,
    ) -> StatsSnapshot {
        StatsSnapshot {
            connections: ConnectionStats {
                total: self.connections_total.load(Ordering::Relaxed),
                active,
                authenticated,
            },
            messages: MessageStats {
                sent: self.messages_sent.load(Ordering::Relaxed),
                received: self.messages_received.load(Ordering::Relaxed),
                failed: self.messages_failed.load(Ordering::Relaxed),
                rate_limited: self.rate_limit_rejections.load(Ordering::Relaxed),
            },
            subscriptions: SubscriptionStats {
                total: subscriptions_total,
                by_event_type,
                by_scope,
            },
            performance: PerformanceStats {
                messages_per_second: self.messages_per_second(now),
                avg_connection_duration_secs: self.avg_connection_duration_secs(),
            },
        }
    }

    /// Delivery rate over the trailing rate window.
    #[must_use]
    pub fn messages_per_second(&self, now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        let Ok(mut ring) = self.sent_at.lock() else {
            return 0.0;
        };
        while ring.front().is_some_and(|at| *at < cutoff) {
            ring.pop_front();
        }
        ring.len() as f64 / RATE_WINDOW_SECS as f64
    }

    /// Mean connection lifetime over the disconnect history.
    #[must_use]
    pub fn avg_connection_duration_secs(&self) -> f64 {
        let Ok(ring) = self.disconnects.lock() else {
            return 0.0;
        };
        if ring.is_empty() {
            return 0.0;
        }
        let sum: f64 = ring.iter().map(|r| r.duration_secs).sum();
        sum / ring.len() as f64
    }

    /// Health classification for the current counters.
    #[must_use]
    pub fn health(&self, active: usize, ceiling: usize) -> HealthStatus {
        HealthStatus::classify(
            self.connection_errors.load(Ordering::Relaxed),
            self.connections_total.load(Ordering::Relaxed),
            active,
            ceiling,
        )
    }

    /// Snapshot of the disconnect history ring, oldest first.
    #[must_use]
    pub fn recent_disconnects(&self) -> Vec<DisconnectRecord> {
        self.disconnects
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Operator reset: zeroes every counter and clears the history rings.
    pub fn reset(&self) {
        self.connections_total.store(0, Ordering::Relaxed);
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.messages_failed.store(0, Ordering::Relaxed);
        self.rate_limit_rejections.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
        if let Ok(mut ring) = self.disconnects.lock() {
            ring.clear();
        }
        if let Ok(mut ring) = self.sent_at.lock() {
            ring.clear();
        }
        if let Ok(mut ring) = self.failed.lock() {
            ring.clear();
        }
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    while ring.len() >= capacity.max(1) {
        ring.pop_front();
    }
    ring.push_back(item);
}
