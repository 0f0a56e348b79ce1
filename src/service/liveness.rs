//! Liveness supervision: heartbeat probes and stale-connection eviction.
//!
//! [`LivenessMonitor`] sweeps the connection registry on a fixed interval.
//! A connection silent past the configured timeout is evicted with reason
//! `heartbeat_timeout`; one silent past the heartbeat interval (but inside
//! the timeout) receives exactly one probe per sweep. Because the probe
//! itself never resets `last_activity`, a client gets one or more chances
//! to answer before eviction.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::engine::{RealtimeEngine, reason};

/// Result of one liveness sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Connections that received a heartbeat probe.
    pub probed: usize,
    /// Connections evicted for exceeding the timeout.
    pub evicted: usize,
}

/// Background task evicting stale connections.
#[derive(Debug)]
pub struct LivenessMonitor {
    engine: Arc<RealtimeEngine>,
    heartbeat_after: Duration,
    evict_after: Duration,
    sweep_interval: std::time::Duration,
}

impl LivenessMonitor {
    /// Creates a monitor over the engine's configured thresholds.
    #[must_use]
    pub fn new(engine: Arc<RealtimeEngine>) -> Self {
        let config = engine.config();
        let heartbeat_after = Duration::seconds(clamp_secs(config.heartbeat_interval_secs));
        let evict_after = Duration::seconds(clamp_secs(config.connection_timeout_secs));
        let sweep_interval = std::time::Duration::from_secs(config.liveness_sweep_secs.max(1));
        Self {
            engine,
            heartbeat_after,
            evict_after,
            sweep_interval,
        }
    }

    /// Runs sweeps until the shutdown signal fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.sweep().await;
                    if outcome.evicted > 0 {
                        tracing::info!(
                            evicted = outcome.evicted,
                            probed = outcome.probed,
                            "liveness sweep evicted stale connections"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("liveness monitor stopped");
    }

    /// Inspects every connection once: evict past the timeout, probe past
    /// the heartbeat interval.
    pub async fn sweep(&self) -> SweepOutcome {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();

        for id in self.engine.connections().ids().await {
            let Some(entry) = self.engine.connections().get(id).await else {
                continue;
            };
            let idle = {
                let conn = entry.read().await;
                if conn.state.is_terminal() {
                    continue;
                }
                now - conn.last_activity
            };

            if idle > self.evict_after {
                self.engine.disconnect(id, reason::HEARTBEAT_TIMEOUT).await;
                outcome.evicted += 1;
            } else if idle > self.heartbeat_after && self.engine.send_heartbeat(id).await {
                outcome.probed += 1;
            }
        }
        outcome
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::domain::ConnectionId;
    use crate::ws::messages::{ServerMessage, ServerMessageType};
    use tokio::sync::mpsc;

    async fn attach(
        engine: &Arc<RealtimeEngine>,
    ) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(32);
        let Ok(id) = engine.register_connection(tx).await else {
            panic!("registration failed");
        };
        let Ok(_welcome) = rx.try_recv() else {
            panic!("welcome not delivered");
        };
        (id, rx)
    }

    async fn age_connection(engine: &Arc<RealtimeEngine>, id: ConnectionId, secs: i64) {
        let Some(entry) = engine.connections().get(id).await else {
            panic!("connection missing");
        };
        entry.write().await.last_activity = Utc::now() - Duration::seconds(secs);
    }

    #[tokio::test]
    async fn evicts_connections_past_the_timeout() {
        let engine = RealtimeEngine::new(GatewayConfig::default());
        let (id, _rx) = attach(&engine).await;
        age_connection(&engine, id, 301).await;

        let monitor = LivenessMonitor::new(Arc::clone(&engine));
        let outcome = monitor.sweep().await;

        assert_eq!(outcome, SweepOutcome { probed: 0, evicted: 1 });
        assert!(engine.connections().get(id).await.is_none());
        let records = engine.stats().recent_disconnects();
        assert_eq!(
            records.first().map(|r| r.reason.as_str()),
            Some(reason::HEARTBEAT_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn probes_idle_connections_without_evicting() {
        let engine = RealtimeEngine::new(GatewayConfig::default());
        let (id, mut rx) = attach(&engine).await;
        age_connection(&engine, id, 60).await;

        let monitor = LivenessMonitor::new(Arc::clone(&engine));
        let outcome = monitor.sweep().await;
        assert_eq!(outcome, SweepOutcome { probed: 1, evicted: 0 });

        let Ok(probe) = rx.try_recv() else {
            panic!("expected heartbeat probe");
        };
        assert_eq!(probe.msg_type, ServerMessageType::Heartbeat);
        assert!(rx.try_recv().is_err(), "exactly one probe per sweep");
        assert!(engine.connections().get(id).await.is_some());

        // Probes do not reset activity, so the next sweep probes again.
        let outcome = monitor.sweep().await;
        assert_eq!(outcome, SweepOutcome { probed: 1, evicted: 0 });
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn probe_stamps_heartbeat_sent_only() {
        let engine = RealtimeEngine::new(GatewayConfig::default());
        let (id, _rx) = attach(&engine).await;
        age_connection(&engine, id, 60).await;

        let before = {
            let Some(entry) = engine.connections().get(id).await else {
                panic!("connection missing");
            };
            let conn = entry.read().await;
            conn.last_activity
        };

        let monitor = LivenessMonitor::new(Arc::clone(&engine));
        monitor.sweep().await;

        let Some(entry) = engine.connections().get(id).await else {
            panic!("connection missing");
        };
        let conn = entry.read().await;
        assert!(conn.last_heartbeat_sent.is_some());
        assert_eq!(conn.last_activity, before);
    }

    #[tokio::test]
    async fn fresh_connections_are_left_alone() {
        let engine = RealtimeEngine::new(GatewayConfig::default());
        let (id, mut rx) = attach(&engine).await;

        let monitor = LivenessMonitor::new(Arc::clone(&engine));
        let outcome = monitor.sweep().await;

        assert_eq!(outcome, SweepOutcome::default());
        assert!(rx.try_recv().is_err());
        assert!(engine.connections().get(id).await.is_some());
    }
}
