//! Service layer: the delivery engine and its ambient supervision.
//!
//! [`RealtimeEngine`] coordinates the domain registries and owns the
//! background tasks (liveness sweep, statistics refresh). The
//! [`auth::CredentialValidator`] trait is the boundary to the external
//! authentication subsystem.

pub mod auth;
pub mod engine;
pub mod liveness;
pub mod stats;

pub use auth::{AuthIdentity, ClaimsValidator, CredentialValidator};
pub use engine::{RealtimeEngine, reason};
pub use liveness::{LivenessMonitor, SweepOutcome};
pub use stats::{HealthReport, HealthStatus, StatsCollector, StatsSnapshot};
