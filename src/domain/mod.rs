//! Domain layer: core types, registries, and matching semantics.
//!
//! This module contains the server-side domain model: connection and
//! subscription identity, the connection lifecycle state machine, the
//! per-connection rate-limit bucket, subscription filter predicates, and
//! the two concurrent registries the delivery engine coordinates.

pub mod connection;
pub mod connection_id;
pub mod connection_registry;
pub mod event;
pub mod rate_limit;
pub mod subscription;
pub mod subscription_id;
pub mod subscription_registry;

pub use connection::{Connection, ConnectionState, ELEVATED_CAPABILITY};
pub use connection_id::ConnectionId;
pub use connection_registry::{ConnectionRegistry, DisconnectSummary};
pub use event::{Event, EventScope};
pub use rate_limit::TokenBucket;
pub use subscription::{FilterValue, Subscription, SubscriptionFilter};
pub use subscription_id::SubscriptionId;
pub use subscription_registry::{MatchTarget, SubscriptionRegistry};
