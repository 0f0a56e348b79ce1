//! # pulse-gateway
//!
//! Real-time WebSocket gateway for authenticated event subscriptions and
//! filtered fan-out delivery.
//!
//! Clients attach over a persistent WebSocket, authenticate, and subscribe
//! to typed event streams with optional field filters. Server-side
//! producers push events through the [`service::RealtimeEngine`], which
//! matches them against the subscription registry and delivers to every
//! matching connection — or targets a single connection, all of a user's
//! connections, or an organization's connections. Per-connection token
//! buckets cap the delivery rate, and a liveness monitor probes and evicts
//! unresponsive clients.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket)            Producers (Rust API)
//!     │                              │
//!     ├── WS loop (ws/)              │
//!     │                              │
//!     ├────── RealtimeEngine (service/) ──────┐
//!     │                                       │
//!     ├── ConnectionRegistry (domain/)        ├── LivenessMonitor
//!     ├── SubscriptionRegistry (domain/)      ├── StatsCollector
//!     │                                       │
//!     └── REST operational surface (api/): /health, /stats
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod ws;
