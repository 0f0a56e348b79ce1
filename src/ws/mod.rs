//! WebSocket layer: upgrade handling, codec, and the per-socket loop.
//!
//! The WebSocket endpoint at `/ws` provides bidirectional communication:
//! clients authenticate, subscribe to event streams, and receive pushed
//! deliveries from the engine.

pub mod connection;
pub mod handler;
pub mod messages;
