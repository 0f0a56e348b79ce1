//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::service::RealtimeEngine;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The connection/subscription/delivery engine.
    pub engine: Arc<RealtimeEngine>,
}
