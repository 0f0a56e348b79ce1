//! REST endpoint handlers for the operational surface.

pub mod system;

use axum::Router;

use crate::app_state::AppState;

/// Composes all operational routes.
pub fn routes() -> Router<AppState> {
    system::routes()
}
