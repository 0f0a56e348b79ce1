//! REST API layer: operational endpoints and router composition.
//!
//! The gateway's REST surface is the operational one only — health,
//! statistics, and the operator reset. Business producers push events
//! through the engine's Rust API instead.

pub mod handlers;

use axum::Router;

use crate::app_state::AppState;

/// OpenAPI document for the operational surface.
#[cfg(feature = "swagger-ui")]
#[derive(utoipa::OpenApi)]
#[openapi(
    paths(
        handlers::system::health_handler,
        handlers::system::stats_handler,
        handlers::system::reset_stats_handler,
    ),
    components(schemas(
        crate::service::stats::HealthReport,
        crate::service::stats::HealthStatus,
        crate::service::stats::StatsSnapshot,
        crate::service::stats::ConnectionStats,
        crate::service::stats::MessageStats,
        crate::service::stats::SubscriptionStats,
        crate::service::stats::PerformanceStats,
        handlers::system::ResetResponse,
    )),
    tags((name = "System", description = "Health and statistics endpoints"))
)]
struct ApiDoc;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    let router = Router::new().merge(handlers::routes());

    #[cfg(feature = "swagger-ui")]
    let router = {
        use utoipa::OpenApi;
        router.merge(
            utoipa_swagger_ui::SwaggerUi::new("/docs")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
    };

    router
}
