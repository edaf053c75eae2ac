pub mod health;
pub mod sessions;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", sessions::router())
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Sync API",
        description = "Real-time session synchronization server. Clients connect to `/ws` for the event channel; these routes inspect live rooms.",
    ),
    paths(
        health::health,
        sessions::get_session,
        sessions::get_roster,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Route response types
            health::HealthResponse,
            sessions::SessionSnapshot,
            sessions::RosterMember,
            sessions::RosterResponse,
        )
    ),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Sessions", description = "Live room inspection"),
    ),
)]
pub struct ApiDoc;
