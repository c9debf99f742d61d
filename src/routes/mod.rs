use crate::models::AppState;
use axum::Router;

pub mod conversation_routes;
pub mod gateway_routes;
pub mod patient_routes;
pub mod realtime_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(gateway_routes::router())
        .merge(realtime_routes::router())
        .nest(
            "/api/v1",
            patient_routes::router().merge(conversation_routes::router()),
        )
        .with_state(state)
}
