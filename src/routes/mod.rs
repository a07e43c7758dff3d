pub mod appointments;
pub mod notifications;

use crate::{state::AppState, utils::middleware};
use axum::{
    extract::State,
    http::{HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// Full application router: health checks plus the authenticated API.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .nest("/agendamentos", appointments::router())
        .nest("/notificacoes", notifications::router())
        .route_layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(from_fn(middleware::request_logging_middleware))
        .layer(cors_layer(&state.config.cors_allowed_origins))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(origins)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "npj-agenda",
        "emailNotifications": state.is_feature_enabled("email_notifications"),
        "googleCalendar": state.is_feature_enabled("google_calendar"),
    }))
}
