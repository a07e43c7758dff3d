use crate::{
    error::Result,
    models::{notification::Notification, response::ApiResponse},
    services::auth::User,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, put},
    Extension, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/nao-lidas/contagem", get(unread_count))
        .route("/:id/lida", put(mark_as_read))
}

/// Get the caller's notifications, newest first
/// GET /api/notificacoes
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<ApiResponse<Vec<Notification>>>> {
    debug!("Getting notifications for user: {}", user.id);

    let notifications = state.notification_service.list(&user).await?;
    Ok(Json(ApiResponse::success(notifications)))
}

/// Get unread notification count
/// GET /api/notificacoes/nao-lidas/contagem
async fn unread_count(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>> {
    let count = state.notification_service.unread_count(&user).await?;

    Ok(Json(json!({
        "success": true,
        "data": { "count": count }
    })))
}

/// Mark a notification as read
/// PUT /api/notificacoes/:id/lida
async fn mark_as_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Notification>>> {
    let outcome = state.notification_service.mark_read(&user, &id).await?;
    Ok(Json(outcome.into()))
}
