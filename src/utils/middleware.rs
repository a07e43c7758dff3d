use crate::{error::AppError, state::AppState};
use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, info};

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authentication middleware: verifies the bearer token and inserts the
/// `User` into request extensions. Requests without a valid token stop here
/// with 401.
pub async fn auth_middleware(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request<Body>,
    next: Next<Body>,
) -> Result<Response, AppError> {
    let token = bearer_token(&headers).ok_or_else(|| AppError::unauthorized("Token de acesso ausente"))?;

    let user = app_state.auth_service.authenticate(token)?;
    debug!("Authenticated user: {} ({})", user.id, user.email);

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Request logging middleware
pub async fn request_logging_middleware(request: Request<Body>, next: Next<Body>) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start_time = std::time::Instant::now();

    debug!("Incoming request: {} {}", method, uri);

    let response = next.run(request).await;

    info!(
        "Request completed: {} {} {} - {}ms",
        method,
        uri,
        response.status().as_u16(),
        start_time.elapsed().as_millis()
    );

    response
}
