use crate::{
    error::Result,
    models::{
        appointment::{Appointment, AppointmentFilter, AppointmentInput, AppointmentStatistics, InviteDecision, PendingReminder},
        response::ApiResponse,
    },
    services::auth::User,
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct InviteResponseRequest {
    #[serde(rename = "justificativa", alias = "justification", default)]
    pub justification: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_appointments).post(create_appointment))
        .route("/estatisticas", get(get_statistics))
        .route("/convites", get(list_invitations))
        .route("/pendentes-lembrete", get(pending_reminders))
        .route(
            "/:id",
            get(get_appointment).put(update_appointment).delete(delete_appointment),
        )
        .route("/:id/aceitar", post(accept_invite))
        .route("/:id/recusar", post(decline_invite))
        .route("/:id/reenviar", post(resend_invites))
}

/// List the caller's appointments
/// GET /api/agendamentos?busca=&dataInicio=&dataFim=&tipoEvento=
async fn list_appointments(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Query(filter): Query<AppointmentFilter>,
) -> Result<Json<ApiResponse<Vec<Appointment>>>> {
    debug!("Listing appointments for user: {}", user.id);

    let appointments = state.appointment_service.list(&user, &filter).await?;
    Ok(Json(ApiResponse::success(appointments)))
}

/// Create an appointment
/// POST /api/agendamentos
async fn create_appointment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(input): Json<AppointmentInput>,
) -> Result<Json<ApiResponse<Appointment>>> {
    debug!("Creating appointment for user: {}", user.id);

    let outcome = state.appointment_service.create(&user, input).await?;
    Ok(Json(outcome.into()))
}

/// Aggregate counters over the caller's appointments
/// GET /api/agendamentos/estatisticas
async fn get_statistics(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<ApiResponse<AppointmentStatistics>>> {
    let stats = state.appointment_service.statistics(&user, Utc::now()).await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// Appointments the caller was invited to
/// GET /api/agendamentos/convites
async fn list_invitations(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<ApiResponse<Vec<Appointment>>>> {
    let invitations = state.appointment_service.list_invitations(&user).await?;
    Ok(Json(ApiResponse::success(invitations)))
}

/// Reminder windows currently owed for the caller's appointments
/// GET /api/agendamentos/pendentes-lembrete
async fn pending_reminders(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<ApiResponse<Vec<PendingReminder>>>> {
    let pending = state.appointment_service.pending_reminders(&user, Utc::now()).await?;
    Ok(Json(ApiResponse::success(pending)))
}

/// Get one appointment
/// GET /api/agendamentos/:id
async fn get_appointment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Appointment>>> {
    let appointment = state.appointment_service.get(&user, &id).await?;
    Ok(Json(ApiResponse::success(appointment)))
}

/// Update an appointment
/// PUT /api/agendamentos/:id
async fn update_appointment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Json(input): Json<AppointmentInput>,
) -> Result<Json<ApiResponse<Appointment>>> {
    debug!("Updating appointment {} for user: {}", id, user.id);

    let outcome = state.appointment_service.update(&user, &id, input).await?;
    Ok(Json(outcome.into()))
}

/// Delete an appointment
/// DELETE /api/agendamentos/:id
async fn delete_appointment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    debug!("Deleting appointment {} for user: {}", id, user.id);

    let outcome = state.appointment_service.delete(&user, &id).await?;
    Ok(Json(outcome.into()))
}

/// Accept an invitation on behalf of the caller's e-mail
/// POST /api/agendamentos/:id/aceitar
async fn accept_invite(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Appointment>>> {
    let outcome = state
        .invite_service
        .respond(&id, &user.email, InviteDecision::Accept, None)
        .await?;
    Ok(Json(outcome.into()))
}

/// Decline an invitation; requires `justificativa`
/// POST /api/agendamentos/:id/recusar
async fn decline_invite(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    request: Option<Json<InviteResponseRequest>>,
) -> Result<Json<ApiResponse<Appointment>>> {
    let justification = request.and_then(|Json(body)| body.justification);

    let outcome = state
        .invite_service
        .respond(&id, &user.email, InviteDecision::Decline, justification)
        .await?;
    Ok(Json(outcome.into()))
}

/// Re-send pending invitations
/// POST /api/agendamentos/:id/reenviar
async fn resend_invites(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<String>>>> {
    let outcome = state.invite_service.resend(&user, &id).await?;
    Ok(Json(outcome.into()))
}
