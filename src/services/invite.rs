use crate::{
    error::{AppError, Result},
    models::{
        appointment::{
            Appointment, AppointmentStatus, InviteAction, InviteAuditEntry, InviteDecision, InviteStatus, Invitee,
        },
        response::Outcome,
    },
    services::{
        auth::User,
        calendar::CalendarMirror,
        notification::NotificationDispatcher,
        store::AppointmentStore,
    },
    utils::validation::{non_blank, normalize_email},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn record(appointment: &mut Appointment, email: &str, action: InviteAction, detail: Option<String>, now: DateTime<Utc>) {
    appointment.invite_history.push(InviteAuditEntry {
        at: now,
        email: email.to_string(),
        action,
        detail,
    });
}

/// Adds normalized invitees as pending entries. Returns the addresses that
/// were actually added.
pub fn seed(appointment: &mut Appointment, invitees: Vec<(String, Option<String>)>, now: DateTime<Utc>) -> Vec<String> {
    let mut added = Vec::new();
    for (email, name) in invitees {
        if appointment.has_invitee(&email) {
            continue;
        }
        record(appointment, &email, InviteAction::Invited, None, now);
        appointment.invitees.push(Invitee::pending(email.clone(), name, now));
        added.push(email);
    }
    added
}

/// Replaces the invitee list with `invitees`, keeping the status of
/// addresses already present. Returns the new addresses and whether the list
/// changed at all.
pub fn merge(
    appointment: &mut Appointment,
    invitees: Vec<(String, Option<String>)>,
    now: DateTime<Utc>,
) -> (Vec<String>, bool) {
    let before = appointment.invitees.clone();
    let mut merged = Vec::with_capacity(invitees.len());
    let mut added = Vec::new();

    for (email, name) in invitees {
        match appointment.invitee(&email).cloned() {
            // 已有的邀请保留原状态，只更新名字
            Some(mut existing) => {
                if name.is_some() {
                    existing.name = name;
                }
                merged.push(existing);
            }
            // 新地址记为待回复
            None => {
                record(appointment, &email, InviteAction::Invited, None, now);
                merged.push(Invitee::pending(email.clone(), name, now));
                added.push(email);
            }
        }
    }

    // 不在新列表里的地址直接移除
    appointment.invitees = merged;
    let changed = appointment.invitees != before;
    (added, changed)
}

/// Per-invitee response state machine: pending, then accepted or declined
/// exactly once.
#[derive(Clone)]
pub struct InviteService {
    store: Arc<dyn AppointmentStore>,
    dispatcher: NotificationDispatcher,
    calendar: CalendarMirror,
}

impl InviteService {
    pub fn new(store: Arc<dyn AppointmentStore>, dispatcher: NotificationDispatcher, calendar: CalendarMirror) -> Self {
        Self {
            store,
            dispatcher,
            calendar,
        }
    }

    /// Records `email`'s answer to the invitation. Unknown appointment or an
    /// address that is not invited → NotFound; cancelled appointment →
    /// Validation; second answer → Conflict.
    pub async fn respond(
        &self,
        appointment_id: &str,
        email: &str,
        decision: InviteDecision,
        justification: Option<String>,
    ) -> Result<Outcome<Appointment>> {
        let email = normalize_email(email);
        let justification = non_blank(justification);

        // 拒绝必须附带理由
        if decision == InviteDecision::Decline && justification.is_none() {
            return Err(AppError::validation("Justificativa é obrigatória para recusar o convite"));
        }

        debug!("Invite response {:?} from {} for appointment {}", decision, email, appointment_id);

        let now = Utc::now();
        let responder = email.clone();
        let reason = justification.clone();

        let updated = self
            .store
            .modify(
                appointment_id,
                Box::new(move |a: &mut Appointment| {
                    // 先确认是受邀人，再检查是否已取消，最后检查是否已回复
                    let cancelled = a.status == AppointmentStatus::Cancelled;
                    let invitee = a
                        .invitee_mut(&responder)
                        .ok_or_else(|| AppError::not_found("Convite"))?;

                    if cancelled {
                        return Err(AppError::validation("Este agendamento foi cancelado"));
                    }
                    if invitee.status != InviteStatus::Pending {
                        return Err(AppError::conflict("Convite já respondido"));
                    }

                    let action = match decision {
                        InviteDecision::Accept => {
                            invitee.status = InviteStatus::Accepted;
                            invitee.justification = None;
                            InviteAction::Accepted
                        }
                        InviteDecision::Decline => {
                            invitee.status = InviteStatus::Declined;
                            invitee.justification = reason.clone();
                            InviteAction::Declined
                        }
                    };
                    invitee.responded_at = Some(now);

                    record(a, &responder, action, reason, now);
                    a.updated_at = now;
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| AppError::not_found("Agendamento"))?;

        info!("Invitee {} answered {:?} for appointment {}", email, decision, updated.id);

        // 通知失败不影响回复结果
        if let Some(invitee) = updated.invitee(&email) {
            if let Err(e) = self
                .dispatcher
                .notify_invite_response(&updated, invitee, decision, justification.as_deref())
                .await
            {
                warn!("Failed to send invite response notification: {}", e);
            }
        }

        let (updated, warning) = self.calendar.updated(updated).await;

        let message = match decision {
            InviteDecision::Accept => "Convite aceito com sucesso",
            InviteDecision::Decline => "Convite recusado",
        };
        Ok(Outcome::new(updated, message).with_calendar_warning(warning))
    }

    /// Re-sends the invitation to every pending invitee. Accepted and
    /// declined entries are left alone; with nobody pending this changes
    /// nothing and returns an empty list.
    pub async fn resend(&self, user: &User, appointment_id: &str) -> Result<Outcome<Vec<String>>> {
        let current = self
            .store
            .get(appointment_id)
            .await?
            .filter(|a| a.is_owned_by(&user.id))
            .ok_or_else(|| AppError::not_found("Agendamento"))?;

        if !current.invitees.iter().any(|i| i.status == InviteStatus::Pending) {
            return Ok(Outcome::new(Vec::new(), "Nenhum convite pendente para reenviar"));
        }

        let now = Utc::now();
        let mut resent = Vec::new();
        let resent_slot = &mut resent;

        let updated = self
            .store
            .modify(
                appointment_id,
                Box::new(move |a: &mut Appointment| {
                    let pending: Vec<String> = a
                        .invitees
                        .iter_mut()
                        .filter(|i| i.status == InviteStatus::Pending)
                        .map(|i| {
                            i.invited_at = Some(now);
                            i.email.clone()
                        })
                        .collect();

                    for email in &pending {
                        record(a, email, InviteAction::Resent, None, now);
                    }
                    *resent_slot = pending;
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| AppError::not_found("Agendamento"))?;

        if let Err(e) = self.dispatcher.notify_invited(&updated, &resent).await {
            warn!("Failed to resend invitations for appointment {}: {}", updated.id, e);
        }

        let message = format!("Convites reenviados para {} convidado(s)", resent.len());
        Ok(Outcome::new(resent, message))
    }
}
