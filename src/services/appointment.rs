use crate::{
    error::{AppError, Result},
    models::{
        appointment::{
            Appointment, AppointmentFilter, AppointmentInput, AppointmentStatistics, AppointmentStatus, EventType,
            PendingReminder,
        },
        response::Outcome,
    },
    services::{
        auth::User,
        calendar::CalendarMirror,
        invite,
        notification::NotificationDispatcher,
        reminder::ReminderHandle,
        store::AppointmentStore,
    },
    utils::{
        time::{normalize_range, parse_timestamp, renormalize_range, same_local_day},
        validation::{non_blank, normalize_email, normalize_invitees, normalize_title},
    },
};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Field-level changes made by one update, reported to the audience.
#[derive(Debug, Default)]
struct Changes {
    fields: Vec<String>,
    cancelled: bool,
    new_invitees: Vec<String>,
}

impl Changes {
    fn touch(&mut self, field: &str) {
        if !self.fields.iter().any(|f| f == field) {
            self.fields.push(field.to_string());
        }
    }
}

fn set_if_changed<T: PartialEq>(slot: &mut T, value: T, field: &str, changes: &mut Changes) {
    if *slot != value {
        *slot = value;
        changes.touch(field);
    }
}

/// Applies the provided fields of `input` onto `appointment`. Start/end are
/// handled by the caller since they depend on the timezone.
fn apply_patch(appointment: &mut Appointment, input: AppointmentInput, changes: &mut Changes) {
    if let Some(title) = input.title {
        set_if_changed(&mut appointment.title, normalize_title(Some(&title)), "titulo", changes);
    }
    if input.description.is_some() {
        set_if_changed(&mut appointment.description, non_blank(input.description), "descricao", changes);
    }
    if input.location.is_some() {
        set_if_changed(&mut appointment.location, non_blank(input.location), "local", changes);
    }
    if let Some(event_type) = input.event_type {
        set_if_changed(&mut appointment.event_type, event_type, "tipoEvento", changes);
    }
    if input.process_id.is_some() {
        set_if_changed(&mut appointment.process_id, input.process_id, "processoId", changes);
    }
    if input.recipient_id.is_some() {
        set_if_changed(&mut appointment.recipient_id, input.recipient_id, "destinatarioId", changes);
    }
    if let Some(flag) = input.remind_one_day {
        set_if_changed(&mut appointment.remind_one_day, flag, "lembrete1Dia", changes);
    }
    if let Some(flag) = input.remind_two_days {
        set_if_changed(&mut appointment.remind_two_days, flag, "lembrete2Dias", changes);
    }
    if let Some(flag) = input.remind_one_week {
        set_if_changed(&mut appointment.remind_one_week, flag, "lembrete1Semana", changes);
    }
    if let Some(status) = input.status {
        if status == AppointmentStatus::Cancelled && appointment.status != AppointmentStatus::Cancelled {
            changes.cancelled = true;
        }
        set_if_changed(&mut appointment.status, status, "status", changes);
    }
}

/// Ownership-scoped appointment CRUD. Anything the caller does not own is
/// reported as NotFound.
#[derive(Clone)]
pub struct AppointmentService {
    store: Arc<dyn AppointmentStore>,
    dispatcher: NotificationDispatcher,
    calendar: CalendarMirror,
    reminders: ReminderHandle,
    tz: Tz,
}

impl AppointmentService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        dispatcher: NotificationDispatcher,
        calendar: CalendarMirror,
        reminders: ReminderHandle,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            dispatcher,
            calendar,
            reminders,
            tz,
        }
    }

    async fn owned(&self, user: &User, id: &str) -> Result<Appointment> {
        self.store
            .get(id)
            .await?
            .filter(|a| a.is_owned_by(&user.id))
            .ok_or_else(|| AppError::not_found("Agendamento"))
    }

    pub async fn list(&self, user: &User, filter: &AppointmentFilter) -> Result<Vec<Appointment>> {
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        let start_after = filter.start_after.as_deref().and_then(|s| parse_timestamp(s, self.tz));
        let end_before = filter.end_before.as_deref().and_then(|s| parse_timestamp(s, self.tz));
        let event_type = filter.event_type.as_deref().and_then(EventType::parse);

        let mut appointments: Vec<Appointment> = self
            .store
            .load()
            .await?
            .into_iter()
            .filter(|a| a.is_owned_by(&user.id))
            .filter(|a| match &search {
                Some(term) => a.title.to_lowercase().contains(term),
                None => true,
            })
            .filter(|a| start_after.map_or(true, |after| a.start >= after))
            .filter(|a| end_before.map_or(true, |before| a.end <= before))
            .filter(|a| event_type.map_or(true, |t| a.event_type == t))
            .collect();

        appointments.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));

        debug!("Listed {} appointments for user {}", appointments.len(), user.id);
        Ok(appointments)
    }

    pub async fn create(&self, user: &User, input: AppointmentInput) -> Result<Outcome<Appointment>> {
        input.validate()?;

        let now = Utc::now();
        let (start, end) = normalize_range(input.start.as_deref(), input.end.as_deref(), now, self.tz)?;
        let invitees = normalize_invitees(input.invitees.as_deref().unwrap_or_default())?;

        let owner_email = Some(normalize_email(&user.email)).filter(|e| !e.is_empty());

        let mut appointment = Appointment {
            id: Uuid::new_v4().to_string(),
            owner_id: user.id.clone(),
            owner_email,
            title: normalize_title(input.title.as_deref()),
            description: non_blank(input.description),
            location: non_blank(input.location),
            start,
            end,
            event_type: input.event_type.unwrap_or_default(),
            process_id: input.process_id,
            recipient_id: input.recipient_id,
            status: AppointmentStatus::Scheduled,
            remind_one_day: input.remind_one_day.unwrap_or(false),
            remind_two_days: input.remind_two_days.unwrap_or(false),
            remind_one_week: input.remind_one_week.unwrap_or(false),
            invitees: Vec::new(),
            invite_history: Vec::new(),
            remote_event_id: None,
            remote_event_link: None,
            version: 0,
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        };
        let invited = invite::seed(&mut appointment, invitees, now);

        let appointment = self.store.insert(appointment).await?;
        info!("Appointment {} created by user {}", appointment.id, user.id);

        let (appointment, warning) = self.calendar.created(appointment).await;

        if let Err(e) = self.dispatcher.notify_created(&appointment).await {
            warn!("Failed to send creation notification: {}", e);
        }
        if !invited.is_empty() {
            if let Err(e) = self.dispatcher.notify_invited(&appointment, &invited).await {
                warn!("Failed to send invitations: {}", e);
            }
        }

        self.reminders.wake();

        Ok(Outcome::new(appointment, "Agendamento criado com sucesso").with_calendar_warning(warning))
    }

    pub async fn get(&self, user: &User, id: &str) -> Result<Appointment> {
        self.owned(user, id).await
    }

    /// Merges the provided fields. A cancellation notifies the audience with
    /// the reason; any other change notifies the list of changed fields.
    pub async fn update(&self, user: &User, id: &str, input: AppointmentInput) -> Result<Outcome<Appointment>> {
        input.validate()?;
        self.owned(user, id).await?;

        let invitees = match input.invitees.as_deref() {
            Some(list) => Some(normalize_invitees(list)?),
            None => None,
        };
        let reason = non_blank(input.cancellation_reason.clone());

        let now = Utc::now();
        let tz = self.tz;
        let owner_id = user.id.clone();
        let mut changes = Changes::default();
        let changes_slot = &mut changes;

        let updated = self
            .store
            .modify(
                id,
                Box::new(move |a: &mut Appointment| {
                    if !a.is_owned_by(&owner_id) {
                        return Err(AppError::not_found("Agendamento"));
                    }

                    let (start, end) =
                        renormalize_range((a.start, a.end), input.start.as_deref(), input.end.as_deref(), tz)?;
                    set_if_changed(&mut a.start, start, "data_inicio", changes_slot);
                    set_if_changed(&mut a.end, end, "data_fim", changes_slot);

                    apply_patch(a, input, changes_slot);

                    if let Some(list) = invitees {
                        let (added, changed) = invite::merge(a, list, now);
                        if changed {
                            changes_slot.touch("convidados");
                        }
                        changes_slot.new_invitees = added;
                    }

                    a.updated_at = now;
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| AppError::not_found("Agendamento"))?;

        info!(
            "Appointment {} updated by user {} ({} fields changed)",
            updated.id,
            user.id,
            changes.fields.len()
        );

        if changes.cancelled {
            if let Err(e) = self.dispatcher.notify_cancelled(&updated, reason.as_deref()).await {
                warn!("Failed to send cancellation notification: {}", e);
            }
        } else if !changes.fields.is_empty() {
            if let Err(e) = self.dispatcher.notify_updated(&updated, &changes.fields).await {
                warn!("Failed to send update notification: {}", e);
            }
        }
        if !changes.new_invitees.is_empty() && !changes.cancelled {
            if let Err(e) = self.dispatcher.notify_invited(&updated, &changes.new_invitees).await {
                warn!("Failed to send invitations: {}", e);
            }
        }

        let (updated, warning) = if changes.cancelled {
            self.calendar.cancelled(updated).await
        } else {
            self.calendar.updated(updated).await
        };

        self.reminders.wake();

        let message = if changes.cancelled {
            "Agendamento cancelado com sucesso"
        } else {
            "Agendamento atualizado com sucesso"
        };
        Ok(Outcome::new(updated, message).with_calendar_warning(warning))
    }

    /// Only the creator may delete. Invitees get Forbidden, anyone else
    /// NotFound.
    pub async fn delete(&self, user: &User, id: &str) -> Result<Outcome<()>> {
        let appointment = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("Agendamento"))?;

        if !appointment.is_owned_by(&user.id) {
            let invited = !user.email.is_empty() && appointment.has_invitee(&user.email);
            if invited {
                return Err(AppError::forbidden("Apenas o criador pode excluir este agendamento"));
            }
            return Err(AppError::not_found("Agendamento"));
        }

        let removed = self
            .store
            .remove(id)
            .await?
            .ok_or_else(|| AppError::not_found("Agendamento"))?;
        info!("Appointment {} deleted by user {}", removed.id, user.id);

        let warning = self.calendar.removed(&removed).await;
        self.reminders.wake();

        Ok(Outcome::new((), "Agendamento excluído com sucesso").with_calendar_warning(warning))
    }

    pub async fn statistics(&self, user: &User, now: DateTime<Utc>) -> Result<AppointmentStatistics> {
        let appointments = self.list(user, &AppointmentFilter::default()).await?;
        let week_end = now + Duration::days(7);

        let mut count_by_type = BTreeMap::new();
        let mut due_within_week = 0;
        let mut due_today = 0;

        for a in &appointments {
            *count_by_type.entry(a.event_type.as_str().to_string()).or_insert(0) += 1;

            if a.status == AppointmentStatus::Cancelled {
                continue;
            }
            if a.start >= now && a.start <= week_end {
                due_within_week += 1;
            }
            if same_local_day(a.start, now, self.tz) {
                due_today += 1;
            }
        }

        Ok(AppointmentStatistics {
            total: appointments.len(),
            due_within_week,
            due_today,
            count_by_type,
        })
    }

    /// Appointments the user is invited to, by e-mail.
    pub async fn list_invitations(&self, user: &User) -> Result<Vec<Appointment>> {
        if user.email.is_empty() {
            return Ok(Vec::new());
        }

        let mut invitations: Vec<Appointment> = self
            .store
            .load()
            .await?
            .into_iter()
            .filter(|a| a.has_invitee(&user.email))
            .collect();
        invitations.sort_by(|a, b| a.start.cmp(&b.start));

        Ok(invitations)
    }

    pub async fn pending_reminders(&self, user: &User, now: DateTime<Utc>) -> Result<Vec<PendingReminder>> {
        Ok(self
            .dispatcher
            .pending_reminders(now)
            .await?
            .into_iter()
            .filter(|p| p.appointment.is_owned_by(&user.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::appointment::{InviteStatus, InviteeInput};
    use crate::services::calendar::{DisabledCalendarSync, UNAVAILABLE};
    use crate::services::mailer::{MailTemplates, MemoryMailer};
    use crate::services::notification::DispatcherSettings;
    use crate::services::store::{JsonFileAppointmentStore, JsonFileNotificationStore, NotificationStore};
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        service: AppointmentService,
        notifications: Arc<JsonFileNotificationStore>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let appointments = Arc::new(JsonFileAppointmentStore::open(dir.path()).await.unwrap());
        let notifications = Arc::new(JsonFileNotificationStore::open(dir.path()).await.unwrap());
        let dispatcher = NotificationDispatcher::new(
            notifications.clone(),
            appointments.clone(),
            Arc::new(MemoryMailer::new()),
            MailTemplates::new("NPJ").unwrap(),
            DispatcherSettings {
                email_enabled: false,
                admin_emails: Vec::new(),
                max_retries: 3,
                tz: chrono_tz::America::Sao_Paulo,
            },
        );
        let calendar = CalendarMirror::new(Arc::new(DisabledCalendarSync), appointments.clone());

        Fixture {
            service: AppointmentService::new(
                appointments,
                dispatcher,
                calendar,
                ReminderHandle::new(),
                chrono_tz::America::Sao_Paulo,
            ),
            notifications,
            _dir: dir,
        }
    }

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            email: email.to_string(),
            name: None,
            role: None,
        }
    }

    fn input(title: &str, start: DateTime<Utc>) -> AppointmentInput {
        AppointmentInput {
            title: Some(title.to_string()),
            start: Some(start.to_rfc3339()),
            ..AppointmentInput::default()
        }
    }

    #[tokio::test]
    async fn test_create_defaults_end_to_one_hour() {
        let f = fixture().await;
        let start = Utc::now() + Duration::hours(2);

        let outcome = f.service.create(&user("1", "p@npj.br"), input("Reunião", start)).await.unwrap();
        let a = outcome.data;

        assert_eq!(a.end - a.start, Duration::hours(1));
        assert_eq!(a.status, AppointmentStatus::Scheduled);
        assert_eq!(a.owner_id, "1");
        assert_eq!(outcome.message, "Agendamento criado com sucesso");
        assert_eq!(outcome.calendar_warning.as_deref(), Some(UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_create_rejects_end_before_start() {
        let f = fixture().await;
        let start = Utc::now() + Duration::hours(2);
        let mut bad = input("x", start);
        bad.end = Some((start - Duration::hours(1)).to_rfc3339());

        let err = f.service.create(&user("1", ""), bad).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_blank_title_filled_in() {
        let f = fixture().await;
        let outcome = f
            .service
            .create(&user("1", ""), input("   ", Utc::now() + Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(outcome.data.title, "Untitled");
    }

    #[tokio::test]
    async fn test_invalid_invitee_email_rejected() {
        let f = fixture().await;
        let mut with_bad = input("x", Utc::now() + Duration::days(1));
        with_bad.invitees = Some(vec![InviteeInput::Email("not-an-email".to_string())]);

        let err = f.service.create(&user("1", ""), with_bad).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_other_owner_is_not_found() {
        let f = fixture().await;
        let created = f
            .service
            .create(&user("1", ""), input("Privado", Utc::now() + Duration::days(1)))
            .await
            .unwrap()
            .data;
        let stranger = user("2", "");

        let foreign = f.service.get(&stranger, &created.id).await.unwrap_err();
        let missing = f.service.get(&stranger, "does-not-exist").await.unwrap_err();
        assert_eq!(foreign.to_string(), missing.to_string());

        assert!(matches!(
            f.service.update(&stranger, &created.id, AppointmentInput::default()).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            f.service.delete(&stranger, &created.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invitee_cannot_delete() {
        let f = fixture().await;
        let mut with_invitee = input("Audiência", Utc::now() + Duration::days(1));
        with_invitee.invitees = Some(vec![InviteeInput::Email("aluno@npj.br".to_string())]);
        let created = f.service.create(&user("1", ""), with_invitee).await.unwrap().data;

        let err = f
            .service
            .delete(&user("5", "Aluno@npj.br"), &created.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));

        f.service.delete(&user("1", ""), &created.id).await.unwrap();
        assert!(matches!(
            f.service.get(&user("1", ""), &created.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let f = fixture().await;
        let owner = user("1", "");
        let base = Utc::now() + Duration::days(1);
        f.service.create(&owner, input("Reunião de equipe", base)).await.unwrap();
        f.service.create(&owner, input("REUNIÃO com cliente", base + Duration::hours(2))).await.unwrap();
        f.service.create(&owner, input("Audiência", base)).await.unwrap();

        let filter = AppointmentFilter {
            search: Some("reun".to_string()),
            ..AppointmentFilter::default()
        };
        let found = f.service.list(&owner, &filter).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].start <= found[1].start);
    }

    #[tokio::test]
    async fn test_update_start_keeps_duration() {
        let f = fixture().await;
        let owner = user("1", "");
        let start = Utc::now() + Duration::days(1);
        let mut create = input("Atendimento", start);
        create.end = Some((start + Duration::minutes(90)).to_rfc3339());
        let created = f.service.create(&owner, create).await.unwrap().data;

        let patch = AppointmentInput {
            start: Some((start + Duration::days(1)).to_rfc3339()),
            ..AppointmentInput::default()
        };
        let updated = f.service.update(&owner, &created.id, patch).await.unwrap().data;

        assert_eq!(updated.end - updated.start, Duration::minutes(90));
        assert_eq!(updated.title, "Atendimento");
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn test_cancel_notifies_active_audience() {
        let f = fixture().await;
        let owner = user("1", "");
        let mut create = input("Audiência", Utc::now() + Duration::days(1));
        create.invitees = Some(vec![
            InviteeInput::Email("a@x.com".to_string()),
            InviteeInput::Email("b@x.com".to_string()),
        ]);
        let created = f.service.create(&owner, create).await.unwrap().data;

        let patch = AppointmentInput {
            status: Some(AppointmentStatus::Cancelled),
            cancellation_reason: Some("Juiz indisponível".to_string()),
            ..AppointmentInput::default()
        };
        let outcome = f.service.update(&owner, &created.id, patch).await.unwrap();
        assert_eq!(outcome.data.status, AppointmentStatus::Cancelled);

        let inbox = f.notifications.list_for_recipients(&["a@x.com".to_string()]).await.unwrap();
        assert!(inbox.iter().any(|n| n.message.contains("Juiz indisponível")));
    }

    #[tokio::test]
    async fn test_update_merges_invitees() {
        let f = fixture().await;
        let owner = user("1", "");
        let mut create = input("Reunião", Utc::now() + Duration::days(1));
        create.invitees = Some(vec![InviteeInput::Email("a@x.com".to_string())]);
        let created = f.service.create(&owner, create).await.unwrap().data;

        let patch = AppointmentInput {
            invitees: Some(vec![
                InviteeInput::Email("A@x.com".to_string()),
                InviteeInput::Email("c@x.com".to_string()),
            ]),
            ..AppointmentInput::default()
        };
        let updated = f.service.update(&owner, &created.id, patch).await.unwrap().data;

        assert_eq!(updated.invitees.len(), 2);
        assert_eq!(updated.invitee("c@x.com").unwrap().status, InviteStatus::Pending);
        let inbox = f.notifications.list_for_recipients(&["c@x.com".to_string()]).await.unwrap();
        assert!(!inbox.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let f = fixture().await;
        let owner = user("1", "");
        let now = Utc::now();
        f.service.create(&owner, input("Em três dias", now + Duration::days(3))).await.unwrap();
        f.service.create(&owner, input("Em um mês", now + Duration::days(30))).await.unwrap();
        let mut hearing = input("Audiência", now + Duration::days(2));
        hearing.event_type = Some(EventType::Hearing);
        f.service.create(&owner, hearing).await.unwrap();
        f.service.create(&user("2", ""), input("Outro dono", now + Duration::days(1))).await.unwrap();

        let stats = f.service.statistics(&owner, now).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.due_within_week, 2);
        assert_eq!(stats.count_by_type.get(EventType::Hearing.as_str()), Some(&1));
    }

    #[tokio::test]
    async fn test_list_invitations_by_email() {
        let f = fixture().await;
        let mut create = input("Reunião", Utc::now() + Duration::days(1));
        create.invitees = Some(vec![InviteeInput::Email("aluno@npj.br".to_string())]);
        f.service.create(&user("1", ""), create).await.unwrap();

        let mine = f.service.list_invitations(&user("5", "aluno@npj.br")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert!(f.service.list_invitations(&user("6", "")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_reminders_scoped_to_owner() {
        let f = fixture().await;
        let now = Utc::now();
        let mut mine = input("Prazo", now + Duration::hours(20));
        mine.remind_one_day = Some(true);
        f.service.create(&user("1", ""), mine).await.unwrap();
        let mut theirs = input("Prazo alheio", now + Duration::hours(20));
        theirs.remind_one_day = Some(true);
        f.service.create(&user("2", ""), theirs).await.unwrap();

        let pending = f.service.pending_reminders(&user("1", ""), now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].appointment.title, "Prazo");
    }

    #[tokio::test]
    async fn test_far_future_year_rejected_and_store_reloads() {
        let f = fixture().await;
        let owner = user("1", "");
        f.service
            .create(&owner, input("Normal", Utc.with_ymd_and_hms(2030, 3, 1, 13, 0, 0).unwrap()))
            .await
            .unwrap();

        let far = AppointmentInput {
            title: Some("Distante".to_string()),
            start: Some("+10000-01-01T10:00".to_string()),
            ..AppointmentInput::default()
        };
        let err = f.service.create(&owner, far).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let reopened = JsonFileAppointmentStore::open(f._dir.path()).await.unwrap();
        let stored = reopened.load().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "Normal");
    }
}
