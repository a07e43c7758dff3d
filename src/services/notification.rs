use crate::{
    config::Config,
    error::{AppError, Result},
    models::{
        appointment::{Appointment, AppointmentStatus, InviteDecision, Invitee, PendingReminder, ReminderWindow},
        notification::{
            CreateNotificationRequest, DeliveryStatus, Notification, NotificationChannel, NotificationKind,
        },
        response::Outcome,
    },
    services::{
        auth::User,
        mailer::{MailTemplates, Mailer},
        store::{AppointmentStore, NotificationStore},
    },
    utils::validation::normalize_email,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Composite dedupe key of one reminder window of one appointment.
pub fn reminder_key(appointment_id: &str, window: ReminderWindow) -> String {
    format!("lembrete:{}:{}", appointment_id, window.key())
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub email_enabled: bool,
    pub admin_emails: Vec<String>,
    pub max_retries: u32,
    pub tz: Tz,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            email_enabled: config.enable_email_notifications,
            admin_emails: config.admin_notification_emails.clone(),
            max_retries: config.notification_max_retries,
            tz: config.tz(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Recipient {
    id: String,
    email: Option<String>,
}

impl Recipient {
    fn owner(appointment: &Appointment) -> Self {
        Self {
            id: appointment.owner_id.clone(),
            email: appointment.owner_email.clone(),
        }
    }

    /// Invitees and admins have no account id here; their address is used.
    fn by_email(email: &str) -> Self {
        let email = normalize_email(email);
        Self {
            id: email.clone(),
            email: Some(email),
        }
    }

    fn same_as(&self, other: &Recipient) -> bool {
        self.id == other.id || (self.email.is_some() && self.email == other.email)
    }
}

fn push_unique(recipients: &mut Vec<Recipient>, candidate: Recipient) {
    if !recipients.iter().any(|r| r.same_as(&candidate)) {
        recipients.push(candidate);
    }
}

/// Owner first, then every invitee that has not declined.
fn audience(appointment: &Appointment) -> Vec<Recipient> {
    let mut recipients = vec![Recipient::owner(appointment)];
    for invitee in appointment.active_invitees() {
        push_unique(&mut recipients, Recipient::by_email(&invitee.email));
    }
    recipients
}

struct Draft<'a> {
    appointment: &'a Appointment,
    kind: NotificationKind,
    title: String,
    message: String,
    dedupe_key: Option<String>,
}

/// Turns scheduling events into notification records and, when enabled,
/// e-mail. Delivery is best-effort: failures are recorded on the
/// notification and retried later, they never undo the triggering change.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    appointments: Arc<dyn AppointmentStore>,
    mailer: Arc<dyn Mailer>,
    templates: Arc<MailTemplates>,
    settings: DispatcherSettings,
    reminder_lock: Arc<Mutex<()>>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        appointments: Arc<dyn AppointmentStore>,
        mailer: Arc<dyn Mailer>,
        templates: MailTemplates,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            appointments,
            mailer,
            templates: Arc::new(templates),
            settings,
            reminder_lock: Arc::new(Mutex::new(())),
        }
    }

    fn when(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.settings.tz)
            .format("%d/%m/%Y %H:%M")
            .to_string()
    }

    fn channel_for(&self, recipient: &Recipient) -> NotificationChannel {
        if self.settings.email_enabled && recipient.email.is_some() {
            NotificationChannel::Both
        } else {
            NotificationChannel::System
        }
    }

    async fn dispatch(&self, recipient: &Recipient, draft: &Draft<'_>) -> Result<Notification> {
        let request = CreateNotificationRequest {
            recipient_id: recipient.id.clone(),
            recipient_email: recipient.email.clone(),
            appointment_id: Some(draft.appointment.id.clone()),
            process_id: draft.appointment.process_id.clone(),
            kind: draft.kind,
            channel: self.channel_for(recipient),
            title: draft.title.clone(),
            message: draft.message.clone(),
            dedupe_key: draft.dedupe_key.clone(),
        };

        let notification = self
            .store
            .insert(Notification::from_request(request, Utc::now()))
            .await?;
        self.deliver(notification).await
    }

    async fn fan_out(&self, recipients: &[Recipient], draft: Draft<'_>) -> Result<Vec<Notification>> {
        let mut created = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            created.push(self.dispatch(recipient, &draft).await?);
        }
        debug!(
            "Created {} '{}' notifications for appointment {}",
            created.len(),
            draft.title,
            draft.appointment.id
        );
        Ok(created)
    }

    /// Moves a notification to `sent`, or to `error` with the retry counter
    /// bumped when the e-mail could not be delivered.
    async fn deliver(&self, notification: Notification) -> Result<Notification> {
        // 只有需要邮件且有地址时才发送，站内通知已经存在
        let failure = match (notification.wants_email(), notification.recipient_email.as_deref()) {
            (true, Some(to)) => match self.templates.render(&notification, to) {
                Ok(mail) => self.mailer.send(&mail).await.err().map(|e| e.to_string()),
                // 模板渲染失败也记为发送失败，交给重试
                Err(e) => Some(e.to_string()),
            },
            _ => None,
        };

        if let Some(reason) = &failure {
            warn!("Failed to deliver notification {}: {}", notification.id, reason);
        }

        let id = notification.id.clone();
        let updated = self
            .store
            .modify(
                &id,
                Box::new(move |n: &mut Notification| {
                    match failure {
                        Some(reason) => {
                            n.status = DeliveryStatus::Error;
                            n.retry_count += 1;
                            n.last_error = Some(reason);
                        }
                        None => {
                            n.status = DeliveryStatus::Sent;
                            n.sent_at = Some(Utc::now());
                            n.last_error = None;
                        }
                    }
                    Ok(())
                }),
            )
            .await?;

        updated.ok_or_else(|| AppError::not_found("Notificação"))
    }

    /// Confirmation for the creator, plus a notice for the targeted user
    /// when the appointment was created on someone else's behalf.
    pub async fn notify_created(&self, appointment: &Appointment) -> Result<Vec<Notification>> {
        let when = self.when(appointment.start);
        let mut created = Vec::new();

        if let Some(target) = appointment
            .recipient_id
            .as_deref()
            .filter(|target| *target != appointment.owner_id)
        {
            let recipient = Recipient {
                id: target.to_string(),
                email: None,
            };
            created.extend(
                self.fan_out(
                    &[recipient],
                    Draft {
                        appointment,
                        kind: NotificationKind::Info,
                        title: "Novo agendamento".to_string(),
                        message: format!(
                            "Um agendamento foi criado para você: \"{}\" em {}.",
                            appointment.title, when
                        ),
                        dedupe_key: None,
                    },
                )
                .await?,
            );
        }

        created.extend(
            self.fan_out(
                &[Recipient::owner(appointment)],
                Draft {
                    appointment,
                    kind: NotificationKind::System,
                    title: "Agendamento criado".to_string(),
                    message: format!(
                        "Seu agendamento \"{}\" para {} foi criado com sucesso.",
                        appointment.title, when
                    ),
                    dedupe_key: None,
                },
            )
            .await?,
        );

        Ok(created)
    }

    /// Invitation for each address in `emails`.
    pub async fn notify_invited(&self, appointment: &Appointment, emails: &[String]) -> Result<Vec<Notification>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let mut recipients = Vec::new();
        for email in emails {
            push_unique(&mut recipients, Recipient::by_email(email));
        }

        let location = appointment
            .location
            .as_deref()
            .map(|l| format!(" Local: {}.", l))
            .unwrap_or_default();

        self.fan_out(
            &recipients,
            Draft {
                appointment,
                kind: NotificationKind::Info,
                title: format!("Convite: {}", appointment.title),
                message: format!(
                    "Você foi convidado para \"{}\" em {}.{} Responda aceitando ou recusando o convite.",
                    appointment.title,
                    self.when(appointment.start),
                    location
                ),
                dedupe_key: None,
            },
        )
        .await
    }

    pub async fn notify_updated(&self, appointment: &Appointment, changed: &[String]) -> Result<Vec<Notification>> {
        let fields = if changed.is_empty() {
            "detalhes".to_string()
        } else {
            changed.join(", ")
        };

        self.fan_out(
            &audience(appointment),
            Draft {
                appointment,
                kind: NotificationKind::Alert,
                title: "Agendamento atualizado".to_string(),
                message: format!(
                    "O agendamento \"{}\" foi alterado ({}). Data: {}.",
                    appointment.title,
                    fields,
                    self.when(appointment.start)
                ),
                dedupe_key: None,
            },
        )
        .await
    }

    pub async fn notify_cancelled(&self, appointment: &Appointment, reason: Option<&str>) -> Result<Vec<Notification>> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| format!(" Motivo: {}", r))
            .unwrap_or_default();

        self.fan_out(
            &audience(appointment),
            Draft {
                appointment,
                kind: NotificationKind::Alert,
                title: "Agendamento cancelado".to_string(),
                message: format!(
                    "O agendamento \"{}\" de {} foi cancelado.{}",
                    appointment.title,
                    self.when(appointment.start),
                    reason
                ),
                dedupe_key: None,
            },
        )
        .await
    }

    /// Tells the owner about an invite response. Declines also go to the
    /// configured admin addresses.
    pub async fn notify_invite_response(
        &self,
        appointment: &Appointment,
        invitee: &Invitee,
        decision: InviteDecision,
        justification: Option<&str>,
    ) -> Result<Vec<Notification>> {
        let who = invitee.name.as_deref().unwrap_or(&invitee.email);

        let (title, message, kind) = match decision {
            InviteDecision::Accept => (
                "Convite aceito".to_string(),
                format!("{} aceitou o convite para \"{}\".", who, appointment.title),
                NotificationKind::Info,
            ),
            InviteDecision::Decline => (
                "Convite recusado".to_string(),
                format!(
                    "{} recusou o convite para \"{}\". Justificativa: {}",
                    who,
                    appointment.title,
                    justification.unwrap_or("-")
                ),
                NotificationKind::Alert,
            ),
        };

        let mut recipients = vec![Recipient::owner(appointment)];
        if decision == InviteDecision::Decline {
            for admin in &self.settings.admin_emails {
                push_unique(&mut recipients, Recipient::by_email(admin));
            }
        }

        self.fan_out(
            &recipients,
            Draft {
                appointment,
                kind,
                title,
                message,
                dedupe_key: None,
            },
        )
        .await
    }

    /// Appointments whose start falls inside an enabled reminder window from
    /// `now`, with the windows still owed to at least one recipient.
    pub async fn pending_reminders(&self, now: DateTime<Utc>) -> Result<Vec<PendingReminder>> {
        let mut pending = Vec::new();

        for appointment in self.appointments.load().await? {
            if appointment.status != AppointmentStatus::Scheduled || appointment.start <= now {
                continue;
            }

            let mut windows = Vec::new();
            for window in appointment.enabled_windows() {
                if appointment.start > now + window.lead_time() {
                    continue;
                }
                if self.owed_recipients(&appointment, window).await?.is_empty() {
                    continue;
                }
                windows.push(window);
            }

            if !windows.is_empty() {
                pending.push(PendingReminder { appointment, windows });
            }
        }

        pending.sort_by(|a, b| a.appointment.start.cmp(&b.appointment.start));
        Ok(pending)
    }

    /// Recipients with no reminder yet for this window. A reminder that
    /// exists counts whatever its delivery state: a failed e-mail is
    /// `retry_failed`'s to finish or give up on, and the inbox copy is
    /// already there.
    async fn owed_recipients(&self, appointment: &Appointment, window: ReminderWindow) -> Result<Vec<Recipient>> {
        let existing = self
            .store
            .find_by_dedupe_key(&reminder_key(&appointment.id, window))
            .await?;

        Ok(audience(appointment)
            .into_iter()
            .filter(|r| !existing.iter().any(|n| n.recipient_id == r.id))
            .collect())
    }

    /// Sends one reminder per (window, recipient) still owed, so calling
    /// this repeatedly is harmless.
    pub async fn send_reminder(&self, appointment: &Appointment, window: ReminderWindow) -> Result<Vec<Notification>> {
        let _guard = self.reminder_lock.lock().await;

        let key = reminder_key(&appointment.id, window);
        let recipients = self.owed_recipients(appointment, window).await?;

        if recipients.is_empty() {
            debug!("Reminder {} already sent", key);
            return Ok(Vec::new());
        }

        let sent = self
            .fan_out(
                &recipients,
                Draft {
                    appointment,
                    kind: NotificationKind::Reminder,
                    title: format!("Lembrete: {}", appointment.title),
                    message: format!(
                        "\"{}\" acontece em {} ({}).",
                        appointment.title,
                        window.label(),
                        self.when(appointment.start)
                    ),
                    dedupe_key: Some(key.clone()),
                },
            )
            .await?;

        info!("Reminder {} sent to {} recipients", key, sent.len());
        Ok(sent)
    }

    /// Pull-style sweep: sends every reminder that is currently due.
    pub async fn dispatch_due_reminders(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut count = 0;
        for pending in self.pending_reminders(now).await? {
            for window in &pending.windows {
                count += self.send_reminder(&pending.appointment, *window).await?.len();
            }
        }
        Ok(count)
    }

    /// Re-attempts failed deliveries still under the retry limit. Returns
    /// how many went through.
    pub async fn retry_failed(&self) -> Result<usize> {
        let failed = self.store.list_retryable(self.settings.max_retries).await?;
        if failed.is_empty() {
            return Ok(0);
        }

        debug!("Retrying {} failed notifications", failed.len());
        let mut delivered = 0;
        for notification in failed {
            if self.deliver(notification).await?.status == DeliveryStatus::Sent {
                delivered += 1;
            }
        }

        info!("Notification retry: {} delivered", delivered);
        Ok(delivered)
    }
}

/// The recipient's inbox.
#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, user: &User) -> Result<Vec<Notification>> {
        self.store.list_for_recipients(&user.identities()).await
    }

    pub async fn unread_count(&self, user: &User) -> Result<usize> {
        Ok(self
            .list(user)
            .await?
            .iter()
            .filter(|n| n.status != DeliveryStatus::Read)
            .count())
    }

    /// Only the recipient may mark a notification read; anyone else gets
    /// NotFound.
    pub async fn mark_read(&self, user: &User, id: &str) -> Result<Outcome<Notification>> {
        let identities = user.identities();
        let notification = self
            .store
            .get(id)
            .await?
            .filter(|n| identities.contains(&n.recipient_id))
            .ok_or_else(|| AppError::not_found("Notificação"))?;

        if notification.status == DeliveryStatus::Read {
            return Ok(Outcome::new(notification, "Notificação já estava marcada como lida"));
        }

        let updated = self
            .store
            .modify(
                id,
                Box::new(|n: &mut Notification| {
                    n.status = DeliveryStatus::Read;
                    n.read_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| AppError::not_found("Notificação"))?;

        Ok(Outcome::new(updated, "Notificação marcada como lida"))
    }
}
