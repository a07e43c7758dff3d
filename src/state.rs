use crate::{
    config::Config,
    error::Result,
    services::{
        appointment::AppointmentService,
        auth::AuthService,
        calendar::{CalendarMirror, CalendarSync},
        invite::InviteService,
        mailer::{MailTemplates, Mailer},
        notification::{DispatcherSettings, NotificationDispatcher, NotificationService},
        reminder::ReminderHandle,
        store::{AppointmentStore, NotificationStore},
    },
};
use std::sync::Arc;

/// Shared application state: configuration, stores and the services built on
/// them.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,

    pub appointments: Arc<dyn AppointmentStore>,
    pub notifications: Arc<dyn NotificationStore>,

    pub auth_service: AuthService,
    pub appointment_service: AppointmentService,
    pub invite_service: InviteService,
    pub notification_service: NotificationService,

    /// Used by background tasks for reminders and retries
    pub dispatcher: NotificationDispatcher,
    pub reminders: ReminderHandle,
}

impl AppState {
    /// Wires the services over the given stores and collaborators.
    pub fn build(
        config: Config,
        appointments: Arc<dyn AppointmentStore>,
        notifications: Arc<dyn NotificationStore>,
        mailer: Arc<dyn Mailer>,
        calendar: Arc<dyn CalendarSync>,
    ) -> Result<Self> {
        let templates = MailTemplates::new(&config.smtp_from_name)?;
        let dispatcher = NotificationDispatcher::new(
            notifications.clone(),
            appointments.clone(),
            mailer,
            templates,
            DispatcherSettings::from_config(&config),
        );
        let mirror = CalendarMirror::new(calendar, appointments.clone());
        let reminders = ReminderHandle::new();

        Ok(Self {
            auth_service: AuthService::new(&config),
            appointment_service: AppointmentService::new(
                appointments.clone(),
                dispatcher.clone(),
                mirror.clone(),
                reminders.clone(),
                config.tz(),
            ),
            invite_service: InviteService::new(appointments.clone(), dispatcher.clone(), mirror),
            notification_service: NotificationService::new(notifications.clone()),
            dispatcher,
            reminders,
            appointments,
            notifications,
            config,
        })
    }

    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        match feature {
            "email_notifications" => self.config.enable_email_notifications,
            "google_calendar" => self.config.google_calendar_configured(),
            _ => false,
        }
    }

    /// Writes any buffered state; called on shutdown.
    pub async fn flush(&self) {
        if let Err(e) = self.appointments.flush().await {
            tracing::error!("Failed to flush appointment store: {}", e);
        }
        if let Err(e) = self.notifications.flush().await {
            tracing::error!("Failed to flush notification store: {}", e);
        }
    }
}
