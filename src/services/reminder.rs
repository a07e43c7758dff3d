use crate::{
    error::Result,
    models::appointment::{AppointmentStatus, ReminderWindow},
    services::{notification::NotificationDispatcher, store::AppointmentStore},
};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// One reminder window of one appointment, ordered by the instant it is due.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DueReminder {
    pub fire_at: DateTime<Utc>,
    pub appointment_id: String,
    pub window: ReminderWindow,
}

/// Wakes the scheduler after appointments change.
#[derive(Clone, Default)]
pub struct ReminderHandle {
    wake: Arc<Notify>,
}

impl ReminderHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

pub struct ReminderScheduler {
    appointments: Arc<dyn AppointmentStore>,
    dispatcher: NotificationDispatcher,
    handle: ReminderHandle,
    idle_ceiling: Duration,
    queue: BinaryHeap<Reverse<DueReminder>>,
    fired: HashSet<DueReminder>,
}

impl ReminderScheduler {
    pub fn new(
        appointments: Arc<dyn AppointmentStore>,
        dispatcher: NotificationDispatcher,
        handle: ReminderHandle,
        idle_ceiling: Duration,
    ) -> Self {
        Self {
            appointments,
            dispatcher,
            handle,
            idle_ceiling,
            queue: BinaryHeap::new(),
            fired: HashSet::new(),
        }
    }

    /// Reloads the queue from the store: every enabled window of every
    /// scheduled future appointment that has not fired yet.
    pub async fn rebuild(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = Vec::new();

        for appointment in self.appointments.load().await? {
            if appointment.status != AppointmentStatus::Scheduled || appointment.start <= now {
                continue;
            }
            for window in appointment.enabled_windows() {
                entries.push(DueReminder {
                    fire_at: appointment.start - window.lead_time(),
                    appointment_id: appointment.id.clone(),
                    window,
                });
            }
        }

        // Forget fired entries whose appointment moved, was cancelled or is over
        self.fired.retain(|f| entries.contains(f));

        self.queue = entries
            .into_iter()
            .filter(|e| !self.fired.contains(e))
            .map(Reverse)
            .collect();

        Ok(self.queue.len())
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.queue.peek().map(|Reverse(e)| e.fire_at)
    }

    /// Pops and sends everything due at `now`. Each entry is checked against
    /// the stored appointment first, so stale entries are dropped.
    pub async fn fire_due(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut sent = 0;

        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.fire_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };

            let Some(appointment) = self.appointments.get(&entry.appointment_id).await? else {
                continue;
            };

            let still_valid = appointment.status == AppointmentStatus::Scheduled
                && appointment.window_enabled(entry.window)
                && appointment.start - entry.window.lead_time() == entry.fire_at
                && appointment.start > now;
            if !still_valid {
                debug!(
                    "Dropping stale reminder {:?} for appointment {}",
                    entry.window, entry.appointment_id
                );
                continue;
            }

            sent += self.dispatcher.send_reminder(&appointment, entry.window).await?.len();
            self.fired.insert(entry);
        }

        Ok(sent)
    }

    fn sleep_for(&self, now: DateTime<Utc>) -> Duration {
        match self.next_fire_at() {
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.idle_ceiling),
            None => self.idle_ceiling,
        }
    }

    /// Runs until the task is dropped: sleeps until the earliest reminder,
    /// the idle ceiling or a wake signal, whichever comes first.
    pub async fn run(mut self) {
        info!(
            "Reminder scheduler started (idle ceiling {}s)",
            self.idle_ceiling.as_secs()
        );

        loop {
            let now = Utc::now();

            if let Err(e) = self.rebuild(now).await {
                error!("Failed to rebuild reminder queue: {}", e);
            }
            match self.fire_due(now).await {
                Ok(0) => {}
                Ok(sent) => info!("Reminder scheduler sent {} notifications", sent),
                Err(e) => error!("Failed to send due reminders: {}", e),
            }

            let wait = self.sleep_for(Utc::now());
            debug!("Next reminder check in {:?}", wait);

            let wake = self.handle.wake.clone();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wake.notified() => {
                    debug!("Reminder scheduler woken by appointment change");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::appointment::{Appointment, EventType};
    use crate::services::mailer::{MailTemplates, MemoryMailer};
    use crate::services::notification::{reminder_key, DispatcherSettings};
    use crate::services::store::{JsonFileAppointmentStore, JsonFileNotificationStore, NotificationStore};
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    struct Fixture {
        scheduler: ReminderScheduler,
        appointments: Arc<JsonFileAppointmentStore>,
        notifications: Arc<JsonFileNotificationStore>,
        handle: ReminderHandle,
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
        let handle = ReminderHandle::new();
        let scheduler = ReminderScheduler::new(
            appointments.clone(),
            dispatcher,
            handle.clone(),
            Duration::from_secs(60),
        );

        Fixture {
            scheduler,
            appointments,
            notifications,
            handle,
            _dir: dir,
        }
    }

    fn appointment(id: &str, start: DateTime<Utc>) -> Appointment {
        Appointment {
            id: id.to_string(),
            owner_id: "7".to_string(),
            owner_email: None,
            title: "Prazo de contestação".to_string(),
            description: None,
            location: None,
            start,
            end: start + ChronoDuration::hours(1),
            event_type: EventType::Deadline,
            process_id: Some("proc-9".to_string()),
            recipient_id: None,
            status: AppointmentStatus::Scheduled,
            remind_one_day: true,
            remind_two_days: true,
            remind_one_week: false,
            invitees: Vec::new(),
            invite_history: Vec::new(),
            remote_event_id: None,
            remote_event_link: None,
            version: 0,
            created_at: start,
            updated_at: start,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_queue_is_ordered_by_fire_time() {
        let mut f = fixture().await;
        let now = Utc::now();
        f.appointments.insert(appointment("late", now + ChronoDuration::days(5))).await.unwrap();
        f.appointments.insert(appointment("early", now + ChronoDuration::days(3))).await.unwrap();

        assert_eq!(f.scheduler.rebuild(now).await.unwrap(), 4);
        // two-day window of the appointment three days out
        assert_eq!(
            f.scheduler.next_fire_at(),
            Some(now + ChronoDuration::days(3) - ChronoDuration::days(2))
        );
    }

    #[tokio::test]
    async fn test_fire_due_sends_once() {
        let mut f = fixture().await;
        let now = Utc::now();
        f.appointments.insert(appointment("a", now + ChronoDuration::hours(30))).await.unwrap();

        f.scheduler.rebuild(now).await.unwrap();
        // only the two-day window is due 30h ahead
        assert_eq!(f.scheduler.fire_due(now).await.unwrap(), 1);

        let sent = f
            .notifications
            .find_by_dedupe_key(&reminder_key("a", ReminderWindow::TwoDays))
            .await
            .unwrap();
        assert_eq!(sent.len(), 1);

        f.scheduler.rebuild(now).await.unwrap();
        assert_eq!(f.scheduler.fire_due(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_moved_appointment_entry_is_dropped() {
        let mut f = fixture().await;
        let now = Utc::now();
        f.appointments.insert(appointment("a", now + ChronoDuration::hours(30))).await.unwrap();
        f.scheduler.rebuild(now).await.unwrap();

        f.appointments
            .modify(
                "a",
                Box::new(|a: &mut Appointment| {
                    a.start = a.start + ChronoDuration::days(10);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(f.scheduler.fire_due(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_wakes_on_signal() {
        let f = fixture().await;
        let task = tokio::spawn(f.scheduler.run());

        f.appointments
            .insert(appointment("wake", Utc::now() + ChronoDuration::hours(2)))
            .await
            .unwrap();
        f.handle.wake();

        let key = reminder_key("wake", ReminderWindow::OneDay);
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !f.notifications.find_by_dedupe_key(&key).await.unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        task.abort();
        assert!(found.is_ok());
    }
}
