use crate::{
    error::Result,
    models::{appointment::Appointment, notification::Notification},
    utils::json_file::{JsonCollection, Record},
};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

pub const APPOINTMENTS_FILE: &str = "agendamentos.json";
pub const NOTIFICATIONS_FILE: &str = "notificacoes.json";

/// In-place change applied by a store under its lock or transaction.
pub type Mutation<'a, T> = Box<dyn FnOnce(&mut T) -> Result<()> + Send + 'a>;

/// Durable keyed storage of appointments. Implementations serialize
/// concurrent writers: every `modify` reads the current record, applies the
/// mutation and writes it back atomically, bumping `version`.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Every stored appointment, any owner.
    async fn load(&self) -> Result<Vec<Appointment>>;

    /// Replaces the whole collection.
    async fn save(&self, appointments: Vec<Appointment>) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Appointment>>;

    async fn insert(&self, appointment: Appointment) -> Result<Appointment>;

    /// `Ok(None)` when no record has this id.
    async fn modify(&self, id: &str, mutation: Mutation<'_, Appointment>) -> Result<Option<Appointment>>;

    async fn remove(&self, id: &str) -> Result<Option<Appointment>>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: Notification) -> Result<Notification>;

    async fn get(&self, id: &str) -> Result<Option<Notification>>;

    async fn modify(&self, id: &str, mutation: Mutation<'_, Notification>) -> Result<Option<Notification>>;

    /// Newest first.
    async fn list_for_recipients(&self, recipients: &[String]) -> Result<Vec<Notification>>;

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Vec<Notification>>;

    /// Failed deliveries whose retry counter is still below `max_retries`.
    async fn list_retryable(&self, max_retries: u32) -> Result<Vec<Notification>>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl Record for Appointment {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Record for Notification {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Development store: one JSON array file.
pub struct JsonFileAppointmentStore {
    collection: JsonCollection<Appointment>,
}

impl JsonFileAppointmentStore {
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = data_dir.into().join(APPOINTMENTS_FILE);
        info!("Using appointment file {}", path.display());
        Ok(Self {
            collection: JsonCollection::open(path).await?,
        })
    }
}

#[async_trait]
impl AppointmentStore for JsonFileAppointmentStore {
    async fn load(&self) -> Result<Vec<Appointment>> {
        Ok(self.collection.snapshot().await)
    }

    async fn save(&self, appointments: Vec<Appointment>) -> Result<()> {
        self.collection.replace_all(appointments).await
    }

    async fn get(&self, id: &str) -> Result<Option<Appointment>> {
        Ok(self.collection.find(id).await)
    }

    async fn insert(&self, appointment: Appointment) -> Result<Appointment> {
        self.collection.insert(appointment).await
    }

    async fn modify(&self, id: &str, mutation: Mutation<'_, Appointment>) -> Result<Option<Appointment>> {
        self.collection.modify(id, mutation).await
    }

    async fn remove(&self, id: &str) -> Result<Option<Appointment>> {
        self.collection.remove(id).await
    }

    async fn flush(&self) -> Result<()> {
        self.collection.flush().await
    }
}

pub struct JsonFileNotificationStore {
    collection: JsonCollection<Notification>,
}

impl JsonFileNotificationStore {
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = data_dir.into().join(NOTIFICATIONS_FILE);
        info!("Using notification file {}", path.display());
        Ok(Self {
            collection: JsonCollection::open(path).await?,
        })
    }
}

#[async_trait]
impl NotificationStore for JsonFileNotificationStore {
    async fn insert(&self, notification: Notification) -> Result<Notification> {
        self.collection.insert(notification).await
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        Ok(self.collection.find(id).await)
    }

    async fn modify(&self, id: &str, mutation: Mutation<'_, Notification>) -> Result<Option<Notification>> {
        self.collection.modify(id, mutation).await
    }

    async fn list_for_recipients(&self, recipients: &[String]) -> Result<Vec<Notification>> {
        let mut found = self
            .collection
            .find_by(|n| recipients.iter().any(|r| r == &n.recipient_id))
            .await;
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Vec<Notification>> {
        Ok(self
            .collection
            .find_by(|n| n.dedupe_key.as_deref() == Some(key))
            .await)
    }

    async fn list_retryable(&self, max_retries: u32) -> Result<Vec<Notification>> {
        use crate::models::notification::DeliveryStatus;

        Ok(self
            .collection
            .find_by(|n| n.status == DeliveryStatus::Error && n.retry_count < max_retries)
            .await)
    }

    async fn flush(&self) -> Result<()> {
        self.collection.flush().await
    }
}
