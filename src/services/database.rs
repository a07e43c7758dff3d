use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{appointment::Appointment, notification::Notification};
use crate::services::store::{AppointmentStore, Mutation, NotificationStore};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use tracing::{error, info};

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS agendamentos (
        id TEXT PRIMARY KEY,
        usuario_id TEXT NOT NULL,
        data_inicio TIMESTAMPTZ NOT NULL,
        versao BIGINT NOT NULL DEFAULT 1,
        dados JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_agendamentos_usuario ON agendamentos (usuario_id)",
    "CREATE INDEX IF NOT EXISTS idx_agendamentos_inicio ON agendamentos (data_inicio)",
    r#"
    CREATE TABLE IF NOT EXISTS notificacoes (
        id TEXT PRIMARY KEY,
        usuario_id TEXT NOT NULL,
        status TEXT NOT NULL,
        tentativas INTEGER NOT NULL DEFAULT 0,
        chave_deduplicacao TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        versao BIGINT NOT NULL DEFAULT 1,
        dados JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_notificacoes_usuario ON notificacoes (usuario_id)",
    "CREATE INDEX IF NOT EXISTS idx_notificacoes_chave ON notificacoes (chave_deduplicacao)",
];

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self> {
        info!("Initializing database connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn verify_connection(&self) -> Result<()> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                info!("Database connection verified successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to verify database connection: {}", e);
                Err(AppError::from(e))
            }
        }
    }

    /// Creates tables and indexes that do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn decode<T>(row: &sqlx::postgres::PgRow) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let Json(value) = row.try_get::<Json<T>, _>("dados")?;
    Ok(value)
}

fn to_i64(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

/// Production appointment store. Each row keeps the full record as JSONB
/// next to the columns used for filtering and locking.
pub struct PgAppointmentStore {
    db: Database,
}

impl PgAppointmentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AppointmentStore for PgAppointmentStore {
    async fn load(&self) -> Result<Vec<Appointment>> {
        let rows = sqlx::query("SELECT dados FROM agendamentos ORDER BY data_inicio")
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(decode).collect()
    }

    async fn save(&self, appointments: Vec<Appointment>) -> Result<()> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query("DELETE FROM agendamentos").execute(&mut *tx).await?;

        for appointment in &appointments {
            sqlx::query(
                "INSERT INTO agendamentos (id, usuario_id, data_inicio, versao, dados) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&appointment.id)
            .bind(&appointment.owner_id)
            .bind(appointment.start)
            .bind(to_i64(appointment.version))
            .bind(Json(appointment))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Appointment>> {
        let row = sqlx::query("SELECT dados FROM agendamentos WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn insert(&self, mut appointment: Appointment) -> Result<Appointment> {
        appointment.version = 1;

        let result = sqlx::query(
            r#"
            INSERT INTO agendamentos (id, usuario_id, data_inicio, versao, dados)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&appointment.id)
        .bind(&appointment.owner_id)
        .bind(appointment.start)
        .bind(to_i64(appointment.version))
        .bind(Json(&appointment))
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict("Registro com este id já existe"));
        }
        Ok(appointment)
    }

    async fn modify(&self, id: &str, mutation: Mutation<'_, Appointment>) -> Result<Option<Appointment>> {
        let mut tx = self.db.pool.begin().await?;

        let row = sqlx::query("SELECT dados FROM agendamentos WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut appointment: Appointment = decode(&row)?;
        let previous_version = appointment.version;
        mutation(&mut appointment)?;
        appointment.version = previous_version + 1;

        sqlx::query(
            r#"
            UPDATE agendamentos
            SET usuario_id = $2, data_inicio = $3, versao = $4, dados = $5, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&appointment.owner_id)
        .bind(appointment.start)
        .bind(to_i64(appointment.version))
        .bind(Json(&appointment))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(appointment))
    }

    async fn remove(&self, id: &str) -> Result<Option<Appointment>> {
        let row = sqlx::query("DELETE FROM agendamentos WHERE id = $1 RETURNING dados")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }
}

pub struct PgNotificationStore {
    db: Database,
}

impl PgNotificationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, mut notification: Notification) -> Result<Notification> {
        notification.version = 1;

        let result = sqlx::query(
            r#"
            INSERT INTO notificacoes
                (id, usuario_id, status, tentativas, chave_deduplicacao, created_at, versao, dados)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.recipient_id)
        .bind(notification.status.as_str())
        .bind(notification.retry_count as i32)
        .bind(&notification.dedupe_key)
        .bind(notification.created_at)
        .bind(to_i64(notification.version))
        .bind(Json(&notification))
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict("Registro com este id já existe"));
        }
        Ok(notification)
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        let row = sqlx::query("SELECT dados FROM notificacoes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn modify(&self, id: &str, mutation: Mutation<'_, Notification>) -> Result<Option<Notification>> {
        let mut tx = self.db.pool.begin().await?;

        let row = sqlx::query("SELECT dados FROM notificacoes WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut notification: Notification = decode(&row)?;
        let previous_version = notification.version;
        mutation(&mut notification)?;
        notification.version = previous_version + 1;

        sqlx::query(
            r#"
            UPDATE notificacoes
            SET status = $2, tentativas = $3, versao = $4, dados = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(notification.status.as_str())
        .bind(notification.retry_count as i32)
        .bind(to_i64(notification.version))
        .bind(Json(&notification))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(notification))
    }

    async fn list_for_recipients(&self, recipients: &[String]) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT dados FROM notificacoes WHERE usuario_id = ANY($1) ORDER BY created_at DESC",
        )
        .bind(recipients.to_vec())
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(decode).collect()
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Vec<Notification>> {
        let rows = sqlx::query("SELECT dados FROM notificacoes WHERE chave_deduplicacao = $1")
            .bind(key)
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(decode).collect()
    }

    async fn list_retryable(&self, max_retries: u32) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT dados FROM notificacoes WHERE status = 'erro' AND tentativas < $1 ORDER BY created_at",
        )
        .bind(max_retries as i32)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::appointment::{AppointmentStatus, EventType};
    use chrono::{Duration, Utc};

    fn appointment(id: &str) -> Appointment {
        let start = Utc::now() + Duration::days(3);
        Appointment {
            id: id.to_string(),
            owner_id: "pg-owner".to_string(),
            owner_email: None,
            title: "Audiência".to_string(),
            description: None,
            location: None,
            start,
            end: start + Duration::hours(1),
            event_type: EventType::Hearing,
            process_id: None,
            recipient_id: None,
            status: AppointmentStatus::Scheduled,
            remind_one_day: true,
            remind_two_days: false,
            remind_one_week: false,
            invitees: Vec::new(),
            invite_history: Vec::new(),
            remote_event_id: None,
            remote_event_link: None,
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    // Needs a reachable PostgreSQL: DATABASE_URL=... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_modify_is_versioned() {
        let config = Config {
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            ..Config::default()
        };
        let db = Database::new(&config).await.unwrap();
        db.ensure_schema().await.unwrap();
        let store = PgAppointmentStore::new(db);

        let id = uuid::Uuid::new_v4().to_string();
        store.insert(appointment(&id)).await.unwrap();
        let updated = store
            .modify(
                &id,
                Box::new(|a: &mut Appointment| {
                    a.title = "Audiência remarcada".to_string();
                    Ok(())
                }),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(store.get(&id).await.unwrap().unwrap().title, "Audiência remarcada");
        assert!(store.remove(&id).await.unwrap().is_some());
    }
}
