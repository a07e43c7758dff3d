use crate::utils::serde_helpers::{flexible_datetime, lenient_id, opt_flexible_datetime, opt_lenient_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    #[serde(with = "lenient_id")]
    pub id: String,
    #[serde(rename = "usuarioId", with = "lenient_id")]
    pub recipient_id: String,
    #[serde(rename = "email", default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(rename = "agendamentoId", default, with = "opt_lenient_id", skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<String>,
    #[serde(rename = "processoId", default, with = "opt_lenient_id", skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(rename = "tipo")]
    pub kind: NotificationKind,
    #[serde(rename = "canal")]
    pub channel: NotificationChannel,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "mensagem")]
    pub message: String,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(rename = "tentativas", default)]
    pub retry_count: u32,
    #[serde(rename = "ultimoErro", default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "chaveDeduplicacao", default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(rename = "createdAt", with = "flexible_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "enviadoEm", default, with = "opt_flexible_datetime", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(rename = "lidoEm", default, with = "opt_flexible_datetime", skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(rename = "versao", default)]
    pub version: u64,
}

impl Notification {
    pub fn from_request(request: CreateNotificationRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipient_id: request.recipient_id,
            recipient_email: request.recipient_email,
            appointment_id: request.appointment_id,
            process_id: request.process_id,
            kind: request.kind,
            channel: request.channel,
            title: request.title,
            message: request.message,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            last_error: None,
            dedupe_key: request.dedupe_key,
            created_at: now,
            sent_at: None,
            read_at: None,
            version: 0,
        }
    }

    pub fn wants_email(&self) -> bool {
        matches!(self.channel, NotificationChannel::Email | NotificationChannel::Both)
            && self.recipient_email.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CreateNotificationRequest {
    pub recipient_id: String,
    pub recipient_email: Option<String>,
    pub appointment_id: Option<String>,
    pub process_id: Option<String>,
    pub kind: NotificationKind,
    pub channel: NotificationChannel,
    pub title: String,
    pub message: String,
    pub dedupe_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationKind {
    #[serde(rename = "lembrete", alias = "reminder")]
    Reminder,
    #[serde(rename = "alerta", alias = "alert")]
    Alert,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "sistema", alias = "system")]
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationChannel {
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "sistema", alias = "system")]
    System,
    #[serde(rename = "ambos", alias = "both")]
    Both,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    #[serde(rename = "pendente", alias = "pending")]
    Pending,
    #[serde(rename = "enviado", alias = "sent")]
    Sent,
    #[serde(rename = "lido", alias = "read")]
    Read,
    #[serde(rename = "erro", alias = "error")]
    Error,
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pendente",
            Self::Sent => "enviado",
            Self::Read => "lido",
            Self::Error => "erro",
        }
    }
}
