use crate::utils::serde_helpers::{flexible_datetime, lenient_id, opt_flexible_datetime, opt_lenient_id};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use validator::Validate;

/// Default duration applied when an appointment has no usable end.
pub const DEFAULT_DURATION_MINUTES: i64 = 60;

pub const UNTITLED: &str = "Untitled";

/// A scheduled event owned by one user. Serialized field names follow the
/// JSON contract of the `agendamentos.json` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(remote = "Self")]
pub struct Appointment {
    #[serde(with = "lenient_id")]
    pub id: String,
    #[serde(rename = "usuarioId", with = "lenient_id")]
    pub owner_id: String,
    #[serde(rename = "emailCriador", default, skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "descricao", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "local", default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(rename = "data_inicio", with = "flexible_datetime")]
    pub start: DateTime<Utc>,
    #[serde(rename = "data_fim", with = "flexible_datetime")]
    pub end: DateTime<Utc>,
    #[serde(rename = "tipoEvento", default)]
    pub event_type: EventType,
    #[serde(rename = "processoId", default, with = "opt_lenient_id", skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(rename = "destinatarioId", default, with = "opt_lenient_id", skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub status: AppointmentStatus,
    #[serde(rename = "lembrete1Dia", default)]
    pub remind_one_day: bool,
    #[serde(rename = "lembrete2Dias", default)]
    pub remind_two_days: bool,
    #[serde(rename = "lembrete1Semana", default)]
    pub remind_one_week: bool,
    #[serde(rename = "convidados", default)]
    pub invitees: Vec<Invitee>,
    #[serde(rename = "historicoConvites", default, skip_serializing_if = "Vec::is_empty")]
    pub invite_history: Vec<InviteAuditEntry>,
    #[serde(rename = "googleEventId", default, skip_serializing_if = "Option::is_none")]
    pub remote_event_id: Option<String>,
    #[serde(rename = "googleEventLink", default, skip_serializing_if = "Option::is_none")]
    pub remote_event_link: Option<String>,
    #[serde(rename = "versao", default)]
    pub version: u64,
    #[serde(rename = "createdAt", with = "flexible_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt", with = "flexible_datetime")]
    pub updated_at: DateTime<Utc>,
    /// Fields this version does not know about; kept so that a load/save
    /// cycle does not drop them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Serialize for Appointment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Appointment::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for Appointment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut value = serde_json::Value::deserialize(deserializer)?;
        if let Some(record) = value.as_object_mut() {
            fill_legacy_times(record, Utc::now());
        }
        Appointment::deserialize(value).map_err(serde::de::Error::custom)
    }
}

/// Older records may lack `data_fim`, `createdAt` or `updatedAt`, or hold
/// values that do not parse. The end falls back to start plus the default
/// duration (also when it precedes the start); the audit times fall back
/// to `now`. A record without a readable start is left as is and fails.
fn fill_legacy_times(record: &mut serde_json::Map<String, serde_json::Value>, now: DateTime<Utc>) {
    let read = |record: &serde_json::Map<String, serde_json::Value>, key: &str| {
        record
            .get(key)
            .and_then(serde_json::Value::as_str)
            .and_then(flexible_datetime::parse)
    };

    if let Some(start) = read(record, "data_inicio") {
        if read(record, "data_fim").map_or(true, |end| end < start) {
            let end = start + Duration::minutes(DEFAULT_DURATION_MINUTES);
            record.insert("data_fim".to_string(), flexible_datetime::format(&end).into());
        }
    }

    for key in ["createdAt", "updatedAt"] {
        if read(record, key).is_none() {
            record.insert(key.to_string(), flexible_datetime::format(&now).into());
        }
    }
}

impl Appointment {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn invitee(&self, email: &str) -> Option<&Invitee> {
        self.invitees.iter().find(|i| i.email.eq_ignore_ascii_case(email.trim()))
    }

    pub fn invitee_mut(&mut self, email: &str) -> Option<&mut Invitee> {
        let email = email.trim();
        self.invitees.iter_mut().find(|i| i.email.eq_ignore_ascii_case(email))
    }

    pub fn has_invitee(&self, email: &str) -> bool {
        self.invitee(email).is_some()
    }

    /// Invitees that still expect updates about the event.
    pub fn active_invitees(&self) -> impl Iterator<Item = &Invitee> {
        self.invitees.iter().filter(|i| i.status != InviteStatus::Declined)
    }

    pub fn window_enabled(&self, window: ReminderWindow) -> bool {
        match window {
            ReminderWindow::OneDay => self.remind_one_day,
            ReminderWindow::TwoDays => self.remind_two_days,
            ReminderWindow::OneWeek => self.remind_one_week,
        }
    }

    pub fn enabled_windows(&self) -> Vec<ReminderWindow> {
        ReminderWindow::ALL
            .into_iter()
            .filter(|w| self.window_enabled(*w))
            .collect()
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AppointmentStatus {
    #[serde(rename = "agendado", alias = "scheduled")]
    Scheduled,
    #[serde(rename = "concluido", alias = "completed")]
    Completed,
    #[serde(rename = "cancelado", alias = "cancelled")]
    Cancelled,
}

impl Default for AppointmentStatus {
    fn default() -> Self {
        Self::Scheduled
    }
}

/// Event-type tag. Unknown tags from older data are read as `Other`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Meeting,
    Hearing,
    Deadline,
    Other,
}

impl Default for EventType {
    fn default() -> Self {
        Self::Other
    }
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meeting => "reuniao",
            Self::Hearing => "audiencia",
            Self::Deadline => "prazo",
            Self::Other => "outro",
        }
    }
}

impl EventType {
    /// `None` for tags this version does not know.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "reuniao" | "reunião" | "meeting" => Some(Self::Meeting),
            "audiencia" | "audiência" | "hearing" => Some(Self::Hearing),
            "prazo" | "deadline" => Some(Self::Deadline),
            "outro" | "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        Self::parse(&raw).unwrap_or_default()
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InviteStatus {
    #[serde(rename = "pendente", alias = "pending")]
    Pending,
    #[serde(rename = "aceito", alias = "accepted")]
    Accepted,
    #[serde(rename = "recusado", alias = "declined")]
    Declined,
}

impl Default for InviteStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invitee {
    pub email: String,
    #[serde(rename = "nome", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub status: InviteStatus,
    #[serde(rename = "justificativa", default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    #[serde(rename = "convidadoEm", default, with = "opt_flexible_datetime", skip_serializing_if = "Option::is_none")]
    pub invited_at: Option<DateTime<Utc>>,
    #[serde(rename = "respondidoEm", default, with = "opt_flexible_datetime", skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl Invitee {
    pub fn pending(email: String, name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            email,
            name,
            status: InviteStatus::Pending,
            justification: None,
            invited_at: Some(now),
            responded_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InviteAction {
    #[serde(rename = "convidado")]
    Invited,
    #[serde(rename = "aceito")]
    Accepted,
    #[serde(rename = "recusado")]
    Declined,
    #[serde(rename = "reenviado")]
    Resent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InviteAuditEntry {
    #[serde(rename = "em", with = "flexible_datetime")]
    pub at: DateTime<Utc>,
    pub email: String,
    #[serde(rename = "acao")]
    pub action: InviteAction,
    #[serde(rename = "detalhe", default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReminderWindow {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "2d")]
    TwoDays,
    #[serde(rename = "1w")]
    OneWeek,
}

impl ReminderWindow {
    pub const ALL: [ReminderWindow; 3] = [Self::OneDay, Self::TwoDays, Self::OneWeek];

    pub fn lead_time(&self) -> Duration {
        match self {
            Self::OneDay => Duration::days(1),
            Self::TwoDays => Duration::days(2),
            Self::OneWeek => Duration::weeks(1),
        }
    }

    pub fn minutes(&self) -> i64 {
        self.lead_time().num_minutes()
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::OneDay => "1d",
            Self::TwoDays => "2d",
            Self::OneWeek => "1w",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::OneDay => "1 dia",
            Self::TwoDays => "2 dias",
            Self::OneWeek => "1 semana",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InviteDecision {
    #[serde(alias = "aceitar")]
    Accept,
    #[serde(alias = "recusar")]
    Decline,
}

/// Invitee as sent by clients: either a bare address or an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InviteeInput {
    Email(String),
    Detailed {
        email: String,
        #[serde(default, alias = "name")]
        nome: Option<String>,
    },
}

impl InviteeInput {
    pub fn email(&self) -> &str {
        match self {
            Self::Email(email) => email,
            Self::Detailed { email, .. } => email,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Email(_) => None,
            Self::Detailed { nome, .. } => nome.as_deref().filter(|n| !n.trim().is_empty()),
        }
    }
}

/// Create/update payload. Every field is optional: on create, missing fields
/// take their defaults; on update, missing fields keep their previous value.
/// Alternate start/end keys used by older clients are mapped here and
/// nowhere else.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct AppointmentInput {
    #[serde(rename = "titulo", alias = "title", default)]
    #[validate(length(max = 200))]
    pub title: Option<String>,
    #[serde(rename = "descricao", alias = "description", default)]
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[serde(rename = "local", alias = "location", default)]
    #[validate(length(max = 300))]
    pub location: Option<String>,
    #[serde(rename = "data_inicio", alias = "dataInicio", alias = "dataEvento", alias = "start", default)]
    pub start: Option<String>,
    #[serde(rename = "data_fim", alias = "dataFim", alias = "end", default)]
    pub end: Option<String>,
    #[serde(rename = "tipoEvento", alias = "tipo", alias = "type", default)]
    pub event_type: Option<EventType>,
    #[serde(rename = "processoId", alias = "processId", default, with = "opt_lenient_id")]
    pub process_id: Option<String>,
    #[serde(rename = "destinatarioId", default, with = "opt_lenient_id")]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub status: Option<AppointmentStatus>,
    #[serde(rename = "motivoCancelamento", default)]
    pub cancellation_reason: Option<String>,
    #[serde(rename = "lembrete1Dia", default)]
    pub remind_one_day: Option<bool>,
    #[serde(rename = "lembrete2Dias", default)]
    pub remind_two_days: Option<bool>,
    #[serde(rename = "lembrete1Semana", default)]
    pub remind_one_week: Option<bool>,
    #[serde(rename = "convidados", alias = "invitees", default)]
    pub invitees: Option<Vec<InviteeInput>>,
}

/// Query filters for listing; unparsable values are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentFilter {
    #[serde(rename = "busca", alias = "search", default)]
    pub search: Option<String>,
    #[serde(rename = "dataInicio", alias = "startAfter", default)]
    pub start_after: Option<String>,
    #[serde(rename = "dataFim", alias = "endBefore", default)]
    pub end_before: Option<String>,
    #[serde(rename = "tipoEvento", default)]
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentStatistics {
    pub total: usize,
    pub due_within_week: usize,
    pub due_today: usize,
    pub count_by_type: BTreeMap<String, usize>,
}

/// An appointment together with the reminder windows currently due for it.
#[derive(Debug, Clone, Serialize)]
pub struct PendingReminder {
    #[serde(flatten)]
    pub appointment: Appointment,
    #[serde(rename = "janelas")]
    pub windows: Vec<ReminderWindow>,
}
