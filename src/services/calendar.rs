use crate::config::Config;
use crate::models::appointment::{Appointment, InviteStatus};
use crate::services::store::AppointmentStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Warning attached to responses when the mirror could not be updated.
pub const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub id: String,
    pub link: Option<String>,
}

/// Every variant means "unavailable" to callers; none of them fails a request.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("calendar integration is not configured")]
    NotConfigured,

    #[error("calendar authorization failed: {0}")]
    Auth(String),

    #[error("calendar request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("calendar API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid calendar API base '{0}'")]
    InvalidBase(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CalendarSync: Send + Sync {
    fn is_available(&self) -> bool;

    async fn create_remote(&self, appointment: &Appointment) -> Result<RemoteEvent, SyncError>;

    async fn update_remote(&self, remote_id: &str, appointment: &Appointment) -> Result<(), SyncError>;

    async fn delete_remote(&self, remote_id: &str) -> Result<(), SyncError>;
}

/// Installed when no Google credentials are configured.
pub struct DisabledCalendarSync;

#[async_trait]
impl CalendarSync for DisabledCalendarSync {
    fn is_available(&self) -> bool {
        false
    }

    async fn create_remote(&self, _appointment: &Appointment) -> Result<RemoteEvent, SyncError> {
        Err(SyncError::NotConfigured)
    }

    async fn update_remote(&self, _remote_id: &str, _appointment: &Appointment) -> Result<(), SyncError> {
        Err(SyncError::NotConfigured)
    }

    async fn delete_remote(&self, _remote_id: &str) -> Result<(), SyncError> {
        Err(SyncError::NotConfigured)
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    id: String,
    #[serde(rename = "htmlLink")]
    html_link: Option<String>,
}

/// Google Calendar v3 mirror authorized with a long-lived refresh token.
pub struct GoogleCalendarSync {
    http_client: Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    calendar_id: String,
    api_base: String,
    token_url: String,
    tz: Tz,
    token: RwLock<Option<CachedToken>>,
}

impl GoogleCalendarSync {
    /// `None` unless client id, secret and refresh token are all set.
    pub fn from_config(config: &Config) -> Option<Self> {
        let (Some(client_id), Some(client_secret), Some(refresh_token)) = (
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            config.google_refresh_token.clone(),
        ) else {
            return None;
        };

        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());

        Some(Self {
            http_client,
            client_id,
            client_secret,
            refresh_token,
            calendar_id: config.google_calendar_id.clone(),
            api_base: config.google_api_base.trim_end_matches('/').to_string(),
            token_url: config.google_token_url.clone(),
            tz: config.tz(),
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, SyncError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Utc::now() + Duration::seconds(60) {
                return Ok(cached.access_token.clone());
            }
        }

        debug!("Refreshing Google Calendar access token");

        let response = self
            .http_client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!("token endpoint returned {}: {}", status, body)));
        }

        let token: TokenResponse = response.json().await?;
        let cached = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        };
        *self.token.write().await = Some(cached);

        Ok(token.access_token)
    }

    /// `<base>/calendars/<calendar>/events[/<event>]` with each id
    /// percent-encoded as a single path segment.
    fn events_url(&self, remote_id: Option<&str>) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.api_base).map_err(|_| SyncError::InvalidBase(self.api_base.clone()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SyncError::InvalidBase(self.api_base.clone()))?;
            segments
                .pop_if_empty()
                .push("calendars")
                .push(&self.calendar_id)
                .push("events");
            if let Some(remote_id) = remote_id {
                segments.push(remote_id);
            }
        }
        Ok(url)
    }

    fn event_body(&self, appointment: &Appointment) -> Value {
        let tz_name = self.tz.name();

        let attendees: Vec<Value> = appointment
            .invitees
            .iter()
            .map(|invitee| {
                let response_status = match invitee.status {
                    InviteStatus::Pending => "needsAction",
                    InviteStatus::Accepted => "accepted",
                    InviteStatus::Declined => "declined",
                };
                json!({
                    "email": invitee.email,
                    "displayName": invitee.name,
                    "responseStatus": response_status,
                })
            })
            .collect();

        let overrides: Vec<Value> = appointment
            .enabled_windows()
            .iter()
            .map(|window| json!({ "method": "email", "minutes": window.minutes() }))
            .collect();

        json!({
            "summary": appointment.title,
            "description": appointment.description,
            "location": appointment.location,
            "start": {
                "dateTime": appointment.start.with_timezone(&self.tz).to_rfc3339(),
                "timeZone": tz_name,
            },
            "end": {
                "dateTime": appointment.end.with_timezone(&self.tz).to_rfc3339(),
                "timeZone": tz_name,
            },
            "attendees": attendees,
            "reminders": {
                "useDefault": false,
                "overrides": overrides,
            },
            "extendedProperties": {
                "private": { "agendamentoId": appointment.id },
            },
        })
    }
}

async fn api_error(response: reqwest::Response) -> SyncError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    SyncError::Api { status, body }
}

#[async_trait]
impl CalendarSync for GoogleCalendarSync {
    fn is_available(&self) -> bool {
        true
    }

    async fn create_remote(&self, appointment: &Appointment) -> Result<RemoteEvent, SyncError> {
        let token = self.access_token().await?;
        let response = self
            .http_client
            .post(self.events_url(None)?)
            .bearer_auth(token)
            .json(&self.event_body(appointment))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let event: EventResponse = response.json().await?;
        info!("Appointment {} mirrored as calendar event {}", appointment.id, event.id);

        Ok(RemoteEvent {
            id: event.id,
            link: event.html_link,
        })
    }

    async fn update_remote(&self, remote_id: &str, appointment: &Appointment) -> Result<(), SyncError> {
        let token = self.access_token().await?;
        let response = self
            .http_client
            .put(self.events_url(Some(remote_id))?)
            .bearer_auth(token)
            .json(&self.event_body(appointment))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        debug!("Calendar event {} updated", remote_id);
        Ok(())
    }

    async fn delete_remote(&self, remote_id: &str) -> Result<(), SyncError> {
        let token = self.access_token().await?;
        let response = self
            .http_client
            .delete(self.events_url(Some(remote_id))?)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // Already removed on the remote side
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                warn!("Calendar event {} was already gone", remote_id);
                Ok(())
            }
            _ => Err(api_error(response).await),
        }
    }
}

/// Keeps the remote mirror in step with stored appointments. Never fails:
/// every problem turns into the `unavailable` warning and the local state
/// stands.
#[derive(Clone)]
pub struct CalendarMirror {
    calendar: Arc<dyn CalendarSync>,
    store: Arc<dyn AppointmentStore>,
}

impl CalendarMirror {
    pub fn new(calendar: Arc<dyn CalendarSync>, store: Arc<dyn AppointmentStore>) -> Self {
        Self { calendar, store }
    }

    fn unavailable() -> Option<String> {
        Some(UNAVAILABLE.to_string())
    }

    /// Creates the remote event and stores its id and link on the appointment.
    pub async fn created(&self, appointment: Appointment) -> (Appointment, Option<String>) {
        if !self.calendar.is_available() {
            return (appointment, Self::unavailable());
        }

        let remote = match self.calendar.create_remote(&appointment).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Calendar create failed for appointment {}: {}", appointment.id, e);
                return (appointment, Self::unavailable());
            }
        };

        let result = self
            .store
            .modify(
                &appointment.id,
                Box::new(move |a: &mut Appointment| {
                    a.remote_event_id = Some(remote.id);
                    a.remote_event_link = remote.link;
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(Some(stored)) => (stored, None),
            Ok(None) => (appointment, None),
            Err(e) => {
                warn!("Failed to record calendar event on appointment {}: {}", appointment.id, e);
                (appointment, Self::unavailable())
            }
        }
    }

    pub async fn updated(&self, appointment: Appointment) -> (Appointment, Option<String>) {
        if !self.calendar.is_available() {
            return (appointment, Self::unavailable());
        }

        let Some(remote_id) = appointment.remote_event_id.clone() else {
            return self.created(appointment).await;
        };

        match self.calendar.update_remote(&remote_id, &appointment).await {
            Ok(()) => (appointment, None),
            Err(e) => {
                warn!("Calendar update failed for appointment {}: {}", appointment.id, e);
                (appointment, Self::unavailable())
            }
        }
    }

    /// Removes the remote event of a cancelled appointment and clears the
    /// stored reference.
    pub async fn cancelled(&self, appointment: Appointment) -> (Appointment, Option<String>) {
        let Some(remote_id) = appointment.remote_event_id.clone() else {
            let warning = (!self.calendar.is_available()).then(|| UNAVAILABLE.to_string());
            return (appointment, warning);
        };

        if let Some(warning) = self.delete(&remote_id).await {
            return (appointment, Some(warning));
        }

        let cleared = self
            .store
            .modify(
                &appointment.id,
                Box::new(|a: &mut Appointment| {
                    a.remote_event_id = None;
                    a.remote_event_link = None;
                    Ok(())
                }),
            )
            .await;

        match cleared {
            Ok(Some(stored)) => (stored, None),
            Ok(None) => (appointment, None),
            Err(e) => {
                warn!("Failed to clear calendar event on appointment {}: {}", appointment.id, e);
                (appointment, Self::unavailable())
            }
        }
    }

    /// Deletes the remote event of an appointment already removed locally.
    pub async fn removed(&self, appointment: &Appointment) -> Option<String> {
        match appointment.remote_event_id.as_deref() {
            Some(remote_id) => self.delete(remote_id).await,
            None => None,
        }
    }

    async fn delete(&self, remote_id: &str) -> Option<String> {
        if !self.calendar.is_available() {
            return Self::unavailable();
        }
        match self.calendar.delete_remote(remote_id).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Calendar delete failed for event {}: {}", remote_id, e);
                Self::unavailable()
            }
        }
    }
}

pub fn from_config(config: &Config) -> Arc<dyn CalendarSync> {
    match GoogleCalendarSync::from_config(config) {
        Some(google) => {
            info!("Google Calendar mirror enabled for calendar {}", config.google_calendar_id);
            Arc::new(google)
        }
        None => {
            info!("Google Calendar not configured, appointments stay local");
            Arc::new(DisabledCalendarSync)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::appointment::{AppointmentStatus, EventType, Invitee};
    use chrono::TimeZone;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn appointment() -> Appointment {
        let start = Utc.with_ymd_and_hms(2024, 6, 10, 13, 0, 0).unwrap();
        let mut declined = Invitee::pending("b@x.com".to_string(), None, start);
        declined.status = InviteStatus::Declined;

        Appointment {
            id: "a1".to_string(),
            owner_id: "7".to_string(),
            owner_email: None,
            title: "Audiência trabalhista".to_string(),
            description: Some("Processo 123".to_string()),
            location: Some("Fórum".to_string()),
            start,
            end: start + Duration::hours(1),
            event_type: EventType::Hearing,
            process_id: None,
            recipient_id: None,
            status: AppointmentStatus::Scheduled,
            remind_one_day: true,
            remind_two_days: false,
            remind_one_week: true,
            invitees: vec![
                Invitee::pending("a@x.com".to_string(), Some("Ana".to_string()), start),
                declined,
            ],
            invite_history: Vec::new(),
            remote_event_id: None,
            remote_event_link: None,
            version: 1,
            created_at: start,
            updated_at: start,
            extra: serde_json::Map::new(),
        }
    }

    fn google(server: &MockServer) -> GoogleCalendarSync {
        let config = Config {
            google_client_id: Some("client".to_string()),
            google_client_secret: Some("secret".to_string()),
            google_refresh_token: Some("refresh".to_string()),
            google_api_base: server.uri(),
            google_token_url: format!("{}/token", server.uri()),
            ..Config::default()
        };
        GoogleCalendarSync::from_config(&config).unwrap()
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[test]
    fn test_not_configured_without_refresh_token() {
        assert!(GoogleCalendarSync::from_config(&Config::default()).is_none());
        assert!(!from_config(&Config::default()).is_available());
    }

    #[tokio::test]
    async fn test_event_body_translation() {
        let server = MockServer::start().await;
        let body = google(&server).event_body(&appointment());

        assert_eq!(body["summary"], "Audiência trabalhista");
        assert_eq!(body["start"]["timeZone"], "America/Sao_Paulo");
        assert_eq!(body["start"]["dateTime"], "2024-06-10T10:00:00-03:00");
        assert_eq!(body["attendees"][0]["responseStatus"], "needsAction");
        assert_eq!(body["attendees"][1]["responseStatus"], "declined");
        assert_eq!(body["reminders"]["useDefault"], false);
        assert_eq!(body["reminders"]["overrides"][0]["minutes"], 1440);
        assert_eq!(body["reminders"]["overrides"][1]["minutes"], 10080);
    }

    #[tokio::test]
    async fn test_create_then_update_reuses_token() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;

        Mock::given(method("POST"))
            .and(path("/calendars/primary/events"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "evt1",
                "htmlLink": "https://calendar.google.com/event?eid=evt1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/calendars/primary/events/evt1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "evt1"})))
            .mount(&server)
            .await;

        let sync = google(&server);
        let remote = sync.create_remote(&appointment()).await.unwrap();
        assert_eq!(remote.id, "evt1");
        assert_eq!(remote.link.as_deref(), Some("https://calendar.google.com/event?eid=evt1"));

        sync.update_remote("evt1", &appointment()).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_calendar_ids_are_encoded() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/calendars/npj%23plantao/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "evt2"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/calendars/npj%23plantao/events/a%2Fb"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let config = Config {
            google_client_id: Some("client".to_string()),
            google_client_secret: Some("secret".to_string()),
            google_refresh_token: Some("refresh".to_string()),
            google_calendar_id: "npj#plantao".to_string(),
            google_api_base: server.uri(),
            google_token_url: format!("{}/token", server.uri()),
            ..Config::default()
        };
        let sync = GoogleCalendarSync::from_config(&config).unwrap();

        assert_eq!(sync.create_remote(&appointment()).await.unwrap().id, "evt2");
        sync.delete_remote("a/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/calendars/primary/events"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let err = google(&server).create_remote(&appointment()).await.unwrap_err();
        assert!(matches!(err, SyncError::Api { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_rejected_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = google(&server).delete_remote("evt1").await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[tokio::test]
    async fn test_delete_of_missing_event_succeeds() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("DELETE"))
            .and(path("/calendars/primary/events/gone"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        assert!(google(&server).delete_remote("gone").await.is_ok());
    }

    async fn mirror_with(mock: MockCalendarSync) -> (CalendarMirror, Arc<crate::services::store::JsonFileAppointmentStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::services::store::JsonFileAppointmentStore::open(dir.path()).await.unwrap());
        store.insert(appointment()).await.unwrap();
        (CalendarMirror::new(Arc::new(mock), store.clone()), store, dir)
    }

    #[tokio::test]
    async fn test_mirror_records_remote_event() {
        let mut mock = MockCalendarSync::new();
        mock.expect_is_available().return_const(true);
        mock.expect_create_remote().times(1).returning(|_| {
            Ok(RemoteEvent {
                id: "evt9".to_string(),
                link: Some("https://calendar.google.com/evt9".to_string()),
            })
        });
        let (mirror, store, _dir) = mirror_with(mock).await;

        let (stored, warning) = mirror.created(appointment()).await;
        assert!(warning.is_none());
        assert_eq!(stored.remote_event_id.as_deref(), Some("evt9"));
        let persisted = store.get("a1").await.unwrap().unwrap();
        assert_eq!(persisted.remote_event_id.as_deref(), Some("evt9"));
    }

    #[tokio::test]
    async fn test_mirror_failure_is_a_warning() {
        let mut mock = MockCalendarSync::new();
        mock.expect_is_available().return_const(true);
        mock.expect_create_remote()
            .returning(|_| Err(SyncError::Api { status: 500, body: "boom".to_string() }));
        let (mirror, store, _dir) = mirror_with(mock).await;

        let (stored, warning) = mirror.created(appointment()).await;
        assert_eq!(warning.as_deref(), Some(UNAVAILABLE));
        assert!(stored.remote_event_id.is_none());
        assert!(store.get("a1").await.unwrap().unwrap().remote_event_id.is_none());
    }

    #[tokio::test]
    async fn test_mirror_unavailable_skips_remote_calls() {
        let mut mock = MockCalendarSync::new();
        mock.expect_is_available().return_const(false);
        mock.expect_create_remote().never();
        mock.expect_update_remote().never();
        let (mirror, _store, _dir) = mirror_with(mock).await;

        let (_, warning) = mirror.updated(appointment()).await;
        assert_eq!(warning.as_deref(), Some(UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_mirror_cancel_clears_remote_reference() {
        let mut mock = MockCalendarSync::new();
        mock.expect_is_available().return_const(true);
        mock.expect_delete_remote()
            .withf(|id| id == "evt1")
            .times(1)
            .returning(|_| Ok(()));
        let (mirror, store, _dir) = mirror_with(mock).await;

        let mut linked = appointment();
        linked.remote_event_id = Some("evt1".to_string());
        let (stored, warning) = mirror.cancelled(linked).await;

        assert!(warning.is_none());
        assert!(stored.remote_event_id.is_none());
        assert!(store.get("a1").await.unwrap().unwrap().remote_event_id.is_none());
    }
}
