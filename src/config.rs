use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Postgres,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(Self::File),
            "postgres" | "postgresql" | "database" => Ok(Self::Postgres),
            other => Err(anyhow::anyhow!("unknown STORAGE_BACKEND '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub log_level: String,
    pub log_format: String,
    pub cors_allowed_origins: String,

    // Authentication
    pub jwt_secret: String,

    // Storage
    pub storage_backend: StorageBackend,
    pub data_dir: String,
    pub database_url: String,
    pub database_max_connections: u32,

    // Scheduling
    pub timezone: String,
    pub reminder_idle_ceiling: u64,

    // Email configuration
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_from_name: String,
    pub smtp_from_email: String,
    pub enable_email_notifications: bool,
    pub admin_notification_emails: Vec<String>,
    pub notification_max_retries: u32,
    pub notification_retry_interval: u64,

    // Google Calendar
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_uri: Option<String>,
    pub google_refresh_token: Option<String>,
    pub google_calendar_id: String,
    pub google_api_base: String,
    pub google_token_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 3001,
            environment: "development".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            cors_allowed_origins: "http://localhost:3000".to_string(),
            jwt_secret: "development-secret".to_string(),
            storage_backend: StorageBackend::File,
            data_dir: "./data".to_string(),
            database_url: "postgres://localhost/npj".to_string(),
            database_max_connections: 5,
            timezone: "America/Sao_Paulo".to_string(),
            reminder_idle_ceiling: 300,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_from_name: "NPJ Agenda".to_string(),
            smtp_from_email: "noreply@npj.local".to_string(),
            enable_email_notifications: false,
            admin_notification_emails: Vec::new(),
            notification_max_retries: 3,
            notification_retry_interval: 600,
            google_client_id: None,
            google_client_secret: None,
            google_redirect_uri: None,
            google_refresh_token: None,
            google_calendar_id: "primary".to_string(),
            google_api_base: "https://www.googleapis.com/calendar/v3".to_string(),
            google_token_url: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()?,
            environment: env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: env::var("LOG_FORMAT").unwrap_or(defaults.log_format),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.cors_allowed_origins),

            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?,

            storage_backend: env::var("STORAGE_BACKEND")
                .unwrap_or_else(|_| "file".to_string())
                .parse()?,
            data_dir: env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            timezone: env::var("TIMEZONE").unwrap_or(defaults.timezone),
            reminder_idle_ceiling: env::var("REMINDER_IDLE_CEILING")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,

            smtp_host: non_empty_var("SMTP_HOST"),
            smtp_port: env::var("SMTP_PORT")
                .unwrap_or_else(|_| "587".to_string())
                .parse()?,
            smtp_username: env::var("SMTP_USERNAME").unwrap_or_default(),
            smtp_password: env::var("SMTP_PASSWORD").unwrap_or_default(),
            smtp_from_name: env::var("SMTP_FROM_NAME").unwrap_or(defaults.smtp_from_name),
            smtp_from_email: env::var("SMTP_FROM_EMAIL").unwrap_or(defaults.smtp_from_email),
            enable_email_notifications: env::var("ENABLE_EMAIL_NOTIFICATIONS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            admin_notification_emails: env::var("ADMIN_NOTIFICATION_EMAILS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            notification_max_retries: env::var("NOTIFICATION_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            notification_retry_interval: env::var("NOTIFICATION_RETRY_INTERVAL")
                .unwrap_or_else(|_| "600".to_string())
                .parse()?,

            google_client_id: non_empty_var("GOOGLE_CLIENT_ID"),
            google_client_secret: non_empty_var("GOOGLE_CLIENT_SECRET"),
            google_redirect_uri: non_empty_var("GOOGLE_REDIRECT_URI"),
            google_refresh_token: non_empty_var("GOOGLE_REFRESH_TOKEN"),
            google_calendar_id: env::var("GOOGLE_CALENDAR_ID")
                .unwrap_or(defaults.google_calendar_id),
            google_api_base: env::var("GOOGLE_API_BASE").unwrap_or(defaults.google_api_base),
            google_token_url: env::var("GOOGLE_TOKEN_URL").unwrap_or(defaults.google_token_url),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Timezone used to read naive timestamps and to compute "today".
    /// Falls back to America/Sao_Paulo when the configured name is unknown.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone
            .parse()
            .unwrap_or(chrono_tz::America::Sao_Paulo)
    }

    pub fn google_calendar_configured(&self) -> bool {
        self.google_client_id.is_some()
            && self.google_client_secret.is_some()
            && self.google_refresh_token.is_some()
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
