use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::notification::Notification;
use async_trait::async_trait;
use handlebars::Handlebars;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

const NOTIFICATION_TEMPLATE: &str = "notificacao";

const NOTIFICATION_BODY: &str = "\
{{titulo}}

{{mensagem}}
{{#if agendamento}}

Agendamento: {{agendamento}}
{{/if}}

--
{{remetente}}
Mensagem automática, por favor não responda.
";

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("invalid address '{0}'")]
    Address(String),

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("SMTP delivery failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), MailError>;
}

/// Renders notifications into plain-text mail.
pub struct MailTemplates {
    registry: Handlebars<'static>,
    sender_name: String,
}

impl MailTemplates {
    pub fn new(sender_name: impl Into<String>) -> Result<Self> {
        Self::with_body(sender_name, NOTIFICATION_BODY)
    }

    /// Same as [`MailTemplates::new`] with a different body template.
    pub fn with_body(sender_name: impl Into<String>, body: &str) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(NOTIFICATION_TEMPLATE, body)
            .map_err(|e| AppError::internal(format!("mail template: {}", e)))?;

        Ok(Self {
            registry,
            sender_name: sender_name.into(),
        })
    }

    pub fn render(&self, notification: &Notification, to: &str) -> Result<OutgoingMail> {
        let data = json!({
            "titulo": notification.title,
            "mensagem": notification.message,
            "agendamento": notification.appointment_id,
            "remetente": self.sender_name,
        });

        let body = self
            .registry
            .render(NOTIFICATION_TEMPLATE, &data)
            .map_err(|e| AppError::internal(format!("mail render: {}", e)))?;

        Ok(OutgoingMail {
            to: to.to_string(),
            subject: format!("[{}] {}", self.sender_name, notification.title),
            body,
        })
    }
}

/// Delivers through an SMTP relay with STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| AppError::internal("SMTP_HOST is not configured"))?;

        let from_raw = format!("{} <{}>", config.smtp_from_name, config.smtp_from_email);
        let from: Mailbox = from_raw
            .parse()
            .map_err(|_| AppError::internal(format!("invalid SMTP_FROM_EMAIL '{}'", config.smtp_from_email)))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| AppError::internal(format!("SMTP transport error: {}", e)))?
            .port(config.smtp_port);

        if !config.smtp_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp_username.clone(),
                config.smtp_password.clone(),
            ));
        }

        info!("SMTP mailer configured for {}:{}", host, config.smtp_port);

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), MailError> {
        let to: Mailbox = mail
            .to
            .parse()
            .map_err(|_| MailError::Address(mail.to.clone()))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        debug!("Mail sent to {}", mail.to);
        Ok(())
    }
}

/// Used when SMTP is not configured: every message is logged and counts as sent.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), MailError> {
        info!(to = %mail.to, subject = %mail.subject, "Mail delivery disabled, message logged");
        Ok(())
    }
}

/// Keeps messages in memory. Can be switched to fail every delivery.
#[derive(Clone, Default)]
pub struct MemoryMailer {
    sent: Arc<RwLock<Vec<OutgoingMail>>>,
    failing: Arc<RwLock<bool>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }

    pub async fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), MailError> {
        if *self.failing.read().await {
            return Err(MailError::Transport("connection refused".to_string()));
        }
        self.sent.write().await.push(mail.clone());
        Ok(())
    }
}

/// Picks the SMTP mailer when a host is configured, the logging one otherwise.
pub fn from_config(config: &Config) -> Result<Arc<dyn Mailer>> {
    if config.smtp_host.is_some() {
        Ok(Arc::new(SmtpMailer::new(config)?))
    } else {
        Ok(Arc::new(LogMailer))
    }
}
