//! Email notification delivery via SMTP.
//!
//! [`SmtpNotifier`] wraps the `lettre` async SMTP transport to send a
//! plain-text email whose body is the prefixed part of the hook log. It is
//! configured from an `smtp:<recipient>?key=value...` URI; see
//! [`SmtpConfig::from_url`] for the recognized keys.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use url::Url;
use whd_core::notify::{extract_body, render_template, DEFAULT_PREFIX};
use whd_core::{Notifier, NotifyError, WorkRequest};

use crate::uri::UriError;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for email delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// SMTP transport-level failure (authentication, connection, etc.).
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    /// The recipient or sender address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The MIME message could not be assembled.
    #[error("Email build error: {0}")]
    Build(String),
}

impl From<EmailError> for NotifyError {
    fn from(err: EmailError) -> Self {
        match err {
            EmailError::Address(_) | EmailError::Build(_) => NotifyError::Config(err.to_string()),
            EmailError::Transport(_) => NotifyError::Delivery(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// SmtpConfig
// ---------------------------------------------------------------------------

const DEFAULT_SMTP_SERVER: &str = "localhost:25";
const DEFAULT_SMTP_PORT: u16 = 25;
const DEFAULT_FROM_ADDRESS: &str = "noreply@nunux.org";
const DEFAULT_SUBJECT: &str = "[whd-notification] {name}#{id} {status}";

/// Connection timeout.
const SMTP_TIMEOUT: Duration = Duration::from_secs(5);

/// How the SMTP session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpConnection {
    Plain,
    /// Upgrade with STARTTLS.
    Tls,
    /// STARTTLS without certificate verification.
    TlsInsecure,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub conn: SmtpConnection,
    pub from: String,
    pub to: String,
    /// Subject template (`{name}`, `{id}`, `{status}`).
    pub subject: String,
    /// Body-extraction prefix.
    pub prefix: String,
}

impl SmtpConfig {
    /// Read the configuration from an `smtp:` URI.
    ///
    /// | Key        | Default                                   |
    /// |------------|-------------------------------------------|
    /// | `smtp`     | `localhost:25`                            |
    /// | `username` | none (no authentication)                  |
    /// | `password` | none                                      |
    /// | `conn`     | `plain` (`tls`, `tls-insecure`)           |
    /// | `from`     | `noreply@nunux.org`                       |
    /// | `subject`  | `[whd-notification] {name}#{id} {status}` |
    /// | `prefix`   | `notify:`                                 |
    pub fn from_url(url: &Url) -> Result<Self, UriError> {
        let to = url.path().trim().to_string();
        if to.is_empty() {
            return Err(UriError::MissingRecipient);
        }

        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };

        let server = param("smtp").unwrap_or_else(|| DEFAULT_SMTP_SERVER.to_string());
        let (host, port) = split_host_port(&server)?;

        let conn = match param("conn").as_deref() {
            None | Some("plain") => SmtpConnection::Plain,
            Some("tls") => SmtpConnection::Tls,
            Some("tls-insecure") => SmtpConnection::TlsInsecure,
            Some(other) => {
                return Err(UriError::InvalidOption {
                    key: "conn",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            host,
            port,
            username: param("username"),
            password: param("password"),
            conn,
            from: param("from").unwrap_or_else(|| DEFAULT_FROM_ADDRESS.to_string()),
            to,
            subject: param("subject").unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            prefix: param("prefix").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        })
    }
}

fn split_host_port(server: &str) -> Result<(String, u16), UriError> {
    match server.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| UriError::InvalidOption {
                key: "smtp",
                value: server.to_string(),
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((server.to_string(), DEFAULT_SMTP_PORT)),
    }
}

// ---------------------------------------------------------------------------
// SmtpNotifier
// ---------------------------------------------------------------------------

/// Sends notification emails for terminal hooks via SMTP.
pub struct SmtpNotifier {
    config: SmtpConfig,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Assemble the email for `req`, or `None` when there is nothing to say.
    pub fn build_message(&self, req: &WorkRequest) -> Result<Option<Message>, EmailError> {
        let Some(body) = extract_body(req, &self.config.prefix) else {
            return Ok(None);
        };

        let email = Message::builder()
            .from(self.config.from.parse()?)
            .to(self.config.to.parse()?)
            .subject(render_template(&self.config.subject, req))
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| EmailError::Build(e.to_string()))?;
        Ok(Some(email))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, EmailError> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
                .port(self.config.port)
                .timeout(Some(SMTP_TIMEOUT));

        if self.config.conn != SmtpConnection::Plain {
            let params = TlsParameters::builder(self.config.host.clone())
                .dangerous_accept_invalid_certs(self.config.conn == SmtpConnection::TlsInsecure)
                .build()?;
            builder = builder.tls(Tls::Required(params));
        }

        if let Some(user) = &self.config.username {
            let pass = self.config.password.clone().unwrap_or_default();
            builder = builder.credentials(Credentials::new(user.clone(), pass));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn notify(&self, req: &WorkRequest) -> Result<(), NotifyError> {
        let Some(email) = self.build_message(req)? else {
            tracing::debug!(hook_id = req.id(), "Nothing to notify by email");
            return Ok(());
        };

        let mailer = self.transport()?;
        mailer.send(email).await.map_err(EmailError::from)?;

        tracing::info!(
            hook = %req.name(),
            hook_id = req.id(),
            to = %self.config.to,
            "Notification email sent",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
