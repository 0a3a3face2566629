//! Notification URI parsing.
//!
//! `<scheme>:<opaque>[?key=value&...]`, where the scheme selects the
//! transport:
//!
//! - `smtp:ops@example.com?smtp=mail:25&conn=tls`: [`SmtpNotifier`]
//! - `http://...` / `https://...`: [`HttpNotifier`]
//! - anything else: [`NoopNotifier`]

use std::sync::Arc;

use url::Url;
use whd_core::Notifier;

use crate::delivery::email::{SmtpConfig, SmtpNotifier};
use crate::delivery::noop::NoopNotifier;
use crate::delivery::webhook::HttpNotifier;

#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("invalid notification URI: {0}")]
    Parse(#[from] url::ParseError),

    #[error("notification URI has no recipient")]
    MissingRecipient,

    #[error("invalid value for `{key}`: {value}")]
    InvalidOption { key: &'static str, value: String },

    #[error("unable to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// Build the notifier described by `uri`.
pub fn build_notifier(uri: &str) -> Result<Arc<dyn Notifier>, UriError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Ok(Arc::new(NoopNotifier));
    }

    let url = Url::parse(uri)?;
    let notifier: Arc<dyn Notifier> = match url.scheme() {
        "smtp" => {
            let config = SmtpConfig::from_url(&url)?;
            tracing::info!(to = %config.to, server = %format!("{}:{}", config.host, config.port), "Using SMTP notifications");
            Arc::new(SmtpNotifier::new(config))
        }
        "http" | "https" => {
            let notifier = HttpNotifier::from_url(url)?;
            tracing::info!(url = %notifier.url(), "Using HTTP notifications");
            Arc::new(notifier)
        }
        other => {
            tracing::info!(scheme = other, "Unsupported notification scheme, notifications disabled");
            Arc::new(NoopNotifier)
        }
    };
    Ok(notifier)
}
