//! HTTP notification delivery with retry.
//!
//! [`HttpNotifier`] posts a JSON document describing a terminal hook to an
//! external URL. Failed attempts are retried twice with backoff (1 s, 2 s);
//! the dispatcher's per-call timeout bounds the whole sequence.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;
use whd_core::notify::{extract_body, render_template, DEFAULT_PREFIX};
use whd_core::{HookId, Notifier, NotifyError, WorkRequest};

use crate::uri::UriError;

/// Delays before each retry.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_TITLE: &str = "{name}#{id} {status}";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// JSON document sent to the endpoint.
#[derive(Debug, Serialize)]
pub struct HookNotification<'a> {
    pub id: HookId,
    pub name: &'a str,
    pub status: &'a str,
    pub title: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// HttpNotifier
// ---------------------------------------------------------------------------

/// Delivers hook notifications to an HTTP endpoint.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: Url,
    prefix: String,
    title: String,
    retry_delays: Vec<Duration>,
}

impl HttpNotifier {
    /// Build from an `http(s)://` URI. The `prefix` and `subject` query
    /// parameters configure the notifier and are not forwarded.
    pub fn from_url(mut url: Url) -> Result<Self, UriError> {
        let mut prefix = DEFAULT_PREFIX.to_string();
        let mut title = DEFAULT_TITLE.to_string();
        let mut forwarded = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "prefix" if !value.is_empty() => prefix = value.into_owned(),
                "subject" if !value.is_empty() => title = value.into_owned(),
                "prefix" | "subject" => {}
                _ => forwarded.push((key.into_owned(), value.into_owned())),
            }
        }

        if forwarded.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(forwarded);
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(UriError::Client)?;

        Ok(Self {
            client,
            url,
            prefix,
            title,
            retry_delays: RETRY_DELAYS.to_vec(),
        })
    }

    /// Replace the backoff schedule; one retry per entry.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Target URL, configuration keys removed.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Document for `req`, or `None` when there is nothing to say.
    pub fn payload<'a>(&self, req: &'a WorkRequest) -> Option<HookNotification<'a>> {
        let text = extract_body(req, &self.prefix)?;
        Some(HookNotification {
            id: req.id(),
            name: req.name(),
            status: req.status_label(),
            title: render_template(&self.title, req),
            text,
        })
    }

    /// Post `payload`, retrying on failure.
    async fn deliver(&self, payload: &HookNotification<'_>) -> Result<(), WebhookError> {
        let mut delays = self.retry_delays.iter();
        let mut attempt = 1;
        loop {
            match self.try_send(payload).await {
                Ok(()) => return Ok(()),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            url = %self.url,
                            error = %e,
                            "Webhook delivery attempt failed, retrying"
                        );
                        tokio::time::sleep(*delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::error!(url = %self.url, error = %e, "Webhook delivery failed after all retries");
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(&self, payload: &HookNotification<'_>) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn notify(&self, req: &WorkRequest) -> Result<(), NotifyError> {
        let Some(payload) = self.payload(req) else {
            tracing::debug!(hook_id = req.id(), "Nothing to notify over HTTP");
            return Ok(());
        };

        self.deliver(&payload)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        tracing::info!(hook = %req.name(), hook_id = req.id(), url = %self.url, "Webhook notification sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use whd_core::{Origin, WorkStatus};

    use super::*;

    fn notifier(uri: &str) -> HttpNotifier {
        HttpNotifier::from_url(Url::parse(uri).unwrap()).unwrap()
    }

    #[test]
    fn strips_configuration_keys() {
        let n = notifier("https://chat.example.com/hooks/abc?prefix=chat:&token=t0k&subject={name}");
        assert_eq!(n.url().as_str(), "https://chat.example.com/hooks/abc?token=t0k");
        assert_eq!(n.prefix(), "chat:");

        let n = notifier("http://localhost:9000/notify?prefix=x:");
        assert_eq!(n.url().as_str(), "http://localhost:9000/notify");
    }

    #[test]
    fn defaults() {
        let n = notifier("http://localhost:9000/notify");
        assert_eq!(n.prefix(), "notify:");
        assert_eq!(n.retry_delays, RETRY_DELAYS.to_vec());
    }

    #[test]
    fn payload_uses_title_template() {
        let n = notifier("http://localhost/n?subject=[{status}] {name}");
        let req = WorkRequest::new("ci/build", "/s/ci/build.sh", Vec::new(), Vec::new(), Duration::from_secs(1));
        req.log().append(Origin::Stdout, "notify:green");
        req.start().unwrap();
        req.terminate(WorkStatus::Success).unwrap();

        let payload = n.payload(&req).expect("payload");
        assert_eq!(payload.title, "[success] ci/build");
        assert_eq!(payload.text, "green");
        assert_eq!(payload.status, "success");
        assert_eq!(payload.id, req.id());
    }

    #[test]
    fn webhook_error_display_http_status() {
        let err = WebhookError::HttpStatus(502);
        assert_eq!(err.to_string(), "Webhook returned HTTP 502");
    }
}
