//! Out-of-band notification of terminal hook executions.
//!
//! [`Notifier`] is the adapter implemented by each transport (see the
//! `whd-events` crate). [`NotificationDispatcher`] hands every terminal
//! [`WorkRequest`] to all configured notifiers on background tasks, bounded
//! by a semaphore and a per-call timeout. Notifier failures are logged and
//! never affect the request or the other notifiers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::config::{DEFAULT_NOTIFY_CONCURRENCY, DEFAULT_NOTIFY_TIMEOUT};
use crate::error::HookError;
use crate::work::WorkRequest;

/// Default body-extraction prefix.
pub const DEFAULT_PREFIX: &str = "notify:";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The transport rejected or failed to deliver the notification.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The notifier is misconfigured (bad address, bad URL, ...).
    #[error("invalid notifier configuration: {0}")]
    Config(String),

    /// The call exceeded the dispatcher's per-call timeout.
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

impl From<NotifyError> for HookError {
    fn from(err: NotifyError) -> Self {
        HookError::Notifier(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short transport name used in logs.
    fn name(&self) -> &str;

    /// Deliver a notification for a terminal request.
    ///
    /// Implementations extract their body with
    /// [`WorkRequest::log_content`] and return `Ok(())` without delivering
    /// anything when it is empty.
    async fn notify(&self, req: &WorkRequest) -> Result<(), NotifyError>;
}

impl std::fmt::Debug for dyn Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("name", &self.name()).finish()
    }
}

/// Replace `{name}`, `{id}` and `{status}` in `template`.
pub fn render_template(template: &str, req: &WorkRequest) -> String {
    template
        .replace("{name}", req.name())
        .replace("{id}", &req.id().to_string())
        .replace("{status}", req.status_label())
}

/// Notification body: log lines carrying `prefix`, stripped, or `None` when
/// there is nothing to send.
pub fn extract_body(req: &WorkRequest, prefix: &str) -> Option<String> {
    let body = req.log_content(prefix);
    (!body.trim().is_empty()).then_some(body)
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct NotificationDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    tasks: TaskTracker,
}

impl NotificationDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            notifiers,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
            tasks: TaskTracker::new(),
        }
    }

    /// Dispatcher without any notifier.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), DEFAULT_NOTIFY_TIMEOUT, DEFAULT_NOTIFY_CONCURRENCY)
    }

    pub fn notifier_count(&self) -> usize {
        self.notifiers.len()
    }

    /// Fire-and-forget delivery of `req` to every notifier.
    pub fn dispatch(&self, req: Arc<WorkRequest>) {
        for notifier in &self.notifiers {
            let notifier = Arc::clone(notifier);
            let req = Arc::clone(&req);
            let permits = Arc::clone(&self.permits);
            let timeout = self.timeout;

            self.tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let result = match tokio::time::timeout(timeout, notifier.notify(&req)).await {
                    Ok(result) => result.map_err(HookError::from),
                    Err(_) => Err(NotifyError::Timeout(timeout).into()),
                };
                match result {
                    Ok(()) => tracing::debug!(
                        hook = %req.name(),
                        hook_id = req.id(),
                        notifier = notifier.name(),
                        "Notification handled",
                    ),
                    Err(e) => tracing::error!(
                        hook = %req.name(),
                        hook_id = req.id(),
                        notifier = notifier.name(),
                        error = %e,
                        "Notification failed",
                    ),
                }
            });
        }
    }

    /// Wait for in-flight notifications, at most `deadline`. Returns `false`
    /// if some were still running when the deadline expired.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.tasks.close();
        let drained = tokio::time::timeout(deadline, self.tasks.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                pending = self.tasks.len(),
                "Notifications still pending at shutdown"
            );
        }
        drained
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
