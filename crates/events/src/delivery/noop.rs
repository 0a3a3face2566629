use async_trait::async_trait;
use whd_core::{Notifier, NotifyError, WorkRequest};

/// Accepts every notification and delivers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn name(&self) -> &str {
        "noop"
    }

    async fn notify(&self, req: &WorkRequest) -> Result<(), NotifyError> {
        tracing::trace!(hook = %req.name(), hook_id = req.id(), "Notification discarded");
        Ok(())
    }
}
