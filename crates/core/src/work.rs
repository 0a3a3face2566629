//! The in-memory record of one hook invocation.
//!
//! A [`WorkRequest`] is immutable apart from its status, which moves along
//! `Queued -> Running -> {Success, Error, Timeout}` and nowhere else. The
//! status lives in a `tokio::sync::watch` channel so that readers can take
//! atomic snapshots or await the terminal transition.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::log::LogSink;
use crate::types::{HookId, Timestamp};

/// Next id handed out by [`WorkRequest::new`].
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Queued,
    Running,
    Success,
    Error,
    Timeout,
}

impl WorkStatus {
    /// Stable ASCII label used in notifications and responses.
    pub fn label(self) -> &'static str {
        match self {
            WorkStatus::Queued => "queued",
            WorkStatus::Running => "running",
            WorkStatus::Success => "success",
            WorkStatus::Error => "error",
            WorkStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkStatus::Success | WorkStatus::Error | WorkStatus::Timeout
        )
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of the mutable part of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkState {
    pub status: WorkStatus,
    /// Set exactly once, together with the terminal status.
    pub terminated_at: Option<Timestamp>,
}

#[derive(Debug, thiserror::Error)]
#[error("hook #{id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: HookId,
    pub from: WorkStatus,
    pub to: WorkStatus,
}

// ---------------------------------------------------------------------------
// Args
// ---------------------------------------------------------------------------

/// Normalize an argument name into the suffix of its environment variable:
/// uppercased, with every non-alphanumeric character replaced by `_`.
pub fn normalize_arg_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Canonical argument order: stable sort by normalized name, so entries
/// sharing a name keep their relative order and the last one wins when
/// applied to the environment.
pub fn canonical_args(mut args: Vec<(String, String)>) -> Vec<(String, String)> {
    args.sort_by_cached_key(|(name, _)| normalize_arg_name(name));
    args
}

// ---------------------------------------------------------------------------
// WorkRequest
// ---------------------------------------------------------------------------

pub struct WorkRequest {
    id: HookId,
    name: String,
    script: PathBuf,
    payload: Vec<u8>,
    args: Vec<(String, String)>,
    timeout: Duration,
    created: Timestamp,
    state: watch::Sender<WorkState>,
    log: Arc<LogSink>,
    cancel: CancellationToken,
}

impl WorkRequest {
    /// Create a `Queued` request with a freshly allocated id and an
    /// in-memory log sink.
    pub fn new(
        name: impl Into<String>,
        script: impl Into<PathBuf>,
        payload: Vec<u8>,
        args: Vec<(String, String)>,
        timeout: Duration,
    ) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (state, _) = watch::channel(WorkState {
            status: WorkStatus::Queued,
            terminated_at: None,
        });

        Self {
            id,
            log: Arc::new(LogSink::new(name.clone(), id)),
            name,
            script: script.into(),
            payload,
            args: canonical_args(args),
            timeout,
            created: chrono::Utc::now(),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the in-memory sink with one persisting to `log_dir` and/or
    /// mirroring to the server logs. Only meaningful before the request is
    /// shared.
    pub fn with_log(mut self, log_dir: Option<&Path>, echo: bool) -> Self {
        self.log = Arc::new(LogSink::create(
            self.name.clone(),
            self.id,
            self.created,
            log_dir,
            echo,
        ));
        self
    }

    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved script path.
    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Arguments in canonical order.
    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn log(&self) -> &Arc<LogSink> {
        &self.log
    }

    /// Atomic snapshot of status and terminal timestamp.
    pub fn state(&self) -> WorkState {
        *self.state.borrow()
    }

    pub fn status(&self) -> WorkStatus {
        self.state.borrow().status
    }

    pub fn status_label(&self) -> &'static str {
        self.status().label()
    }

    pub fn terminated_at(&self) -> Option<Timestamp> {
        self.state.borrow().terminated_at
    }

    /// `Queued -> Running`.
    pub fn start(&self) -> Result<(), TransitionError> {
        self.transition(WorkStatus::Running)
    }

    /// `Running -> status`, setting the terminal timestamp.
    ///
    /// Fails if `status` is not terminal, if the request never started, or
    /// if it is already terminal.
    pub fn terminate(&self, status: WorkStatus) -> Result<(), TransitionError> {
        self.transition(status)
    }

    fn transition(&self, to: WorkStatus) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            let allowed = match (state.status, to) {
                (WorkStatus::Queued, WorkStatus::Running) => true,
                (WorkStatus::Running, next) => next.is_terminal(),
                _ => false,
            };
            if !allowed {
                result = Err(TransitionError {
                    id: self.id,
                    from: state.status,
                    to,
                });
                return false;
            }
            state.status = to;
            if to.is_terminal() {
                state.terminated_at = Some(chrono::Utc::now().max(self.created));
            }
            true
        });
        result
    }

    /// `terminated - created` once terminal, `now - created` before.
    pub fn elapsed(&self) -> Duration {
        let end = self.terminated_at().unwrap_or_else(chrono::Utc::now);
        (end - self.created).to_std().unwrap_or_default()
    }

    /// Log lines starting with `prefix`, prefix stripped, joined with `\n`.
    pub fn log_content(&self, prefix: &str) -> String {
        self.log.content(prefix)
    }

    /// Receiver following every status change.
    pub fn watch(&self) -> watch::Receiver<WorkState> {
        self.state.subscribe()
    }

    /// Wait until the request reaches a terminal status.
    pub async fn wait_terminal(&self) -> WorkState {
        let mut rx = self.watch();
        let terminal = rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map(|state| *state);
        // The sender lives in `self` and cannot be dropped while borrowed.
        terminal.unwrap_or_else(|_| self.state())
    }

    /// Request cancellation. Idempotent; a no-op once terminal.
    pub fn cancel(&self) {
        if !self.status().is_terminal() {
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for WorkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("script", &self.script)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request(name: &str) -> WorkRequest {
        WorkRequest::new(name, "/tmp/x.sh", Vec::new(), Vec::new(), Duration::from_secs(5))
    }

    #[test]
    fn ids_strictly_increase() {
        let ids: Vec<HookId> = (0..20).map(|_| request("a").id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids: {ids:?}");
    }

    #[test]
    fn new_request_is_queued() {
        let req = request("a");
        assert_eq!(req.status(), WorkStatus::Queued);
        assert!(req.terminated_at().is_none());
    }

    #[test]
    fn follows_the_status_dag() {
        let req = request("a");
        req.start().expect("queued -> running");
        assert_eq!(req.status(), WorkStatus::Running);

        req.terminate(WorkStatus::Success).expect("running -> success");
        assert_eq!(req.status(), WorkStatus::Success);
        assert_eq!(req.status_label(), "success");
    }

    #[test]
    fn cannot_skip_running() {
        let req = request("a");
        let err = req.terminate(WorkStatus::Error).unwrap_err();
        assert_matches!(
            err,
            TransitionError {
                from: WorkStatus::Queued,
                to: WorkStatus::Error,
                ..
            }
        );
        assert_eq!(req.status(), WorkStatus::Queued);
    }

    #[test]
    fn terminal_status_is_final() {
        let req = request("a");
        req.start().unwrap();
        req.terminate(WorkStatus::Timeout).unwrap();
        let first = req.terminated_at().expect("terminal timestamp");

        assert!(req.terminate(WorkStatus::Success).is_err());
        assert!(req.start().is_err());
        assert_eq!(req.status(), WorkStatus::Timeout);
        assert_eq!(req.terminated_at(), Some(first));
        assert!(first >= req.created());
    }

    #[test]
    fn running_is_not_a_terminal_target() {
        let req = request("a");
        req.start().unwrap();
        assert!(req.terminate(WorkStatus::Queued).is_err());
        assert!(req.terminate(WorkStatus::Running).is_err());
    }

    #[test]
    fn elapsed_freezes_once_terminal() {
        let req = request("a");
        req.start().unwrap();
        req.terminate(WorkStatus::Success).unwrap();
        let first = req.elapsed();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(req.elapsed(), first);
    }

    #[test]
    fn args_are_canonically_ordered() {
        let req = WorkRequest::new(
            "a",
            "/tmp/x.sh",
            Vec::new(),
            vec![
                ("user-agent".into(), "curl".into()),
                ("b".into(), "1".into()),
                ("A".into(), "first".into()),
                ("a".into(), "second".into()),
            ],
            Duration::from_secs(1),
        );
        let names: Vec<&str> = req.args().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["A", "a", "b", "user-agent"]);
    }

    #[test]
    fn normalizes_arg_names() {
        assert_eq!(normalize_arg_name("user-agent"), "USER_AGENT");
        assert_eq!(normalize_arg_name("x.y z"), "X_Y_Z");
        assert_eq!(normalize_arg_name("abc123"), "ABC123");
    }

    #[test]
    fn cancel_is_idempotent_and_ignored_once_terminal() {
        let req = request("a");
        req.cancel();
        req.cancel();
        assert!(req.is_cancelled());

        let done = request("b");
        done.start().unwrap();
        done.terminate(WorkStatus::Success).unwrap();
        done.cancel();
        assert!(!done.is_cancelled());
    }

    #[tokio::test]
    async fn wait_terminal_resolves_on_transition() {
        let req = Arc::new(request("a"));
        req.start().unwrap();

        let waiter = {
            let req = Arc::clone(&req);
            tokio::spawn(async move { req.wait_terminal().await })
        };
        req.terminate(WorkStatus::Error).unwrap();

        let state = waiter.await.expect("join");
        assert_eq!(state.status, WorkStatus::Error);
        assert!(state.terminated_at.is_some());
    }

    #[test]
    fn log_content_reads_from_sink() {
        let req = request("a");
        req.log().append(crate::log::Origin::Stdout, "notify:ok");
        assert_eq!(req.log_content("notify:"), "ok");
    }
}
