//! Entry point of the engine for the HTTP layer.
//!
//! [`HookService`] owns the scripts view, the worker pool and the
//! notification dispatcher. Callers submit a [`HookInvocation`] and get back
//! a [`HookHandle`] exposing the live log and the terminal status; they
//! never see the underlying [`WorkRequest`].

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;

use crate::config::EngineConfig;
use crate::error::{HookError, HookResult};
use crate::log::{LogEvent, Subscription};
use crate::notify::{NotificationDispatcher, Notifier};
use crate::pool::{PoolStats, ShutdownOutcome, WorkerPool};
use crate::runner::HookRunner;
use crate::scripts::ScriptsDir;
use crate::types::HookId;
use crate::work::{normalize_arg_name, WorkRequest, WorkStatus};

/// What the caller asks to run.
#[derive(Debug, Clone, Default)]
pub struct HookInvocation {
    /// Hook name, i.e. the script path below the scripts root without
    /// extension.
    pub name: String,
    pub payload: Vec<u8>,
    /// Named arguments, exported to the script as `hook_<NAME>`.
    pub args: Vec<(String, String)>,
    /// Requested timeout, capped to the configured hook timeout.
    pub timeout: Option<Duration>,
}

impl HookInvocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Caller's view of a submitted hook.
pub struct HookHandle {
    req: Arc<WorkRequest>,
    subscription: Option<Subscription>,
}

impl HookHandle {
    pub fn id(&self) -> HookId {
        self.req.id()
    }

    pub fn name(&self) -> &str {
        self.req.name()
    }

    pub fn status(&self) -> WorkStatus {
        self.req.status()
    }

    /// Log subscription taken at submission time, so it replays every line
    /// from the first one. Can be taken once.
    pub fn take_subscription(&mut self) -> Option<Subscription> {
        self.subscription.take()
    }

    /// [`take_subscription`](Self::take_subscription) as a stream.
    pub fn take_events(&mut self) -> Option<impl Stream<Item = LogEvent> + Send> {
        self.take_subscription().map(Subscription::into_stream)
    }

    /// Wait for the terminal status.
    pub async fn wait(&self) -> WorkStatus {
        self.req.wait_terminal().await.status
    }

    /// Best-effort cancellation; no-op once terminal.
    pub fn cancel(&self) {
        self.req.cancel();
    }

    /// Lines starting with `prefix`, stripped.
    pub fn log_content(&self, prefix: &str) -> String {
        self.req.log_content(prefix)
    }

    /// Persistent log file, if any.
    pub fn log_file(&self) -> Option<&std::path::Path> {
        self.req.log().path()
    }
}

impl std::fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

pub struct HookService {
    config: EngineConfig,
    scripts: ScriptsDir,
    pool: WorkerPool,
    dispatcher: Arc<NotificationDispatcher>,
    /// Held from id allocation until the request is queued.
    submission: Mutex<()>,
}

impl HookService {
    /// Open the scripts directory, prepare the log directory and start the
    /// workers. Must be called from within a Tokio runtime.
    pub fn start(config: EngineConfig, notifiers: Vec<Arc<dyn Notifier>>) -> io::Result<Self> {
        let scripts = ScriptsDir::new(&config.scripts_dir)?;
        if let Some(dir) = &config.log_dir {
            std::fs::create_dir_all(dir)?;
        }

        let dispatcher = Arc::new(NotificationDispatcher::new(
            notifiers,
            config.notify_timeout,
            config.notify_concurrency,
        ));
        let runner = Arc::new(HookRunner::new(scripts.clone(), config.kill_grace));
        let pool = WorkerPool::start(config.nb_workers, runner, Arc::clone(&dispatcher));

        tracing::info!(
            scripts = %scripts.root().display(),
            nb_workers = pool.nb_workers(),
            hook_timeout_secs = config.hook_timeout.as_secs(),
            notifiers = dispatcher.notifier_count(),
            "Hook service started",
        );

        Ok(Self {
            config,
            scripts,
            pool,
            dispatcher,
            submission: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve, validate and enqueue an invocation.
    ///
    /// Only `NotFound`, `BadRequest` and `ShutdownInProgress` are returned
    /// here; every later failure is reported through the handle. Ids are
    /// allocated in queue order, also across concurrent callers.
    pub async fn submit(&self, invocation: HookInvocation) -> HookResult<HookHandle> {
        if self.pool.is_shutting_down() {
            return Err(HookError::ShutdownInProgress);
        }

        let name = invocation.name.trim_matches('/').to_string();
        let script = self.resolve(&name).await?;
        validate_args(&invocation.args)?;
        let timeout = self.config.effective_timeout(invocation.timeout);

        let (req, subscription) = {
            let _submission = self.submission.lock().unwrap_or_else(|e| e.into_inner());
            let req = WorkRequest::new(name, script, invocation.payload, invocation.args, timeout)
                .with_log(self.config.log_dir.as_deref(), self.config.log_output);
            let req = Arc::new(req);
            let subscription = req.log().subscribe();
            self.pool.submit(Arc::clone(&req))?;
            (req, subscription)
        };

        tracing::info!(
            hook = %req.name(),
            hook_id = req.id(),
            timeout_secs = timeout.as_secs_f64(),
            "Hook queued",
        );

        Ok(HookHandle {
            req,
            subscription: Some(subscription),
        })
    }

    /// Script lookup touches the filesystem, so it runs on the blocking pool.
    async fn resolve(&self, name: &str) -> HookResult<PathBuf> {
        let scripts = self.scripts.clone();
        let lookup = name.to_string();
        match tokio::task::spawn_blocking(move || scripts.resolve(&lookup)).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(hook = name, error = %e, "Hook lookup failed");
                Err(HookError::NotFound(name.to_string()))
            }
        }
    }

    pub fn cancel(&self, handle: &HookHandle) {
        tracing::info!(hook = %handle.name(), hook_id = handle.id(), "Hook cancellation requested");
        handle.cancel();
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.pool.is_shutting_down()
    }

    /// Stop the pool (see [`WorkerPool::shutdown`]) and then wait, within
    /// the same grace, for pending notifications.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        let started = tokio::time::Instant::now();
        let outcome = self.pool.shutdown(grace).await;
        let remaining = grace.saturating_sub(started.elapsed());
        self.dispatcher.drain(remaining.max(self.config.kill_grace)).await;
        outcome
    }
}

fn validate_args(args: &[(String, String)]) -> HookResult<()> {
    for (name, value) in args {
        if name.is_empty() || normalize_arg_name(name).chars().all(|c| c == '_') {
            return Err(HookError::BadRequest(format!("invalid argument name {name:?}")));
        }
        if name.contains('\0') || value.contains('\0') {
            return Err(HookError::BadRequest(format!(
                "argument {name:?} contains a NUL byte"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
