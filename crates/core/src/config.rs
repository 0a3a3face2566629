//! Engine configuration.
//!
//! Built by the binary from its command line; the engine itself never reads
//! flags or environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrent hook runners.
pub const DEFAULT_NB_WORKERS: usize = 2;

/// Default (and maximum) hook execution time.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between the graceful termination signal and the forced kill.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for a single notifier call.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of notifier calls in flight at once.
pub const DEFAULT_NOTIFY_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scripts root directory.
    pub scripts_dir: PathBuf,
    /// Number of long-lived workers, i.e. the bound on concurrent hooks.
    pub nb_workers: usize,
    /// Default hook timeout; per-request timeouts are capped to it.
    pub hook_timeout: Duration,
    /// Grace window between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Directory receiving one log file per execution (`None` disables it).
    pub log_dir: Option<PathBuf>,
    /// Mirror every hook line into the server logs.
    pub log_output: bool,
    /// Per-call notifier timeout.
    pub notify_timeout: Duration,
    /// Concurrent notifier calls.
    pub notify_concurrency: usize,
}

impl EngineConfig {
    /// Configuration with defaults for everything but the scripts root.
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            nb_workers: DEFAULT_NB_WORKERS,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            log_dir: None,
            log_output: false,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            notify_concurrency: DEFAULT_NOTIFY_CONCURRENCY,
        }
    }

    /// Effective timeout for a request: the requested value capped to
    /// [`hook_timeout`](Self::hook_timeout), or the default when unset.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.hook_timeout),
            _ => self.hook_timeout,
        }
    }
}
