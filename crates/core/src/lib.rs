//! Hook execution engine.
//!
//! Turns an invocation (hook name, payload, arguments) into a script child
//! process, captures its output line by line and reports a terminal status:
//!
//! - [`HookService`]: the only entry point used by the HTTP layer.
//! - [`WorkRequest`]: one invocation and its status machine.
//! - [`LogSink`]: line framing, persistence and live fan-out of output.
//! - [`HookRunner`]: child process lifecycle, timeout and cancellation.
//! - [`WorkerPool`]: bound on concurrently running hooks.
//! - [`notify`]: notifier adapter trait and dispatcher.

pub mod binding;
pub mod config;
pub mod error;
pub mod log;
pub mod notify;
pub mod pool;
pub mod runner;
pub mod scripts;
pub mod types;
pub mod work;

pub use binding::{HookHandle, HookInvocation, HookService};
pub use config::EngineConfig;
pub use error::{HookError, HookResult};
pub use log::{LogEvent, LogLine, LogSink, Origin, Subscription};
pub use notify::{NotificationDispatcher, Notifier, NotifyError};
pub use pool::{PoolStats, ShutdownOutcome, WorkerPool};
pub use runner::HookRunner;
pub use scripts::ScriptsDir;
pub use types::{HookId, Timestamp};
pub use work::{WorkRequest, WorkState, WorkStatus};
