//! Script child process management.
//!
//! [`HookRunner::run`] drives a [`WorkRequest`] from `Queued` to a terminal
//! status. The script runs in its own process group so that the timeout and
//! cancellation paths can signal every process it started: `SIGTERM` first,
//! `SIGKILL` once the grace window has elapsed. A guard kills the group if
//! the run is abandoned halfway.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::HookError;
use crate::log::{LogSink, Origin};
use crate::scripts::ScriptsDir;
use crate::work::{normalize_arg_name, WorkRequest, WorkStatus};

/// Size of the read buffer used for each child stream.
const READ_CHUNK: usize = 8 * 1024;

/// Largest payload exported through `hook_payload`. Bigger payloads are
/// still available on stdin.
const MAX_ENV_PAYLOAD: usize = 128 * 1024 - 1;

/// Spawn attempts when the freshly written script is still busy.
const SPAWN_ATTEMPTS: usize = 3;

pub struct HookRunner {
    scripts: ScriptsDir,
    kill_grace: Duration,
}

impl HookRunner {
    pub fn new(scripts: ScriptsDir, kill_grace: Duration) -> Self {
        Self { scripts, kill_grace }
    }

    pub fn scripts(&self) -> &ScriptsDir {
        &self.scripts
    }

    /// Execute `req` and return its terminal status.
    ///
    /// Always leaves the request terminal and its log sink closed with the
    /// final marker, whatever goes wrong.
    pub async fn run(&self, req: &WorkRequest) -> WorkStatus {
        if let Err(e) = req.start() {
            tracing::warn!(hook = %req.name(), hook_id = req.id(), error = %e, "Hook not runnable");
            return req.status();
        }
        tracing::info!(hook = %req.name(), hook_id = req.id(), "Hook started");
        blocking_log(req.log(), LogSink::open_file).await;

        let result = self.execute(req).await;
        let status = match &result {
            Ok(()) => WorkStatus::Success,
            Err(HookError::Timeout(_)) => WorkStatus::Timeout,
            Err(_) => WorkStatus::Error,
        };

        if let Err(e) = &result {
            let line = e.to_string();
            blocking_log(req.log(), move |sink| sink.append(Origin::Stderr, line)).await;
        }
        if let Err(e) = req.terminate(status) {
            tracing::error!(hook = %req.name(), hook_id = req.id(), error = %e, "Unexpected terminal transition");
        }
        let marker = final_message(req);
        blocking_log(req.log(), move |sink| {
            sink.close(Some(marker));
        })
        .await;

        if let Some(e) = req.log().io_error() {
            let e = HookError::SinkIo(std::io::Error::other(e));
            tracing::warn!(hook = %req.name(), hook_id = req.id(), error = %e, "Hook log file is incomplete");
        }

        match &result {
            Ok(()) => tracing::info!(
                hook = %req.name(),
                hook_id = req.id(),
                status = %status,
                elapsed_ms = req.elapsed().as_millis() as u64,
                "Hook finished",
            ),
            Err(e) => tracing::warn!(
                hook = %req.name(),
                hook_id = req.id(),
                status = %status,
                error = %e,
                "Hook failed",
            ),
        }
        status
    }

    async fn execute(&self, req: &WorkRequest) -> Result<(), HookError> {
        if req.is_cancelled() {
            return Err(HookError::Cancelled(req.id()));
        }

        let script = req.script();
        if !self.scripts.contains(script) {
            return Err(HookError::SpawnFailed(format!(
                "{} is outside the scripts directory",
                script.display()
            )));
        }
        let meta = std::fs::metadata(script)
            .map_err(|e| HookError::SpawnFailed(format!("{}: {e}", script.display())))?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(HookError::SpawnFailed(format!(
                "{} is not an executable file",
                script.display()
            )));
        }

        let mut cmd = build_command(req);
        let mut child = spawn(&mut cmd).await?;
        let mut guard = ProcessGroupGuard::new(&child);

        tracing::debug!(hook = %req.name(), hook_id = req.id(), pid = ?child.id(), "Hook process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            let payload = req.payload().to_vec();
            tokio::spawn(async move {
                // The script may exit without reading stdin.
                let _ = stdin.write_all(&payload).await;
            });
        }

        let readers = [
            spawn_reader(child.stdout.take(), Origin::Stdout, Arc::clone(req.log())),
            spawn_reader(child.stderr.take(), Origin::Stderr, Arc::clone(req.log())),
        ];

        let result = tokio::select! {
            waited = child.wait() => match waited {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(HookError::ScriptExitNonZero(describe_exit(status))),
                Err(e) => Err(HookError::ScriptExitNonZero(format!("unknown status ({e})"))),
            },
            _ = tokio::time::sleep(req.timeout()) => {
                self.stop(&mut child, &guard).await;
                Err(HookError::Timeout(req.timeout().as_secs()))
            }
            _ = req.cancellation().cancelled() => {
                self.stop(&mut child, &guard).await;
                Err(HookError::Cancelled(req.id()))
            }
        };

        self.join_readers(readers, &guard).await;
        // The group has been reaped or killed; its id may be reused from now on.
        guard.disarm();
        result
    }

    /// Terminate the whole process group, escalating after the grace window.
    async fn stop(&self, child: &mut Child, guard: &ProcessGroupGuard) {
        guard.signal(Signal::SIGTERM);
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            guard.signal(Signal::SIGKILL);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Wait for both stream readers. A background process that inherited the
    /// pipes would keep them open forever, so the group is killed once the
    /// grace window has elapsed.
    async fn join_readers(&self, readers: [JoinHandle<()>; 2], guard: &ProcessGroupGuard) {
        let [stdout, stderr] = readers;
        let (stdout_abort, stderr_abort) = (stdout.abort_handle(), stderr.abort_handle());

        let joined = tokio::time::timeout(self.kill_grace, async {
            let _ = stdout.await;
            let _ = stderr.await;
        })
        .await;

        if joined.is_err() {
            tracing::debug!(pgid = guard.pgid, "Output still open after exit, killing process group");
            guard.signal(Signal::SIGKILL);
            stdout_abort.abort();
            stderr_abort.abort();
        }
    }
}

/// Last line of every execution log.
pub fn final_message(req: &WorkRequest) -> String {
    format!(
        "hook {}#{} {} ({})",
        req.name(),
        req.id(),
        req.status_label(),
        format_elapsed(req.elapsed())
    )
}

/// Elapsed time with millisecond precision, e.g. `1.250s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.3}s", elapsed.as_secs_f64())
}

fn build_command(req: &WorkRequest) -> Command {
    let script = req.script();
    let mut cmd = Command::new(script);
    if let Some(dir) = script.parent() {
        cmd.current_dir(dir);
    }

    for (name, value) in req.args() {
        cmd.env(format!("hook_{}", normalize_arg_name(name)), env_safe(value));
    }
    cmd.env("hook_id", req.id().to_string());
    cmd.env("hook_name", req.name());
    if req.payload().len() <= MAX_ENV_PAYLOAD {
        cmd.env("hook_payload", env_safe(&String::from_utf8_lossy(req.payload())));
    } else {
        tracing::debug!(
            hook_id = req.id(),
            size = req.payload().len(),
            "Payload too large for hook_payload, only passed on stdin"
        );
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

async fn spawn(cmd: &mut Command) -> Result<Child, HookError> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempt < SPAWN_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => return Err(HookError::SpawnFailed(e.to_string())),
        }
    }
}

/// Run a sink operation that may touch the log file on the blocking pool.
async fn blocking_log<F>(sink: &Arc<LogSink>, op: F)
where
    F: FnOnce(&LogSink) + Send + 'static,
{
    let sink = Arc::clone(sink);
    if let Err(e) = tokio::task::spawn_blocking(move || op(&sink)).await {
        tracing::error!(error = %e, "Hook log operation panicked");
    }
}

fn spawn_reader<R>(stream: Option<R>, origin: Origin, sink: Arc<LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return;
        };
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    blocking_log(&sink, move |sink| sink.write(origin, &chunk)).await;
                }
                Err(e) => {
                    tracing::debug!(?origin, error = %e, "Hook output read failed");
                    break;
                }
            }
        }
    })
}

fn env_safe(value: &str) -> String {
    value.replace('\0', "")
}

fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}

/// Kills the process group of a spawned script when dropped, unless the run
/// completed and [`disarm`](Self::disarm) was called.
struct ProcessGroupGuard {
    pgid: Option<i32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn signal(&self, signal: Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid, ?signal, error = %e, "Unable to signal hook process group"),
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.signal(Signal::SIGKILL);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
