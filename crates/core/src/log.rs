//! Per-execution log sink.
//!
//! [`LogSink`] frames the raw byte chunks produced by a hook script into
//! lines, numbers them, keeps them in memory, persists them to a log file
//! when a log directory is configured, and fans them out to any number of
//! [`Subscription`]s.
//!
//! Each subscriber owns a bounded channel of [`SUBSCRIBER_BUFFER`] lines.
//! The sink never waits on a subscriber: once a channel is full that
//! subscriber stops receiving lines and, after it has drained what was
//! buffered, observes a single [`LogEvent::Truncated`] followed by the
//! closing message. The in-memory log, the file, and every other
//! subscriber are unaffected.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::SecondsFormat;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::types::{HookId, Timestamp};

/// Lines a subscriber may fall behind before it is cut off.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Line emitted to a subscriber that fell behind.
pub const TRUNCATION_MARKER: &str = "[output truncated: reader fell behind]";

// ---------------------------------------------------------------------------
// Lines and events
// ---------------------------------------------------------------------------

/// Stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Stdout,
    Stderr,
}

impl Origin {
    fn index(self) -> usize {
        match self {
            Origin::Stdout => 0,
            Origin::Stderr => 1,
        }
    }
}

/// One captured line. Sequence numbers start at 1 and have no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub seq: u64,
    pub origin: Origin,
    pub text: String,
}

/// What a [`Subscription`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A line produced by the hook.
    Line(LogLine),
    /// The subscriber fell behind and missed every line after the last one
    /// it received.
    Truncated,
    /// The sink was closed with this final message.
    Closed(String),
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Line(line) => f.write_str(&line.text),
            LogEvent::Truncated => f.write_str(TRUNCATION_MARKER),
            LogEvent::Closed(message) => f.write_str(message),
        }
    }
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// State shared between the sink and one subscriber.
#[derive(Default)]
struct SubscriberState {
    truncated: AtomicBool,
    final_message: OnceLock<String>,
}

struct SubscriberSlot {
    tx: mpsc::Sender<LogLine>,
    state: Arc<SubscriberState>,
}

struct SinkInner {
    lines: Vec<LogLine>,
    /// Bytes received after the last `\n`, per origin.
    partial: [Vec<u8>; 2],
    subscribers: Vec<SubscriberSlot>,
    file: Option<BufWriter<File>>,
    file_opened: bool,
    io_error: Option<String>,
    closed: bool,
    final_message: Option<String>,
}

/// Append-only, line-framed log of a single hook execution.
pub struct LogSink {
    hook: String,
    id: HookId,
    echo: bool,
    path: Option<PathBuf>,
    inner: Mutex<SinkInner>,
}

impl LogSink {
    /// In-memory sink without file persistence.
    pub fn new(hook: impl Into<String>, id: HookId) -> Self {
        Self {
            hook: hook.into(),
            id,
            echo: false,
            path: None,
            inner: Mutex::new(SinkInner {
                lines: Vec::new(),
                partial: [Vec::new(), Vec::new()],
                subscribers: Vec::new(),
                file: None,
                file_opened: false,
                io_error: None,
                closed: false,
                final_message: None,
            }),
        }
    }

    /// Sink persisting to `<log_dir>/<hook>_<id>_<created>.log` when a log
    /// directory is given, and mirroring lines to the server logs when
    /// `echo` is set.
    ///
    /// No I/O happens here: the file is created by
    /// [`open_file`](Self::open_file).
    pub fn create(
        hook: impl Into<String>,
        id: HookId,
        created: Timestamp,
        log_dir: Option<&Path>,
        echo: bool,
    ) -> Self {
        let mut sink = Self::new(hook, id);
        sink.echo = echo;
        sink.path = log_dir.map(|dir| dir.join(log_file_name(&sink.hook, id, created)));
        sink
    }

    /// Create the log file and write the lines captured so far. Blocking;
    /// call it from a blocking context. Does nothing without a log
    /// directory, once closed, or on a second call.
    ///
    /// Failing to create the file is not fatal: the error is recorded (see
    /// [`io_error`](Self::io_error)) and the sink keeps working in memory.
    pub fn open_file(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let mut inner = self.lock();
        if inner.file_opened || inner.closed {
            return;
        }
        inner.file_opened = true;

        match File::create(path) {
            Ok(file) => {
                inner.file = Some(BufWriter::new(file));
                let backlog: Vec<String> = inner.lines.iter().map(|l| l.text.clone()).collect();
                for text in &backlog {
                    self.write_file(&mut inner, text);
                }
            }
            Err(e) => {
                tracing::warn!(
                    hook = %self.hook,
                    hook_id = self.id,
                    path = %path.display(),
                    error = %e,
                    "Unable to create hook log file",
                );
                inner.io_error = Some(e.to_string());
            }
        }
    }

    /// Log file location, if persistence was requested.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Feed a raw chunk of child output.
    ///
    /// The chunk is split on `\n`; a trailing `\r` is stripped from every
    /// line. Bytes after the last `\n` are kept until more output arrives
    /// or the sink is closed. Chunks arriving after [`close`](Self::close)
    /// are discarded.
    pub fn write(&self, origin: Origin, chunk: &[u8]) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }

        inner.partial[origin.index()].extend_from_slice(chunk);
        while let Some(pos) = inner.partial[origin.index()]
            .iter()
            .position(|b| *b == b'\n')
        {
            let raw: Vec<u8> = inner.partial[origin.index()].drain(..=pos).collect();
            let text = frame(&raw[..raw.len() - 1]);
            self.push_line(&mut inner, origin, text);
        }
    }

    /// Append a complete line.
    pub fn append(&self, origin: Origin, line: impl Into<String>) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        let mut text = line.into();
        if text.ends_with('\r') {
            text.pop();
        }
        self.push_line(&mut inner, origin, text);
    }

    /// Close the sink.
    ///
    /// Pending partial lines are flushed, `final_message` is recorded and
    /// written to the log file, the file is flushed, and every subscriber
    /// channel is closed. Returns `false` if the sink was already closed, in
    /// which case nothing happens.
    pub fn close(&self, final_message: Option<String>) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }

        for origin in [Origin::Stdout, Origin::Stderr] {
            let rest = std::mem::take(&mut inner.partial[origin.index()]);
            if !rest.is_empty() {
                let text = frame(&rest);
                self.push_line(&mut inner, origin, text);
            }
        }

        inner.closed = true;
        if let Some(message) = &final_message {
            self.write_file(&mut inner, message);
        }
        if let Some(mut file) = inner.file.take() {
            if let Err(e) = file.flush() {
                self.record_io_error(&mut inner, &e);
            }
        }

        for slot in inner.subscribers.drain(..) {
            if let Some(message) = &final_message {
                let _ = slot.state.final_message.set(message.clone());
            }
        }
        inner.final_message = final_message;
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Subscribe to the log.
    ///
    /// The subscription first replays every line already appended, then
    /// follows the live tail, with neither duplicates nor gaps.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.lock();
        let state = Arc::new(SubscriberState::default());
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let backlog: VecDeque<LogLine> = inner.lines.iter().cloned().collect();

        if inner.closed {
            if let Some(message) = &inner.final_message {
                let _ = state.final_message.set(message.clone());
            }
        } else {
            inner.subscribers.push(SubscriberSlot {
                tx,
                state: Arc::clone(&state),
            });
        }

        Subscription {
            backlog,
            rx,
            state,
            tail_done: false,
            truncation_reported: false,
            close_reported: false,
        }
    }

    /// Snapshot of every line appended so far.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lock().lines.clone()
    }

    /// Lines starting with `prefix`, prefix stripped, joined with `\n`.
    pub fn content(&self, prefix: &str) -> String {
        self.lock()
            .lines
            .iter()
            .filter_map(|line| line.text.strip_prefix(prefix))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First file error encountered, if any.
    pub fn io_error(&self) -> Option<String> {
        self.lock().io_error.clone()
    }

    // -- internals ----------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_line(&self, inner: &mut SinkInner, origin: Origin, text: String) {
        let line = LogLine {
            seq: inner.lines.len() as u64 + 1,
            origin,
            text,
        };

        self.write_file(inner, &line.text);
        if self.echo {
            tracing::info!(hook = %self.hook, hook_id = self.id, "{}", line.text);
        }

        inner.subscribers.retain(|slot| {
            if slot.state.truncated.load(Ordering::Acquire) {
                return true;
            }
            match slot.tx.try_send(line.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    slot.state.truncated.store(true, Ordering::Release);
                    true
                }
                // Subscriber went away.
                Err(TrySendError::Closed(_)) => false,
            }
        });

        inner.lines.push(line);
    }

    fn write_file(&self, inner: &mut SinkInner, text: &str) {
        let Some(file) = inner.file.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{text}") {
            inner.file = None;
            self.record_io_error(inner, &e);
        }
    }

    fn record_io_error(&self, inner: &mut SinkInner, err: &std::io::Error) {
        if inner.io_error.is_none() {
            tracing::warn!(
                hook = %self.hook,
                hook_id = self.id,
                error = %err,
                "Hook log write failed, file logging disabled for this execution",
            );
            inner.io_error = Some(err.to_string());
        }
    }
}

/// `<hook>_<id>_<created>.log`, nested hook names flattened with `_`.
pub fn log_file_name(hook: &str, id: HookId, created: Timestamp) -> String {
    format!(
        "{}_{}_{}.log",
        hook.replace('/', "_"),
        id,
        created.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

fn frame(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Reader side of a [`LogSink`].
pub struct Subscription {
    backlog: VecDeque<LogLine>,
    rx: mpsc::Receiver<LogLine>,
    state: Arc<SubscriberState>,
    tail_done: bool,
    truncation_reported: bool,
    close_reported: bool,
}

impl Subscription {
    /// Next event, or `None` once the sink is closed and everything was
    /// delivered.
    pub async fn next(&mut self) -> Option<LogEvent> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(LogEvent::Line(line));
        }

        if !self.tail_done {
            match self.rx.recv().await {
                Some(line) => return Some(LogEvent::Line(line)),
                None => self.tail_done = true,
            }
        }

        if !self.truncation_reported && self.state.truncated.load(Ordering::Acquire) {
            self.truncation_reported = true;
            return Some(LogEvent::Truncated);
        }

        if !self.close_reported {
            self.close_reported = true;
            if let Some(message) = self.state.final_message.get() {
                return Some(LogEvent::Closed(message.clone()));
            }
        }

        None
    }

    /// Adapt into a [`Stream`] of events.
    pub fn into_stream(self) -> impl Stream<Item = LogEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
