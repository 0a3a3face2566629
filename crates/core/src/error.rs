//! Error taxonomy of the hook execution engine.
//!
//! Only [`HookError::NotFound`], [`HookError::BadRequest`],
//! [`HookError::Unauthorized`] and [`HookError::ShutdownInProgress`] ever
//! cross the synchronous submission boundary. Everything that happens after
//! a request has been enqueued is reported in-band: the request reaches a
//! terminal status and the log sink receives a diagnostic line built from
//! one of the remaining variants.

use crate::types::HookId;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Unable to start hook script: {0}")]
    SpawnFailed(String),

    #[error("Hook script exited with {0}")]
    ScriptExitNonZero(String),

    #[error("Hook timed out after {0}s")]
    Timeout(u64),

    #[error("Hook #{0} was cancelled")]
    Cancelled(HookId),

    #[error("Hook log I/O error: {0}")]
    SinkIo(#[from] std::io::Error),

    #[error("Notifier error: {0}")]
    Notifier(String),
}

/// Convenience alias for results produced by the engine.
pub type HookResult<T> = Result<T, HookError>;
