use std::sync::Arc;

use whd_core::HookService;

use crate::auth::passwd::PasswdFile;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Hook engine entry point.
    pub hooks: Arc<HookService>,
    /// Credentials for basic auth; `None` disables authentication.
    pub passwd: Option<Arc<PasswdFile>>,
}
