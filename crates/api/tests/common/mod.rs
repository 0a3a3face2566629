#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use clap::Parser;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use whd_api::auth::passwd::PasswdFile;
use whd_api::config::ServerConfig;
use whd_api::router::build_app_router;
use whd_api::state::AppState;
use whd_core::HookService;

/// A scripts directory, a running engine and the router in front of it.
pub struct TestApp {
    pub dir: TempDir,
    pub config: ServerConfig,
    pub hooks: Arc<HookService>,
    pub passwd: Option<Arc<PasswdFile>>,
}

impl TestApp {
    /// Build an app with extra command line flags; `scripts` is set up
    /// automatically under a temporary directory.
    pub fn new(extra_args: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        std::fs::create_dir(&scripts).unwrap();

        let mut args = vec![
            "whd".to_string(),
            "--scripts".to_string(),
            scripts.display().to_string(),
            "--hook-timeout".to_string(),
            "5".to_string(),
        ];
        args.extend(extra_args.iter().map(|a| a.to_string()));
        let config = ServerConfig::try_parse_from(args).unwrap();
        config.validate().unwrap();

        let mut engine = config.engine_config();
        engine.kill_grace = std::time::Duration::from_millis(300);
        let hooks = Arc::new(HookService::start(engine, Vec::new()).unwrap());

        Self {
            dir,
            config,
            hooks,
            passwd: None,
        }
    }

    pub fn with_passwd(mut self, passwd: PasswdFile) -> Self {
        self.passwd = Some(Arc::new(passwd));
        self
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.dir.path().join("scripts")
    }

    /// Write an executable script relative to the scripts directory.
    pub fn script(&self, relative: &str, body: &str) -> PathBuf {
        let path = self.scripts_dir().join(relative);
        write_executable(&path, body);
        path
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            hooks: Arc::clone(&self.hooks),
            passwd: self.passwd.clone(),
        };
        build_app_router(state, &self.config)
    }
}

pub fn write_executable(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Send a GET request to the given URI.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, &[], Body::empty()).await
}

/// Send a POST request with a raw body.
pub async fn post(app: Router, uri: &str, body: impl Into<Body>) -> Response<Body> {
    send(app, Method::POST, uri, &[], body.into()).await
}

pub async fn send(
    app: Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Body,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    app.oneshot(builder.body(body).unwrap()).await.unwrap()
}

/// Collect the whole body as UTF-8 text.
pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
