use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whd_api::auth::passwd::{PasswdError, PasswdFile};
use whd_api::config::{ConfigError, ServerConfig};
use whd_api::router::build_app_router;
use whd_api::state::AppState;
use whd_api::tls::{self, TlsError, TlsListener};
use whd_core::{HookService, ShutdownOutcome};

/// Time left to in-flight responses once the engine has stopped.
const RESPONSE_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid notification URI: {0}")]
    Notification(#[from] whd_events::UriError),

    #[error("unable to load password file: {0}")]
    Passwd(#[from] PasswdError),

    #[error("unable to start hook service: {0}")]
    Engine(std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("unable to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let config = ServerConfig::parse();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Unable to run the server");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), StartupError> {
    config.validate()?;

    // --- Notifications ---
    let notifiers = match config.notification_uri.as_deref() {
        Some(uri) => vec![whd_events::build_notifier(uri)?],
        None => Vec::new(),
    };

    // --- Basic auth ---
    let passwd = if config.passwd_file.is_file() {
        let passwd = PasswdFile::load(&config.passwd_file)?;
        tracing::info!(
            file = %config.passwd_file.display(),
            users = passwd.len(),
            "Basic authentication enabled",
        );
        Some(Arc::new(passwd))
    } else {
        tracing::debug!(file = %config.passwd_file.display(), "No password file, authentication disabled");
        None
    };

    // --- Hook engine ---
    let hooks =
        Arc::new(HookService::start(config.engine_config(), notifiers).map_err(StartupError::Engine)?);

    let state = AppState {
        hooks: Arc::clone(&hooks),
        passwd,
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let stopped = async move {
        let _ = stop_rx.await;
    };

    let mut server = if config.tls {
        let tls_config = tls::load_server_config(&config.tls_cert_file, &config.tls_key_file)?;
        tracing::info!(%addr, "Starting HTTPS server");
        tokio::spawn(async move {
            axum::serve(TlsListener::new(listener, tls_config), app)
                .with_graceful_shutdown(stopped)
                .await
        })
    } else {
        tracing::info!(%addr, "Starting HTTP server");
        tokio::spawn(async move { axum::serve(listener, app).with_graceful_shutdown(stopped).await })
    };

    tokio::select! {
        () = shutdown_signal() => {}
        result = &mut server => {
            // The server only returns on its own when it failed.
            hooks.shutdown(Duration::ZERO).await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(StartupError::Serve(e)),
                Err(e) => Err(StartupError::Serve(std::io::Error::other(e))),
            };
        }
    }

    // --- Graceful shutdown ---
    let _ = stop_tx.send(());
    let grace = config.shutdown_grace();
    tracing::info!(grace_secs = grace.as_secs(), "Waiting for running hooks");
    match hooks.shutdown(grace).await {
        ShutdownOutcome::Drained => tracing::info!("All hooks completed"),
        ShutdownOutcome::Cancelled(n) => {
            tracing::warn!(cancelled = n, "Grace period expired, remaining hooks were cancelled");
        }
    }

    match tokio::time::timeout(RESPONSE_DRAIN, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(StartupError::Serve(e)),
        Ok(Err(e)) => return Err(StartupError::Serve(std::io::Error::other(e))),
        Err(_) => tracing::warn!("Some responses were still open at exit"),
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM. If a handler cannot be
/// installed the corresponding branch never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
