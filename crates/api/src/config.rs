use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use whd_core::EngineConfig;

/// Server configuration, from the command line or `WHD_*` environment
/// variables (a `.env` file is loaded first).
#[derive(Debug, Clone, Parser)]
#[command(name = "whd", version, about = "Run shell scripts over HTTP")]
pub struct ServerConfig {
    /// Listen address; a leading `:` binds every interface.
    #[arg(long, env = "WHD_LISTEN_ADDR", default_value = ":8080")]
    pub listen_addr: String,

    /// Serve HTTPS.
    #[arg(long, env = "WHD_TLS")]
    pub tls: bool,

    /// PEM certificate chain.
    #[arg(long, env = "WHD_TLS_CERT_FILE", default_value = "server.pem")]
    pub tls_cert_file: PathBuf,

    /// PEM private key.
    #[arg(long, env = "WHD_TLS_KEY_FILE", default_value = "server.key")]
    pub tls_key_file: PathBuf,

    /// Domain for automatic certificates (not supported).
    #[arg(long, env = "WHD_TLS_DOMAIN")]
    pub tls_domain: Option<String>,

    /// Number of hooks allowed to run at once.
    #[arg(long, env = "WHD_NB_WORKERS", default_value_t = whd_core::config::DEFAULT_NB_WORKERS)]
    pub nb_workers: usize,

    /// Maximum hook execution time in seconds.
    #[arg(long, env = "WHD_HOOK_TIMEOUT", default_value_t = 10)]
    pub hook_timeout: u64,

    /// Directory receiving one log file per execution.
    #[arg(long, env = "WHD_HOOK_LOG_DIR")]
    pub hook_log_dir: Option<PathBuf>,

    /// Copy hook output into the server logs.
    #[arg(long, env = "WHD_HOOK_LOG_OUTPUT")]
    pub hook_log_output: bool,

    /// Scripts root directory.
    #[arg(long, env = "WHD_SCRIPTS", default_value = "scripts")]
    pub scripts: PathBuf,

    /// Password file for basic auth (`user:<argon2 hash>` lines). Ignored
    /// if missing.
    #[arg(long, env = "WHD_PASSWD_FILE", default_value = ".htpasswd")]
    pub passwd_file: PathBuf,

    #[arg(long, env = "WHD_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Directory served under `/static`.
    #[arg(long, env = "WHD_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Where to send notifications (`smtp:`, `http:`, `https:`).
    #[arg(long, env = "WHD_NOTIFICATION_URI")]
    pub notification_uri: Option<String>,

    /// Trust store for HTTP signatures (not supported).
    #[arg(long, env = "WHD_TRUST_STORE_FILE")]
    pub trust_store_file: Option<PathBuf>,

    /// Seconds granted to running hooks at shutdown before they are killed.
    #[arg(long, env = "WHD_SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--tls-domain is not supported, provide --tls-cert-file and --tls-key-file instead")]
    AcmeUnsupported,

    #[error("--trust-store-file is not supported: HTTP signature verification is not available")]
    TrustStoreUnsupported,

    #[error("--nb-workers must be at least 1")]
    NoWorkers,

    #[error("--hook-timeout must be at least 1 second")]
    NoTimeout,
}

impl ServerConfig {
    /// Reject option combinations the server cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_domain.is_some() {
            return Err(ConfigError::AcmeUnsupported);
        }
        if self.trust_store_file.is_some() {
            return Err(ConfigError::TrustStoreUnsupported);
        }
        if self.nb_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.hook_timeout == 0 {
            return Err(ConfigError::NoTimeout);
        }
        Ok(())
    }

    /// Address suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        match self.listen_addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_addr.clone(),
        }
    }

    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> String {
        let level = self.log_level.as_str();
        format!("whd_api={level},whd_core={level},whd_events={level},tower_http={level}")
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Engine settings derived from the command line.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::new(&self.scripts);
        engine.nb_workers = self.nb_workers;
        engine.hook_timeout = Duration::from_secs(self.hook_timeout);
        engine.log_dir = self.hook_log_dir.clone();
        engine.log_output = self.hook_log_output;
        engine
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        ServerConfig::try_parse_from(std::iter::once("whd").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(!config.tls);
        assert_eq!(config.nb_workers, 2);
        assert_eq!(config.hook_timeout, 10);
        assert_eq!(config.scripts, PathBuf::from("scripts"));
        assert_eq!(config.passwd_file, PathBuf::from(".htpasswd"));
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_host_is_kept() {
        let config = parse(&["--listen-addr", "127.0.0.1:9000"]);
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn engine_config_follows_flags() {
        let config = parse(&[
            "--nb-workers",
            "4",
            "--hook-timeout",
            "30",
            "--hook-log-dir",
            "/var/log/whd",
            "--hook-log-output",
        ]);
        let engine = config.engine_config();
        assert_eq!(engine.nb_workers, 4);
        assert_eq!(engine.hook_timeout, Duration::from_secs(30));
        assert_eq!(engine.log_dir, Some(PathBuf::from("/var/log/whd")));
        assert!(engine.log_output);
    }

    #[test]
    fn unsupported_options_are_rejected() {
        assert_matches!(
            parse(&["--tls-domain", "example.com"]).validate(),
            Err(ConfigError::AcmeUnsupported)
        );
        assert_matches!(
            parse(&["--trust-store-file", "keys.pem"]).validate(),
            Err(ConfigError::TrustStoreUnsupported)
        );
        assert_matches!(
            parse(&["--nb-workers", "0"]).validate(),
            Err(ConfigError::NoWorkers)
        );
    }

    #[test]
    fn log_filter_covers_workspace_crates() {
        let config = parse(&["--log-level", "debug"]);
        assert!(config.log_filter().contains("whd_core=debug"));
        assert!(config.log_filter().contains("tower_http=debug"));
    }

    #[test]
    fn invalid_log_level_is_a_parse_error() {
        assert!(ServerConfig::try_parse_from(["whd", "--log-level", "trace"]).is_err());
    }
}
