//! Configuration loading from environment variables.

use std::path::PathBuf;

/// Server configuration.
///
/// Every field can be set from the environment; CLI flags in `main.rs`
/// override the environment for the common ones.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the database plus the log/artifact tree.
    pub storage_path: PathBuf,
    /// REST listener port.
    pub http_port: u16,
    /// WebSocket listener port.
    pub ws_port: u16,
    /// tracing filter directive, e.g. "info" or "stepflow=debug".
    pub log_level: String,
    /// When true, `/api` requests must carry `Authorization: Bearer <auth_token>`.
    pub auth_enabled: bool,
    pub auth_token: Option<String>,
    pub max_concurrent_executions: usize,
    /// Lines longer than this are split; the first chunk is flagged truncated.
    pub max_line_bytes: usize,
    /// Applied when a request carries no timeout. None disables the default.
    pub default_timeout_seconds: Option<u64>,
    /// Declared artifacts larger than this are rejected with a warning.
    pub max_artifact_bytes: u64,
    /// Permissive CORS + bind on all interfaces.
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./storage"),
            http_port: 8080,
            ws_port: 8765,
            log_level: "info".to_string(),
            auth_enabled: false,
            auth_token: None,
            max_concurrent_executions: 500,
            max_line_bytes: 64 * 1024,
            default_timeout_seconds: None,
            max_artifact_bytes: 100 * 1024 * 1024,
            dev_mode: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `STORAGE_PATH` (./storage)
    /// - `HTTP_PORT` (8080), `WS_PORT` (8765)
    /// - `LOG_LEVEL` (info)
    /// - `AUTH_ENABLED` (false), `AUTH_TOKEN`
    /// - `MAX_CONCURRENT_EXECUTIONS` (500)
    /// - `MAX_LINE_BYTES` (65536)
    /// - `DEFAULT_EXECUTION_TIMEOUT_SECONDS` (unset = no default timeout)
    /// - `MAX_ARTIFACT_BYTES` (104857600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let storage_path = std::env::var("STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_path);

        let http_port = parse_var("HTTP_PORT", defaults.http_port)?;
        let ws_port = parse_var("WS_PORT", defaults.ws_port)?;
        if http_port == ws_port {
            return Err(ConfigError::Invalid(
                "WS_PORT",
                "must differ from HTTP_PORT",
            ));
        }

        let log_level =
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let auth_enabled = match std::env::var("AUTH_ENABLED") {
            Ok(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => return Err(ConfigError::Invalid("AUTH_ENABLED", "must be true or false")),
            },
            Err(_) => false,
        };
        let auth_token = std::env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty());
        if auth_enabled && auth_token.is_none() {
            return Err(ConfigError::Invalid(
                "AUTH_TOKEN",
                "required when AUTH_ENABLED is true",
            ));
        }

        let max_concurrent_executions =
            parse_var("MAX_CONCURRENT_EXECUTIONS", defaults.max_concurrent_executions)?;
        if max_concurrent_executions == 0 {
            return Err(ConfigError::Invalid(
                "MAX_CONCURRENT_EXECUTIONS",
                "must be at least 1",
            ));
        }

        let max_line_bytes = parse_var("MAX_LINE_BYTES", defaults.max_line_bytes)?;
        if max_line_bytes < 512 {
            return Err(ConfigError::Invalid("MAX_LINE_BYTES", "must be at least 512"));
        }

        let default_timeout_seconds = match std::env::var("DEFAULT_EXECUTION_TIMEOUT_SECONDS") {
            Ok(v) => {
                let secs: u64 = v.parse().map_err(|_| {
                    ConfigError::Invalid(
                        "DEFAULT_EXECUTION_TIMEOUT_SECONDS",
                        "must be a positive integer",
                    )
                })?;
                if secs == 0 { None } else { Some(secs) }
            }
            Err(_) => None,
        };

        let max_artifact_bytes = parse_var("MAX_ARTIFACT_BYTES", defaults.max_artifact_bytes)?;

        Ok(Self {
            storage_path,
            http_port,
            ws_port,
            log_level,
            auth_enabled,
            auth_token,
            max_concurrent_executions,
            max_line_bytes,
            default_timeout_seconds,
            max_artifact_bytes,
            dev_mode: false,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_path.join("database").join("stepflow.db")
    }

    /// Per-execution log directories live under here.
    pub fn executions_dir(&self) -> PathBuf {
        self.storage_path.join("executions")
    }

    /// Ingested artifact files live under here.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.storage_path.join("artifacts")
    }

    /// Default sandbox root that request working directories must resolve into.
    pub fn workspace_dir(&self) -> PathBuf {
        self.storage_path.join("workspace")
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "could not be parsed")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
