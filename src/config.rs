use crate::backend::bigquery::{DEFAULT_ENDPOINT, DEFAULT_TOKEN_URI};
use crate::cli::Cli;
use crate::error::BridgeError;
use crate::router::RouterSettings;
use directories::ProjectDirs;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_BODY_LIMIT_MB: usize = 50;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 60;

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub body_limit_bytes: usize,
    pub endpoint: String,
    pub token_uri: String,
    pub query_timeout_secs: u64,
    pub verbose: bool,
    pub show_secrets: bool,
}

impl AppConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, BridgeError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| BridgeError::Config {
                message: format!("invalid listen address {}:{}: {}", self.host, self.port, e),
            })
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            static_dir: self.static_dir.clone(),
            body_limit_bytes: self.body_limit_bytes,
        }
    }
}

// --- TOML config file structs ---

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    #[serde(default)]
    server: TomlServer,
    #[serde(default)]
    bigquery: TomlBigQuery,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlServer {
    host: Option<String>,
    port: Option<u16>,
    static_dir: Option<PathBuf>,
    body_limit_mb: Option<usize>,
    verbose: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlBigQuery {
    endpoint: Option<String>,
    token_uri: Option<String>,
    query_timeout: Option<u64>,
}

/// Config path resolution result, explicit or auto-resolved.
struct ResolvedConfigPath {
    path: PathBuf,
    /// true if the user named the file via --config or BQBRIDGE_CONFIG
    explicit: bool,
}

/// Resolve the config file path: --config flag (or its env var) > platform default.
fn resolve_config_path(cli_config: Option<&PathBuf>) -> Option<ResolvedConfigPath> {
    if let Some(path) = cli_config {
        return Some(ResolvedConfigPath {
            path: path.clone(),
            explicit: true,
        });
    }
    ProjectDirs::from("", "", "bqbridge").map(|dirs| ResolvedConfigPath {
        path: dirs.config_dir().join("config.toml"),
        explicit: false,
    })
}

/// Read the TOML layer. No file at the platform default path means an empty
/// layer; no file at a path the user named is an error.
fn load_toml_config(resolved: Option<&ResolvedConfigPath>) -> Result<TomlConfig, BridgeError> {
    let Some(ResolvedConfigPath { path, explicit }) = resolved else {
        return Ok(TomlConfig::default());
    };

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            return Ok(TomlConfig::default());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BridgeError::Config {
                message: format!("config file not found: {}", path.display()),
            });
        }
        Err(e) => {
            return Err(BridgeError::Config {
                message: format!("cannot read config file {}: {}", path.display(), e),
            });
        }
    };

    toml::from_str(&content).map_err(|e| BridgeError::Config {
        message: format!("invalid config file {}: {}", path.display(), e),
    })
}

/// Build AppConfig from CLI args: CLI/ENV > TOML > built-in defaults.
pub fn load(cli: &Cli) -> Result<AppConfig, BridgeError> {
    let resolved_path = resolve_config_path(cli.config.as_ref());
    let toml_config = load_toml_config(resolved_path.as_ref())?;
    let server = toml_config.server;
    let bigquery = toml_config.bigquery;

    let body_limit_mb = server.body_limit_mb.unwrap_or(DEFAULT_BODY_LIMIT_MB);
    if body_limit_mb == 0 {
        return Err(BridgeError::Config {
            message: "body_limit_mb must be greater than zero".to_string(),
        });
    }
    let body_limit_bytes = body_limit_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| BridgeError::Config {
            message: format!("body_limit_mb is too large: {}", body_limit_mb),
        })?;

    let query_timeout_secs = cli
        .query_timeout
        .or(bigquery.query_timeout)
        .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);
    if query_timeout_secs == 0 {
        return Err(BridgeError::Config {
            message: "query timeout must be greater than zero".to_string(),
        });
    }

    Ok(AppConfig {
        host: cli
            .host
            .clone()
            .or(server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cli.port.or(server.port).unwrap_or(DEFAULT_PORT),
        static_dir: cli
            .static_dir
            .clone()
            .or(server.static_dir)
            .unwrap_or_else(|| PathBuf::from(".")),
        body_limit_bytes,
        endpoint: cli
            .endpoint
            .clone()
            .or(bigquery.endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        token_uri: bigquery
            .token_uri
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
        query_timeout_secs,
        verbose: cli.verbose || server.verbose.unwrap_or(false),
        show_secrets: cli.show_secrets,
    })
}
