use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "bqbridge",
    version,
    about = "Local REST bridge for browsing and querying BigQuery"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short = 'c', long, env = "BQBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit debug diagnostics
    #[arg(short = 'v', long, env = "BQBRIDGE_VERBOSE")]
    pub verbose: bool,

    /// Disable credential masking in logs
    #[arg(long, env = "BQBRIDGE_SHOW_SECRETS")]
    pub show_secrets: bool,

    /// Port to listen on (default: 3002)
    #[arg(short = 'p', long, env = "PORT")]
    pub port: Option<u16>,

    /// Address to bind (default: 0.0.0.0)
    #[arg(long, env = "BQBRIDGE_HOST")]
    pub host: Option<String>,

    /// Directory holding the front-end files (default: working directory)
    #[arg(short = 's', long, env = "BQBRIDGE_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// BigQuery REST endpoint
    #[arg(long, env = "BQBRIDGE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Query timeout in seconds (default: 60)
    #[arg(short = 't', long, env = "BQBRIDGE_QUERY_TIMEOUT")]
    pub query_timeout: Option<u64>,
}
