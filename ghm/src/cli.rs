//! CLI argument parsing for GHM

use std::path::PathBuf;

use clap::Parser;

/// GPU Health Monitor - categorizes GPU diagnostic conditions and forwards health events
#[derive(Debug, Parser)]
#[command(name = "ghm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ghm/config.yaml")]
    pub config: PathBuf,

    /// Node name (overrides config and NODE_NAME env)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GHM_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GHM_LOG_JSON")]
    pub log_json: bool,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    pub verbose: bool,

    /// Query the diagnostic source once, print the conditions and exit
    #[arg(long)]
    pub once: bool,

    /// Diagnostic source address (overrides config)
    #[arg(long)]
    pub source_address: Option<String>,

    /// Resolve the source address through Kubernetes service discovery
    #[arg(long)]
    pub source_discovery: bool,

    /// Error-mapping table (overrides config)
    #[arg(long)]
    pub error_mapping_file: Option<PathBuf>,

    /// Default state file (overrides config)
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Metrics port (overrides config)
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Effective log level
    pub fn log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }
}
