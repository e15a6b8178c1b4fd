//! CLI command definitions
//!
//! Defines the clap commands for the features CLI.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::common::config::DEFAULT_FIXTURES_DIR;

/// Server target that selects the in-process SDK
pub const LOOPBACK_SERVER: &str = "loopback";

#[derive(Subcommand)]
pub enum Commands {
    /// Run features against a server
    Run(RunArgs),

    /// List registered feature directories
    List,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Features to run as `<dir>[:<task-queue>]`; all features when empty
    pub features: Vec<String>,

    /// Server host:port, through the proxy when one is used
    #[arg(long, default_value = LOOPBACK_SERVER)]
    pub server: String,

    /// Server host:port that bypasses the proxy (defaults to --server)
    #[arg(long)]
    pub direct_server: Option<String>,

    /// Namespace to run in
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Client certificate (PEM), requires --client-key-path
    #[arg(long)]
    pub client_cert_path: Option<PathBuf>,

    /// Client private key (PEM), requires --client-cert-path
    #[arg(long)]
    pub client_key_path: Option<PathBuf>,

    /// Proxy control endpoint, e.g. http://127.0.0.1:7240/
    #[arg(long)]
    pub proxy_control_uri: Option<String>,

    /// Stream per-feature results to tcp://host:port or file:///path
    #[arg(long)]
    pub summary_uri: Option<String>,

    /// Root directory of the per-feature history fixtures
    #[arg(long, default_value = DEFAULT_FIXTURES_DIR)]
    pub fixtures_dir: PathBuf,

    /// Record each live history as the fixture for the current SDK version
    #[arg(long)]
    pub generate_history: bool,

    /// Log level for this crate when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
