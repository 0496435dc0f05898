//! Command-line arguments for the engine binary.
//!
//! The engine has no subcommand grammar; it is a long-running RPC server
//! driven over stdio by its parent process.

use std::path::PathBuf;

use clap::Parser;

/// Resumable HTTP and BitTorrent download engine, controlled over stdio.
#[derive(Debug, Parser)]
#[command(name = "fetchd", version, about)]
pub struct Args {
    /// Log filter for stderr output (error, warn, info, debug, trace, or
    /// an EnvFilter expression).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Engine database location. Defaults to fetchd.db in the download
    /// directory.
    #[arg(long)]
    pub database_path: Option<PathBuf>,

    /// Default download directory.
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Exit when the given process does (Unix only).
    #[arg(long, value_name = "PID")]
    pub stop_with_process: Option<u32>,
}
