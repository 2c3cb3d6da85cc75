//! Command-line interface.
//!
//! The public surface is `-b/--bind` and `-w/--workers` plus the logging
//! switches. The hidden `--role`, `--namespace`, and `--registry` flags
//! are how the orchestrator configures the master and worker processes
//! it spawns from its own executable; they are not meant to be typed by
//! hand.

use crate::bind::BindAddress;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ws-fabric",
    author,
    version,
    about = "A multi-process websocket serving fabric"
)]
pub struct Args {
    /// Listening endpoint of the fabric.
    ///
    /// Accepts `unix:/absolute/path/<name>.(sock|socket)` or `HOST:PORT`.
    /// The master binds this address; worker `i` binds the namespaced
    /// variant (path splice, or port shifted by `i + 1`).
    #[arg(short = 'b', long, value_parser = parse_bind)]
    pub bind: BindAddress,

    /// Number of worker processes to supervise.
    #[arg(short = 'w', long, value_parser = parse_workers)]
    pub workers: usize,

    /// Increase diagnostic verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence stdout logging.
    #[arg(short, long)]
    pub quiet: bool,

    /// Also write logs to this file (daily rotation).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Role of a spawned child process.
    #[arg(long, hide = true, value_enum)]
    pub role: Option<ProcessRole>,

    /// Namespace of a spawned child process (`master`, `worker_0`, ...).
    #[arg(long, hide = true)]
    pub namespace: Option<String>,

    /// Worker registry file shared with the orchestrator.
    #[arg(long, hide = true)]
    pub registry: Option<PathBuf>,
}

/// What a spawned child process runs as.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Master,
    Worker,
}

fn parse_bind(value: &str) -> Result<BindAddress, String> {
    BindAddress::parse(value).map_err(|err| err.to_string())
}

fn parse_workers(value: &str) -> Result<usize, String> {
    let workers: usize = value
        .parse()
        .map_err(|_| format!("`{value}` is not a positive integer"))?;
    if workers == 0 {
        return Err("at least one worker is required".to_string());
    }
    Ok(workers)
}
