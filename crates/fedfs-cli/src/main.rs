//! fedfs command-line tool.
//!
//! Opens the tree described by a config file, runs one command and flushes.
//!
//! Usage:
//!   fedfs mkroot Project
//!   fedfs mkdir -p /Project/docs/drafts
//!   echo hello | fedfs write /Project/docs/readme
//!   fedfs tree
//!
//! Without `--config`, `$XDG_CONFIG_HOME/fedfs/fedfs.toml` is used if it
//! exists; otherwise metadata lives in `$XDG_DATA_HOME/fedfs/tree.db`.

mod commands;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use fedfs_kernel::{FederatedFs, FsConfig};
use tracing_subscriber::{EnvFilter, fmt};

use commands::Command;

/// Inspect and edit a fedfs resource tree.
#[derive(Parser, Debug)]
#[command(name = "fedfs")]
#[command(about = "Inspect and edit a fedfs resource tree")]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    if let Some(db) = &config.metadata.path {
        if let Some(dir) = db.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }

    let fs = FederatedFs::open(&config).context("opening fedfs")?;
    tracing::debug!(?config, "opened");

    let stdin = io::stdin();
    let stdout = io::stdout();
    commands::run(&fs, args.command, &mut stdin.lock(), &mut stdout.lock())?;
    fs.flush()?;
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<FsConfig> {
    if let Some(path) = explicit {
        return Ok(FsConfig::load(path)?);
    }

    if let Some(path) = dirs::config_dir().map(|d| d.join("fedfs").join("fedfs.toml")) {
        if path.exists() {
            tracing::debug!(path = %path.display(), "using user config");
            return Ok(FsConfig::load(&path)?);
        }
    }

    let mut config = FsConfig::default();
    config.metadata.path = Some(default_metadata_path());
    Ok(config)
}

fn default_metadata_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("fedfs"))
        .unwrap_or_else(|| PathBuf::from(".fedfs"))
        .join("tree.db")
}
