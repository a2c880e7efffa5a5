//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`[session]` table for timeouts and limits)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::SessionConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "deskdrop.toml";

/// deskdrop - peer-to-peer screen sessions and file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to a config file (TOML).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for persistent data (peer id, logs).
    /// Defaults to ~/.deskdrop/
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Print the peer id other peers use to reach this machine.
    Id {
        /// Discard the current id and generate a new one.
        #[clap(long)]
        refresh: bool,
    },
    /// Connect two in-process peers and send a file from host to controller.
    Demo {
        /// File to send.
        #[clap(long)]
        file: PathBuf,
        /// Directory the received copy is written to.
        #[clap(long, default_value = ".")]
        out: PathBuf,
    },
}

/// Contents of the TOML config file. Every key is optional.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub session: SessionConfig,
}

/// Effective settings after merging the config file with the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub session: SessionConfig,
    pub command: Command,
}

impl Args {
    /// Parse the command line and merge it over the config file.
    ///
    /// A missing default config file is not an error; a missing file named
    /// by `--config` is.
    pub fn load() -> Result<Settings> {
        let cli = Args::parse();

        let file = match &cli.config {
            Some(path) => FileConfig::from_file(path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    FileConfig::from_file(&default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };

        Ok(cli.merge(file))
    }

    /// Merge file config with CLI args (CLI takes precedence).
    fn merge(self, file: FileConfig) -> Settings {
        Settings {
            data_dir: self.data_dir.or(file.data_dir),
            verbose: if self.verbose > 0 {
                self.verbose
            } else {
                file.verbose
            },
            session: file.session,
            command: self.command,
        }
    }
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }
}
