//! Global data directory for persistent storage.
//!
//! Defaults to `~/.deskdrop/` but can be overridden via `--data-dir` or the
//! config file. Initialized once at startup via [`init`].

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the global data directory.
///
/// If `custom` is `Some`, uses that path. Otherwise falls back to
/// `~/.deskdrop/`. Fails when called twice or when no home directory exists.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .context("no home directory found")?
            .join(".deskdrop"),
    };
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data_dir::init() called more than once"))?;
    DATA_DIR
        .get()
        .map(PathBuf::as_path)
        .context("data directory vanished after init")
}
