//! Central path resolution for Parley data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `PARLEY_DATA_DIR` env > `~/.parley`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = resolve_data_dir(explicit)?;
    let mut guard = DATA_DIR
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(dir.clone());
    Ok(dir)
}

fn resolve_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(env_val) = std::env::var("PARLEY_DATA_DIR") {
        return Ok(PathBuf::from(env_val));
    }
    dirs::home_dir()
        .map(|home| home.join(".parley"))
        .ok_or_else(|| anyhow::anyhow!("HOME directory not found"))
}

/// Current data directory, falling back to the default when not initialized.
pub fn data_dir() -> PathBuf {
    let current = DATA_DIR
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    current
        .or_else(|| resolve_data_dir(None).ok())
        .unwrap_or_else(|| PathBuf::from(".parley"))
}

pub fn db_path() -> PathBuf {
    data_dir().join("parley.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
