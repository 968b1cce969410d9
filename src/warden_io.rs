use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

pub fn user_warden_dir_from(home_dir: &Path) -> PathBuf {
    home_dir.join(".claimwarden")
}

pub fn default_state_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("Could not find home directory")?;
    Ok(user_warden_dir_from(&home_dir).join("state"))
}

pub fn snapshot_path(state_dir: &Path) -> PathBuf {
    state_dir.join("claims.json")
}

pub fn log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("logs").join("claimwarden.log")
}

pub fn outbox_path(state_dir: &Path) -> PathBuf {
    state_dir.join("outbox.jsonl")
}

pub fn inbox_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("inbox")
}

pub fn processed_dir(state_dir: &Path) -> PathBuf {
    inbox_dir(state_dir).join("processed")
}

pub fn leases_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("leases")
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read file: {}", path.display()))
}

pub fn write_string(path: &Path, content: impl AsRef<str>) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, content.as_ref().as_bytes())
        .with_context(|| format!("failed to write file: {}", path.display()))
}

/// Writes `value` next to `path` and renames it into place, so readers never see a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}
