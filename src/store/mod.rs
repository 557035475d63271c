//! Durable stores: routing config, statistics, message history, media.
//!
//! Each store is a process-wide singleton behind a `parking_lot` lock:
//! writes are serialized, reads clone small snapshots. Every file write
//! goes through [`write_json_atomic`] so a crash leaves either the old or
//! the new file, never a truncated one.

pub mod config;
pub mod media;
pub mod messages;
pub mod stats;

pub use config::{ConfigStore, Contact, Group};
pub use media::MediaStore;
pub use messages::MessageStore;
pub use stats::{EventAction, StatField, StatsStore, StoredEvent};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Store-level error taxonomy, mapped to status codes at the admin
/// boundary (validation → 400, not-found → 404, duplicate → 409).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("{entity} already exists: {key}")]
    Duplicate { entity: String, key: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    pub fn duplicate(entity: &str, key: impl Into<String>) -> Self {
        Self::Duplicate {
            entity: entity.into(),
            key: key.into(),
        }
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`:
/// write to a temp file in the same directory, fsync, rename over the
/// target, then fsync the directory metadata.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize store")?;

    let parent = path
        .parent()
        .context("store path must have a parent directory")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create data directory: {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("store.json");
    let temp_path = parent.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    let mut temp_file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .with_context(|| format!("failed to create temp file: {}", temp_path.display()))?;
    temp_file
        .write_all(json.as_bytes())
        .context("failed to write temp store file")?;
    temp_file
        .sync_all()
        .context("failed to fsync temp store file")?;
    drop(temp_file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        anyhow::bail!("failed to atomically replace {}: {e}", path.display());
    }

    sync_directory(parent)?;
    Ok(())
}

/// Read and parse a JSON file. Missing file is not an error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("failed to fsync directory: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}
