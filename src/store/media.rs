//! Content-addressed media blob persistence with a count-bounded index,
//! persisted as `media_index.json` plus the blobs beside it.

use super::{read_json, write_json_atomic};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaEntry {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
    /// Millisecond timestamp used for eviction ordering.
    pub timestamp: i64,
}

/// Resolved blob info returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub file_path: PathBuf,
    pub mime_type: String,
    pub size: u64,
}

pub struct MediaStore {
    dir: PathBuf,
    index_path: PathBuf,
    max_files: usize,
    max_bytes: usize,
    counter: AtomicU64,
    index: Mutex<HashMap<String, MediaEntry>>,
}

impl MediaStore {
    pub fn load(dir: PathBuf, max_files: usize, max_bytes: usize) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let index_path = dir.join("media_index.json");
        let index: HashMap<String, MediaEntry> = read_json(&index_path)?.unwrap_or_default();
        Ok(Self {
            dir,
            index_path,
            max_files,
            max_bytes,
            counter: AtomicU64::new(Utc::now().timestamp_millis().max(0) as u64),
            index: Mutex::new(index),
        })
    }

    /// Persist a blob. Returns an opaque handle, or `None` when the blob
    /// is rejected (empty or oversize).
    pub fn save(&self, message_id: &str, bytes: &[u8], mime_type: &str) -> Option<String> {
        if bytes.is_empty() {
            debug!(message_id, "media.rejected_empty");
            return None;
        }
        if bytes.len() > self.max_bytes {
            warn!(
                message_id,
                size = bytes.len(),
                limit = self.max_bytes,
                "media.rejected_oversize"
            );
            return None;
        }

        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let safe_id: String = message_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let handle = format!("{safe_id}_{seq}");
        let file_name = format!("{handle}.{}", extension_for(mime_type));
        let file_path = self.dir.join(&file_name);

        if let Err(e) = fs::write(&file_path, bytes) {
            warn!(error = %e, "media.write_failed");
            return None;
        }

        let mut index = self.index.lock();
        index.insert(
            handle.clone(),
            MediaEntry {
                file_name,
                mime_type: mime_type.to_string(),
                size: bytes.len() as u64,
                // The sequence is seeded from wall-clock millis and strictly
                // increasing, so same-millisecond saves still order.
                timestamp: seq as i64,
            },
        );
        self.evict_locked(&mut index);
        if let Err(e) = write_json_atomic(&self.index_path, &*index) {
            warn!(error = %e, "media.index_write_failed");
        }
        debug!(handle = %handle, size = bytes.len(), "media.saved");
        Some(handle)
    }

    fn evict_locked(&self, index: &mut HashMap<String, MediaEntry>) {
        while index.len() > self.max_files {
            let Some(oldest) = index
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(handle, _)| handle.clone())
            else {
                break;
            };
            if let Some(entry) = index.remove(&oldest) {
                let _ = fs::remove_file(self.dir.join(&entry.file_name));
                debug!(handle = %oldest, "media.evicted");
            }
        }
    }

    pub fn get(&self, handle: &str) -> Option<MediaInfo> {
        let index = self.index.lock();
        let entry = index.get(handle)?;
        Some(MediaInfo {
            file_path: self.dir.join(&entry.file_name),
            mime_type: entry.mime_type.clone(),
            size: entry.size,
        })
    }

    pub fn count(&self) -> usize {
        self.index.lock().len()
    }
}

/// Explicit MIME→extension table. Parameters after `;` are ignored;
/// unknown MIMEs map to `bin`.
fn extension_for(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    match base {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "video/quicktime" => "mov",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "text/plain" => "txt",
        "text/vcard" => "vcf",
        _ => "bin",
    }
}
