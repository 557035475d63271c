//! Bounded per-source message history with a global cap, persisted as
//! `messages.json`.
//!
//! Each source keeps its newest messages first. When the global cap is
//! exceeded the globally oldest messages are evicted regardless of which
//! source owns them, and emptied sources are dropped from the map.
//! Mutations flip a dirty flag; a periodic loop flushes when dirty.

use super::{read_json, write_json_atomic};
use crate::envelope::NormalizedMessage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Bound on the set of own outgoing message ids kept for the
/// reply-mention predicate.
const OUTGOING_ID_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(flatten)]
    pub message: NormalizedMessage,
    #[serde(rename = "storedAt")]
    pub stored_at: String,
}

/// Summary row for the admin listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub source_id: String,
    pub message_count: usize,
    pub last_timestamp: String,
}

struct MessagesInner {
    by_source: HashMap<String, Vec<StoredMessage>>,
    outgoing_ids: VecDeque<String>,
    dirty: bool,
}

pub struct MessageStore {
    path: PathBuf,
    max_per_source: usize,
    max_total: usize,
    inner: Mutex<MessagesInner>,
}

impl MessageStore {
    pub fn load(path: PathBuf, max_per_source: usize, max_total: usize) -> Result<Self> {
        let by_source: HashMap<String, Vec<StoredMessage>> =
            read_json(&path)?.unwrap_or_default();
        // Seed the own-message set from persisted history so reply
        // detection survives a restart.
        let outgoing_ids = by_source
            .values()
            .flatten()
            .filter(|m| m.message.from_self)
            .map(|m| m.message.id.clone())
            .take(OUTGOING_ID_CAP)
            .collect();
        Ok(Self {
            path,
            max_per_source,
            max_total,
            inner: Mutex::new(MessagesInner {
                by_source,
                outgoing_ids,
                dirty: false,
            }),
        })
    }

    /// Record a message for a source, newest first, applying both caps.
    pub fn store(&self, source_id: &str, message: NormalizedMessage) {
        let mut inner = self.inner.lock();
        if message.from_self && !message.id.is_empty() {
            inner.outgoing_ids.push_front(message.id.clone());
            inner.outgoing_ids.truncate(OUTGOING_ID_CAP);
        }
        let list = inner.by_source.entry(source_id.to_string()).or_default();
        list.insert(
            0,
            StoredMessage {
                message,
                stored_at: Utc::now().to_rfc3339(),
            },
        );
        list.truncate(self.max_per_source);
        Self::evict_to_cap(&mut inner.by_source, self.max_total);
        inner.dirty = true;
    }

    fn evict_to_cap(by_source: &mut HashMap<String, Vec<StoredMessage>>, max_total: usize) {
        let mut total: usize = by_source.values().map(Vec::len).sum();
        while total > max_total {
            // Oldest message of each source is its last element.
            let victim = by_source
                .iter()
                .filter(|(_, list)| !list.is_empty())
                .min_by_key(|(_, list)| list.last().map(|m| ts_millis(m)).unwrap_or(0))
                .map(|(source, _)| source.clone());
            let Some(source) = victim else { break };
            if let Some(list) = by_source.get_mut(&source) {
                list.pop();
                if list.is_empty() {
                    by_source.remove(&source);
                }
            }
            total -= 1;
        }
    }

    /// A page of a source's history plus a has-more flag.
    pub fn get(&self, source_id: &str, limit: usize, offset: usize) -> (Vec<StoredMessage>, bool) {
        let inner = self.inner.lock();
        let Some(list) = inner.by_source.get(source_id) else {
            return (Vec::new(), false);
        };
        let page: Vec<StoredMessage> = list.iter().skip(offset).take(limit).cloned().collect();
        let has_more = offset + page.len() < list.len();
        (page, has_more)
    }

    pub fn total_count(&self) -> usize {
        self.inner.lock().by_source.values().map(Vec::len).sum()
    }

    pub fn sources_with_messages(&self) -> Vec<SourceSummary> {
        let inner = self.inner.lock();
        let mut summaries: Vec<SourceSummary> = inner
            .by_source
            .iter()
            .map(|(source_id, list)| SourceSummary {
                source_id: source_id.clone(),
                message_count: list.len(),
                last_timestamp: list
                    .first()
                    .map(|m| m.message.timestamp.clone())
                    .unwrap_or_default(),
            })
            .collect();
        summaries.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        summaries
    }

    /// Delete a source's history. Returns how many messages were removed.
    pub fn delete(&self, source_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner
            .by_source
            .remove(source_id)
            .map(|list| list.len())
            .unwrap_or(0);
        if removed > 0 {
            inner.dirty = true;
        }
        removed
    }

    /// Record the id of a message this instance sent (used by the
    /// reply-mention predicate even before the echo arrives).
    pub fn record_outgoing_id(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.outgoing_ids.push_front(id.to_string());
        inner.outgoing_ids.truncate(OUTGOING_ID_CAP);
    }

    /// Whether a message id was authored by this instance.
    pub fn is_own_message(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let inner = self.inner.lock();
        inner.outgoing_ids.iter().any(|known| known == id)
            || inner
                .by_source
                .values()
                .flatten()
                .any(|m| m.message.from_self && m.message.id == id)
    }

    /// Flush when dirty. Returns whether a write happened.
    pub fn flush_if_dirty(&self) -> Result<bool> {
        let snapshot = {
            let mut inner = self.inner.lock();
            if !inner.dirty {
                return Ok(false);
            }
            inner.dirty = false;
            inner.by_source.clone()
        };
        if let Err(e) = write_json_atomic(&self.path, &snapshot) {
            // Keep the dirty flag so the next tick retries.
            self.inner.lock().dirty = true;
            warn!(error = %e, "messages.flush_failed");
            return Err(e);
        }
        debug!(sources = snapshot.len(), "messages.flushed");
        Ok(true)
    }

    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.dirty = false;
            inner.by_source.clone()
        };
        write_json_atomic(&self.path, &snapshot)
    }
}

fn ts_millis(m: &StoredMessage) -> i64 {
    DateTime::parse_from_rfc3339(&m.message.timestamp)
        .or_else(|_| DateTime::parse_from_rfc3339(&m.stored_at))
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn msg(id: &str, ts_secs: i64, from_self: bool) -> NormalizedMessage {
        NormalizedMessage {
            id: id.into(),
            body: format!("body-{id}"),
            msg_type: "text".into(),
            has_media: false,
            media_type: None,
            media_handle: None,
            thumbnail: None,
            from_self,
            timestamp: DateTime::<Utc>::from_timestamp(ts_secs, 0)
                .unwrap()
                .to_rfc3339(),
            quoted_body: None,
        }
    }

    fn store(dir: &TempDir, per_source: usize, total: usize) -> MessageStore {
        MessageStore::load(dir.path().join("messages.json"), per_source, total).unwrap()
    }

    #[test]
    fn newest_first_per_source() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 10, 100);
        s.store("a", msg("1", 100, false));
        s.store("a", msg("2", 200, false));
        let (page, has_more) = s.get("a", 10, 0);
        assert_eq!(page[0].message.id, "2");
        assert_eq!(page[1].message.id, "1");
        assert!(!has_more);
    }

    #[test]
    fn per_source_cap_truncates_oldest() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 3, 100);
        for i in 0..5 {
            s.store("a", msg(&format!("{i}"), i, false));
        }
        let (page, _) = s.get("a", 10, 0);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].message.id, "4");
        assert_eq!(page[2].message.id, "2");
    }

    #[test]
    fn global_cap_evicts_globally_oldest() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 10, 4);
        s.store("old", msg("o1", 10, false));
        s.store("old", msg("o2", 20, false));
        s.store("new", msg("n1", 100, false));
        s.store("new", msg("n2", 200, false));
        assert_eq!(s.total_count(), 4);

        s.store("new", msg("n3", 300, false));
        assert_eq!(s.total_count(), 4);
        // The globally oldest (o1, ts=10) must be gone.
        let (old_page, _) = s.get("old", 10, 0);
        assert_eq!(old_page.len(), 1);
        assert_eq!(old_page[0].message.id, "o2");
    }

    #[test]
    fn eviction_removes_emptied_sources() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 10, 2);
        s.store("tiny", msg("t1", 10, false));
        s.store("big", msg("b1", 100, false));
        s.store("big", msg("b2", 200, false));
        let sources = s.sources_with_messages();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source_id, "big");
    }

    #[test]
    fn paging_and_has_more() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 10, 100);
        for i in 0..5 {
            s.store("a", msg(&format!("{i}"), i, false));
        }
        let (page, has_more) = s.get("a", 2, 0);
        assert_eq!(page.len(), 2);
        assert!(has_more);
        let (page, has_more) = s.get("a", 2, 4);
        assert_eq!(page.len(), 1);
        assert!(!has_more);
    }

    #[test]
    fn delete_returns_count() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 10, 100);
        s.store("a", msg("1", 1, false));
        s.store("a", msg("2", 2, false));
        assert_eq!(s.delete("a"), 2);
        assert_eq!(s.delete("a"), 0);
    }

    #[test]
    fn own_message_tracking() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 10, 100);
        s.record_outgoing_id("SENT1");
        assert!(s.is_own_message("SENT1"));
        assert!(!s.is_own_message("OTHER"));

        s.store("a", msg("ECHO1", 5, true));
        assert!(s.is_own_message("ECHO1"));
    }

    #[test]
    fn dirty_flush_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("messages.json");
        {
            let s = MessageStore::load(path.clone(), 10, 100).unwrap();
            assert!(!s.flush_if_dirty().unwrap());
            s.store("a", msg("1", 1, true));
            assert!(s.flush_if_dirty().unwrap());
            assert!(!s.flush_if_dirty().unwrap());
        }
        let s = MessageStore::load(path, 10, 100).unwrap();
        let (page, _) = s.get("a", 10, 0);
        assert_eq!(page.len(), 1);
        // Own-message set survives restart via persisted history.
        assert!(s.is_own_message("1"));
    }
}
