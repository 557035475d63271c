//! Event statistics: per-kind counters, alert counters, and a bounded
//! newest-first ring of recent events, persisted as `stats.json`.
//!
//! Unknown event kinds are registered lazily on first increment, so the
//! counter map never gates what upstreams may send.

use super::{read_json, write_json_atomic};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Which counter of an event kind to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    Total,
    Filtered,
    Forwarded,
    Failed,
}

/// Outcome recorded on a ring-buffer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Forwarded,
    Filtered,
    Failed,
    Logged,
    Stored,
    MentionForwarded,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventCounters {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub filtered: u64,
    #[serde(default)]
    pub forwarded: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(rename = "lastReceived", default, skip_serializing_if = "Option::is_none")]
    pub last_received: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertCounters {
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(rename = "byLevel", default)]
    pub by_level: AlertLevelCounters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertLevelCounters {
    #[serde(default)]
    pub critical: u64,
    #[serde(default)]
    pub warning: u64,
    #[serde(default)]
    pub info: u64,
}

/// One entry of the recent-events ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    pub action: EventAction,
    #[serde(default)]
    pub message_preview: String,
    #[serde(default)]
    pub message_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StoredEvent {
    pub fn new(event: impl Into<String>, action: EventAction) -> Self {
        Self {
            id: String::new(),
            timestamp: String::new(),
            event: event.into(),
            source: None,
            source_type: None,
            sender_name: None,
            entity_type: None,
            action,
            message_preview: String::new(),
            message_body: String::new(),
            error: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionInfo {
    #[serde(rename = "startedAt", default)]
    started_at: String,
    #[serde(rename = "lastSaved", default)]
    last_saved: String,
}

/// Counters kept for readers of the pre-ring-buffer file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LegacyCounters {
    #[serde(rename = "totalMessages", default)]
    total_messages: u64,
    #[serde(rename = "filteredMessages", default)]
    filtered_messages: u64,
    #[serde(rename = "allowedMessages", default)]
    allowed_messages: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StatsDoc {
    #[serde(default)]
    events: HashMap<String, EventCounters>,
    #[serde(default)]
    alerts: AlertCounters,
    #[serde(rename = "recentEvents", default)]
    recent_events: Vec<StoredEvent>,
    #[serde(default)]
    session: SessionInfo,
    #[serde(default)]
    legacy: LegacyCounters,
}

/// Point-in-time summary for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_events: u64,
    pub forwarded: u64,
    pub filtered: u64,
    pub failed: u64,
    pub alerts: AlertCounters,
    pub events: HashMap<String, EventCounters>,
    pub session_started_at: String,
}

pub struct StatsStore {
    path: PathBuf,
    ring_limit: usize,
    inner: Mutex<StatsDoc>,
}

impl StatsStore {
    /// Load from disk, merging persisted counters with `seed_kinds` so
    /// newly-known event kinds appear with zeroed counters.
    pub fn load(path: PathBuf, ring_limit: usize, seed_kinds: &[&str]) -> Result<Self> {
        let mut doc: StatsDoc = read_json(&path)?.unwrap_or_default();
        for kind in seed_kinds {
            doc.events.entry((*kind).to_string()).or_default();
        }
        doc.session.started_at = Utc::now().to_rfc3339();
        doc.recent_events.truncate(ring_limit);
        Ok(Self {
            path,
            ring_limit,
            inner: Mutex::new(doc),
        })
    }

    pub fn save(&self) -> Result<()> {
        let doc = {
            let mut doc = self.inner.lock();
            doc.session.last_saved = Utc::now().to_rfc3339();
            doc.clone()
        };
        write_json_atomic(&self.path, &doc)?;
        debug!(path = %self.path.display(), "stats.saved");
        Ok(())
    }

    /// Bump a counter for an event kind, registering the kind lazily.
    pub fn increment(&self, event_kind: &str, field: StatField) {
        let mut doc = self.inner.lock();
        let doc = &mut *doc;
        let entry = doc.events.entry(event_kind.to_string()).or_default();
        match field {
            StatField::Total => {
                entry.total += 1;
                entry.last_received = Some(Utc::now().to_rfc3339());
                doc.legacy.total_messages += 1;
            }
            StatField::Filtered => {
                entry.filtered += 1;
                doc.legacy.filtered_messages += 1;
            }
            StatField::Forwarded => {
                entry.forwarded += 1;
                doc.legacy.allowed_messages += 1;
            }
            StatField::Failed => entry.failed += 1,
        }
    }

    /// Count an alert. `success` is `None` when no channel was configured
    /// (the level counter still moves).
    pub fn increment_alert(&self, level: &str, success: Option<bool>) {
        let mut doc = self.inner.lock();
        match level {
            "critical" => doc.alerts.by_level.critical += 1,
            "warning" => doc.alerts.by_level.warning += 1,
            _ => doc.alerts.by_level.info += 1,
        }
        match success {
            Some(true) => doc.alerts.sent += 1,
            Some(false) => doc.alerts.failed += 1,
            None => {}
        }
    }

    /// Push a record onto the ring (newest first), trimming to the limit.
    pub fn log_event(&self, mut record: StoredEvent) {
        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        if record.timestamp.is_empty() {
            record.timestamp = Utc::now().to_rfc3339();
        }
        let mut doc = self.inner.lock();
        doc.recent_events.insert(0, record);
        doc.recent_events.truncate(self.ring_limit);
    }

    /// Recent events, newest first, with optional kind filter and paging.
    /// Returns the page and the total count of matching records.
    pub fn recent(
        &self,
        limit: usize,
        event_filter: Option<&str>,
        offset: usize,
    ) -> (Vec<StoredEvent>, usize) {
        let doc = self.inner.lock();
        let matching: Vec<&StoredEvent> = doc
            .recent_events
            .iter()
            .filter(|e| event_filter.map_or(true, |f| e.event == f))
            .collect();
        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let doc = self.inner.lock();
        let mut total = 0;
        let mut forwarded = 0;
        let mut filtered = 0;
        let mut failed = 0;
        for counters in doc.events.values() {
            total += counters.total;
            forwarded += counters.forwarded;
            filtered += counters.filtered;
            failed += counters.failed;
        }
        StatsSnapshot {
            total_events: total,
            forwarded,
            filtered,
            failed,
            alerts: doc.alerts.clone(),
            events: doc.events.clone(),
            session_started_at: doc.session.started_at.clone(),
        }
    }

    /// Counters for one event kind (zeroed if never seen).
    pub fn event_counters(&self, event_kind: &str) -> EventCounters {
        self.inner
            .lock()
            .events
            .get(event_kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, limit: usize) -> StatsStore {
        StatsStore::load(dir.path().join("stats.json"), limit, &["MESSAGES_UPSERT"]).unwrap()
    }

    #[test]
    fn increment_lazily_registers_kind() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 100);
        s.increment("SOMETHING_NEW", StatField::Total);
        assert_eq!(s.event_counters("SOMETHING_NEW").total, 1);
    }

    #[test]
    fn total_sets_last_received() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 100);
        s.increment("MESSAGES_UPSERT", StatField::Total);
        assert!(s.event_counters("MESSAGES_UPSERT").last_received.is_some());
    }

    #[test]
    fn ring_buffer_bounded_newest_first() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 5);
        for i in 0..8 {
            let mut e = StoredEvent::new("MESSAGES_UPSERT", EventAction::Logged);
            e.message_body = format!("msg-{i}");
            s.log_event(e);
        }
        let (events, total) = s.recent(100, None, 0);
        assert_eq!(events.len(), 5);
        assert_eq!(total, 5);
        assert_eq!(events[0].message_body, "msg-7");
        assert_eq!(events[4].message_body, "msg-3");
    }

    #[test]
    fn ring_length_is_min_of_n_and_limit() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 10);
        for _ in 0..3 {
            s.log_event(StoredEvent::new("MESSAGES_UPSERT", EventAction::Logged));
        }
        let (events, _) = s.recent(100, None, 0);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn recent_filter_and_paging() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 100);
        for i in 0..6 {
            let kind = if i % 2 == 0 { "MESSAGES_UPSERT" } else { "CALL" };
            let mut e = StoredEvent::new(kind, EventAction::Logged);
            e.message_body = format!("m{i}");
            s.log_event(e);
        }
        let (page, total) = s.recent(2, Some("MESSAGES_UPSERT"), 1);
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message_body, "m2");
    }

    #[test]
    fn alert_counters_by_level() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 100);
        s.increment_alert("critical", Some(true));
        s.increment_alert("warning", Some(false));
        s.increment_alert("info", None);
        let snap = s.snapshot();
        assert_eq!(snap.alerts.sent, 1);
        assert_eq!(snap.alerts.failed, 1);
        assert_eq!(snap.alerts.by_level.critical, 1);
        assert_eq!(snap.alerts.by_level.warning, 1);
        assert_eq!(snap.alerts.by_level.info, 1);
    }

    #[test]
    fn save_and_reload_merges_new_kinds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        {
            let s = StatsStore::load(path.clone(), 100, &["MESSAGES_UPSERT"]).unwrap();
            s.increment("MESSAGES_UPSERT", StatField::Forwarded);
            s.save().unwrap();
        }
        let s = StatsStore::load(path, 100, &["MESSAGES_UPSERT", "BRAND_NEW_KIND"]).unwrap();
        assert_eq!(s.event_counters("MESSAGES_UPSERT").forwarded, 1);
        // Newly-known kind appears with zeroed counters.
        assert_eq!(s.event_counters("BRAND_NEW_KIND").total, 0);
        assert!(s.snapshot().events.contains_key("BRAND_NEW_KIND"));
    }

    #[test]
    fn snapshot_sums_across_kinds() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, 100);
        s.increment("MESSAGES_UPSERT", StatField::Total);
        s.increment("MESSAGES_UPSERT", StatField::Forwarded);
        s.increment("CALL", StatField::Total);
        s.increment("CALL", StatField::Filtered);
        let snap = s.snapshot();
        assert_eq!(snap.total_events, 2);
        assert_eq!(snap.forwarded, 1);
        assert_eq!(snap.filtered, 1);
    }
}
