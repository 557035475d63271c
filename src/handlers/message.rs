//! The message decision engine.
//!
//! For each message event: filter status broadcasts, resolve linked
//! identifiers to phone numbers, unwrap the content union, authorize the
//! sender against the allow-lists, persist the normalized message, run
//! the mention hook for groups, and forward through the dispatcher.
//! Every error becomes a typed result plus a stats side effect; nothing
//! escapes upward.

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::dispatch::{DispatchError, ForwardMeta, WebhookDispatcher};
use crate::envelope::{self, NormalizedMessage};
use crate::identity::{normalize_phone, parse_remote_address, ParsedSource, SourceType};
use crate::mention::{MentionDetector, MentionMatch};
use crate::router::RouteOutcome;
use crate::store::config::SELF_TYPE;
use crate::store::{ConfigStore, EventAction, MessageStore, StatField, StatsStore, StoredEvent};
use crate::util::truncate_with_ellipsis;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PREVIEW_CHARS: usize = 50;
const MENTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive destination failures that raise a warning alert.
const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Resolves a linked identifier to a phone number from session metadata.
/// The client adapter implements this; webhook-only deployments go
/// without.
pub trait LidLookup: Send + Sync {
    fn phone_for_lid(&self, lid: &str) -> Option<String>;
}

/// Mention-hook configuration, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct MentionConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub token: Option<String>,
    pub mentions_only: bool,
}

struct Authorization {
    allowed: bool,
    entity_type: Option<String>,
    entity_name: Option<String>,
    reason: Option<&'static str>,
}

pub struct MessageHandler {
    config: Arc<ConfigStore>,
    stats: Arc<StatsStore>,
    messages: Arc<MessageStore>,
    dispatcher: Arc<WebhookDispatcher>,
    alerts: Arc<AlertSink>,
    detector: MentionDetector,
    mention: MentionConfig,
    forward_outgoing: bool,
    forward_updates: bool,
    client: reqwest::Client,
    self_phone: RwLock<Option<String>>,
    lid_lookup: RwLock<Option<Arc<dyn LidLookup>>>,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        stats: Arc<StatsStore>,
        messages: Arc<MessageStore>,
        dispatcher: Arc<WebhookDispatcher>,
        alerts: Arc<AlertSink>,
        detector: MentionDetector,
        mention: MentionConfig,
        forward_outgoing: bool,
        forward_updates: bool,
    ) -> Self {
        Self {
            config,
            stats,
            messages,
            dispatcher,
            alerts,
            detector,
            mention,
            forward_outgoing,
            forward_updates,
            client: reqwest::Client::new(),
            self_phone: RwLock::new(None),
            lid_lookup: RwLock::new(None),
        }
    }

    /// Owner phone of the connected session, used for self-authorization
    /// and mention detection.
    pub fn set_self_phone(&self, phone: &str) {
        let digits = normalize_phone(phone);
        if !digits.is_empty() {
            *self.self_phone.write() = Some(digits);
        }
    }

    pub fn self_phone(&self) -> Option<String> {
        self.self_phone.read().clone()
    }

    pub fn set_lid_lookup(&self, lookup: Arc<dyn LidLookup>) {
        *self.lid_lookup.write() = Some(lookup);
    }

    /// Linked-identifier resolution chain: payload hint, adapter lookup,
    /// local contact index, then the raw identifier.
    fn resolve_lid(&self, lid: &str, payload_hint: Option<&str>) -> Option<String> {
        if let Some(hint) = payload_hint {
            let digits = normalize_phone(hint);
            if !digits.is_empty() {
                return Some(digits);
            }
        }
        if let Some(lookup) = self.lid_lookup.read().clone() {
            if let Some(phone) = lookup.phone_for_lid(lid) {
                let digits = normalize_phone(&phone);
                if !digits.is_empty() {
                    return Some(digits);
                }
            }
        }
        self.config.phone_for_linked_id(lid)
    }

    // ── Incoming messages ────────────────────────────────────

    pub async fn handle_upsert(&self, payload: &Value) -> RouteOutcome {
        let kind = "MESSAGES_UPSERT";
        let data = event_data(payload);

        let Some(remote) = data.pointer("/key/remoteJid").and_then(Value::as_str) else {
            return self.malformed(kind, "missing key.remoteJid");
        };

        let mut parsed = parse_remote_address(remote);
        if parsed.source_type == SourceType::Status {
            self.stats.increment(kind, StatField::Filtered);
            debug!("message.filtered_status_broadcast");
            return outcome(kind, "filtered", Some("status_broadcast"));
        }

        // Resolve linked identifiers before any comparison.
        let sender_hint = data
            .pointer("/key/senderPn")
            .or_else(|| data.get("senderPn"))
            .and_then(Value::as_str);
        if parsed.source_type == SourceType::Contact && parsed.is_linked_id {
            if let Some(phone) = self.resolve_lid(&normalize_phone(&parsed.source_id), sender_hint)
            {
                parsed.source_id = phone;
                parsed.is_linked_id = false;
            }
        }
        let mut participant_phone: Option<String> = None;
        if parsed.source_type == SourceType::Group {
            if let Some(participant) = data.pointer("/key/participant").and_then(Value::as_str) {
                let p = parse_remote_address(participant);
                if p.is_linked_id {
                    let hint = data
                        .pointer("/key/participantPn")
                        .and_then(Value::as_str)
                        .or(sender_hint);
                    participant_phone = self
                        .resolve_lid(&normalize_phone(&p.source_id), hint)
                        .or_else(|| Some(normalize_phone(&p.source_id)));
                } else {
                    participant_phone = Some(normalize_phone(&p.source_id));
                }
            }
        }

        let Some(raw_content) = data.get("message").filter(|m| m.is_object()) else {
            return self.malformed(kind, "missing message content");
        };
        let content = envelope::unwrap_content(raw_content);
        if envelope::is_protocol_only(content) {
            self.stats.increment(kind, StatField::Filtered);
            debug!("message.skipped_protocol_only");
            return outcome(kind, "filtered", Some("protocol_only"));
        }

        let push_name = data.get("pushName").and_then(Value::as_str);
        let auth = self.authorize(&parsed);
        if !auth.allowed {
            let reason = auth.reason.unwrap_or("not_allowed");
            self.stats.increment(kind, StatField::Filtered);
            self.log_message_event(
                kind,
                &parsed,
                push_name,
                None,
                content,
                EventAction::Filtered,
                Some(reason.to_string()),
                None,
            );
            info!(
                source = %parsed.source_id,
                source_type = %parsed.source_type,
                reason,
                "message.filtered"
            );
            return outcome(kind, "filtered", Some(reason));
        }

        let from_self = data
            .pointer("/key/fromMe")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let normalized = NormalizedMessage::from_event_data(data, content, from_self);
        self.messages.store(&parsed.source_id, normalized);

        // Mention hook: groups only, and only with a connected owner.
        if parsed.source_type == SourceType::Group && self.mention.enabled {
            if let Some(self_phone) = self.self_phone() {
                let hit = self.detector.detect(content, &self_phone, |id| {
                    self.messages.is_own_message(id)
                });
                if let Some(hit) = hit {
                    let delivered = self
                        .forward_mention(payload, &parsed, &auth, participant_phone.as_deref(), &hit)
                        .await;
                    self.log_message_event(
                        kind,
                        &parsed,
                        push_name,
                        auth.entity_type.as_deref(),
                        content,
                        EventAction::MentionForwarded,
                        (!delivered).then(|| "mention_delivery_failed".to_string()),
                        None,
                    );
                    if self.mention.mentions_only {
                        return outcome(kind, "mention_forwarded", None);
                    }
                }
            }
        }

        self.forward_allowed(kind, payload, &parsed, &auth, push_name, content)
            .await
    }

    // ── Outgoing messages ────────────────────────────────────

    pub async fn handle_outgoing(&self, payload: &Value) -> RouteOutcome {
        let kind = "SEND_MESSAGE";
        let data = event_data(payload);

        let Some(remote) = data.pointer("/key/remoteJid").and_then(Value::as_str) else {
            return self.malformed(kind, "missing key.remoteJid");
        };
        let parsed = parse_remote_address(remote);
        if parsed.source_type == SourceType::Status {
            self.stats.increment(kind, StatField::Filtered);
            return outcome(kind, "filtered", Some("status_broadcast"));
        }

        let Some(raw_content) = data.get("message").filter(|m| m.is_object()) else {
            return self.malformed(kind, "missing message content");
        };
        let content = envelope::unwrap_content(raw_content);

        // Authorization checks the recipient side.
        let auth = self.authorize(&parsed);
        if !auth.allowed {
            let reason = auth.reason.unwrap_or("not_allowed");
            self.stats.increment(kind, StatField::Filtered);
            self.log_message_event(
                kind,
                &parsed,
                None,
                None,
                content,
                EventAction::Filtered,
                Some(reason.to_string()),
                None,
            );
            return outcome(kind, "filtered", Some(reason));
        }

        let normalized = NormalizedMessage::from_event_data(data, content, true);
        self.messages.store(&parsed.source_id, normalized);

        if !self.forward_outgoing {
            self.log_message_event(
                kind,
                &parsed,
                None,
                auth.entity_type.as_deref(),
                content,
                EventAction::Stored,
                None,
                None,
            );
            return outcome(kind, "stored", None);
        }

        self.forward_allowed(kind, payload, &parsed, &auth, None, content)
            .await
    }

    // ── Message updates ──────────────────────────────────────

    pub async fn handle_update(&self, payload: &Value) -> RouteOutcome {
        let kind = "MESSAGES_UPDATE";
        let data = event_data(payload);

        let Some(remote) = data.pointer("/key/remoteJid").and_then(Value::as_str) else {
            return self.malformed(kind, "missing key.remoteJid");
        };
        let parsed = parse_remote_address(remote);

        if !self.forward_updates {
            self.stats
                .log_event(StoredEvent::new(kind, EventAction::Logged));
            return outcome(kind, "logged", None);
        }

        let auth = self.authorize(&parsed);
        if !auth.allowed {
            let reason = auth.reason.unwrap_or("not_allowed");
            self.stats.increment(kind, StatField::Filtered);
            return outcome(kind, "filtered", Some(reason));
        }

        self.forward_allowed(kind, payload, &parsed, &auth, None, &Value::Null)
            .await
    }

    // ── Shared steps ─────────────────────────────────────────

    fn authorize(&self, parsed: &ParsedSource) -> Authorization {
        match parsed.source_type {
            SourceType::Group => match self.config.find_group(&parsed.source_id) {
                Some(group) => Authorization {
                    allowed: true,
                    entity_type: Some(group.group_type),
                    entity_name: Some(group.name),
                    reason: None,
                },
                None => Authorization {
                    allowed: false,
                    entity_type: None,
                    entity_name: None,
                    reason: Some("not_in_allowed_groups"),
                },
            },
            SourceType::Contact => {
                let digits = normalize_phone(&parsed.source_id);
                if let Some(self_phone) = self.self_phone() {
                    if digits == self_phone {
                        return Authorization {
                            allowed: true,
                            entity_type: Some(SELF_TYPE.to_string()),
                            entity_name: Some("Self".to_string()),
                            reason: None,
                        };
                    }
                }
                match self.config.find_contact(&digits) {
                    Some(contact) => Authorization {
                        allowed: true,
                        entity_type: Some(contact.contact_type),
                        entity_name: Some(contact.name),
                        reason: None,
                    },
                    None => Authorization {
                        allowed: false,
                        entity_type: None,
                        entity_name: None,
                        reason: Some("not_in_allowed_contacts"),
                    },
                }
            }
            SourceType::Status | SourceType::Unknown => Authorization {
                allowed: false,
                entity_type: None,
                entity_name: None,
                reason: Some("unknown_source"),
            },
        }
    }

    /// Step 8: forward an allowed event. Allowed-but-nowhere-to-send is a
    /// successful terminal state, surfaced in stats so operators can see
    /// the coverage gap.
    async fn forward_allowed(
        &self,
        kind: &str,
        payload: &Value,
        parsed: &ParsedSource,
        auth: &Authorization,
        push_name: Option<&str>,
        content: &Value,
    ) -> RouteOutcome {
        let meta = ForwardMeta {
            source_id: parsed.source_id.clone(),
            source_type: parsed.source_type.as_str().to_string(),
            entity_type: auth.entity_type.clone(),
            event_kind: kind.to_string(),
        };

        if self
            .dispatcher
            .resolve_destination(meta.entity_type.as_deref())
            .is_none()
        {
            self.stats.increment(kind, StatField::Forwarded);
            self.log_message_event(
                kind,
                parsed,
                push_name,
                auth.entity_type.as_deref(),
                content,
                EventAction::Forwarded,
                Some("no_destination_for_type".to_string()),
                None,
            );
            debug!(
                entity_type = auth.entity_type.as_deref().unwrap_or_default(),
                "message.no_destination_for_type"
            );
            return outcome(kind, "forwarded", Some("no_destination_for_type"));
        }

        match self.dispatcher.forward(payload, &meta).await {
            Ok(success) => {
                self.stats.increment(kind, StatField::Forwarded);
                self.log_message_event(
                    kind,
                    parsed,
                    push_name,
                    auth.entity_type.as_deref(),
                    content,
                    EventAction::Forwarded,
                    None,
                    None,
                );
                info!(
                    destination = %success.destination,
                    attempt = success.attempt,
                    source = %parsed.source_id,
                    "message.forwarded"
                );
                outcome(kind, "forwarded", None)
            }
            Err(DispatchError::NoDestination) => {
                self.stats.increment(kind, StatField::Forwarded);
                self.log_message_event(
                    kind,
                    parsed,
                    push_name,
                    auth.entity_type.as_deref(),
                    content,
                    EventAction::Forwarded,
                    Some("no_destination_for_type".to_string()),
                    None,
                );
                outcome(kind, "forwarded", Some("no_destination_for_type"))
            }
            Err(e) => {
                self.stats.increment(kind, StatField::Failed);
                self.log_message_event(
                    kind,
                    parsed,
                    push_name,
                    auth.entity_type.as_deref(),
                    content,
                    EventAction::Failed,
                    None,
                    Some(e.to_string()),
                );
                warn!(error = %e, source = %parsed.source_id, "message.forward_failed");
                if e.consecutive_failures() == FAILURE_ALERT_THRESHOLD {
                    self.alerts
                        .send(
                            Alert::new(
                                AlertLevel::Warning,
                                "webhook.failing",
                                "Destination repeatedly failing",
                                &e.to_string(),
                            )
                            .detail("source", parsed.source_id.clone())
                            .detail(
                                "consecutiveFailures",
                                e.consecutive_failures().to_string(),
                            ),
                        )
                        .await;
                }
                RouteOutcome {
                    success: true,
                    event: kind.to_string(),
                    action: Some("failed".into()),
                    reason: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Independent POST to the mention destination. Returns delivery
    /// success; failures never affect the main pipeline.
    async fn forward_mention(
        &self,
        payload: &Value,
        parsed: &ParsedSource,
        auth: &Authorization,
        participant_phone: Option<&str>,
        hit: &MentionMatch,
    ) -> bool {
        let Some(url) = self.mention.webhook_url.clone() else {
            debug!("mention.no_destination");
            return false;
        };
        let body = json!({
            "mention": {
                "method": hit.method,
                "keywords": hit.keywords,
                "groupId": parsed.source_id,
                "groupName": auth.entity_name,
                "participant": participant_phone,
            },
            "event": payload,
        });
        let mut request = self
            .client
            .post(&url)
            .timeout(MENTION_TIMEOUT)
            .header("X-Filter-Source", "wagate")
            .header("X-Source-Id", parsed.source_id.as_str());
        if let Some(token) = &self.mention.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        match request.json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(group = %parsed.source_id, method = ?hit.method, "mention.forwarded");
                true
            }
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "mention.rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "mention.unreachable");
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_message_event(
        &self,
        kind: &str,
        parsed: &ParsedSource,
        push_name: Option<&str>,
        entity_type: Option<&str>,
        content: &Value,
        action: EventAction,
        reason: Option<String>,
        error: Option<String>,
    ) {
        let body = envelope::extract_body(content);
        let mut record = StoredEvent::new(kind, action);
        record.source = Some(parsed.source_id.clone());
        record.source_type = Some(parsed.source_type.as_str().to_string());
        record.sender_name = push_name.map(str::to_string);
        record.entity_type = entity_type.map(str::to_string);
        record.message_preview = truncate_with_ellipsis(&body, PREVIEW_CHARS);
        record.message_body = body;
        record.reason = reason;
        record.error = error;
        self.stats.log_event(record);
    }

    fn malformed(&self, kind: &str, detail: &str) -> RouteOutcome {
        let mut record = StoredEvent::new(kind, EventAction::Logged);
        record.error = Some(detail.to_string());
        self.stats.log_event(record);
        debug!(event = kind, detail, "message.malformed");
        outcome(kind, "logged", Some("malformed_payload"))
    }
}

fn event_data(payload: &Value) -> &Value {
    payload
        .get("data")
        .filter(|d| d.is_object())
        .unwrap_or(payload)
}

fn outcome(kind: &str, action: &str, reason: Option<&str>) -> RouteOutcome {
    RouteOutcome {
        success: true,
        event: kind.to_string(),
        action: Some(action.to_string()),
        reason: reason.map(str::to_string),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mention::MentionDetector;
    use crate::store::config::{Contact, Group};
    use tempfile::TempDir;

    struct Fixture {
        handler: MessageHandler,
        config: Arc<ConfigStore>,
        stats: Arc<StatsStore>,
        messages: Arc<MessageStore>,
        _dir: TempDir,
    }

    fn fixture(default_url: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(
            ConfigStore::load(
                dir.path().join("contacts.json"),
                default_url.map(str::to_string),
            )
            .unwrap(),
        );
        let stats = Arc::new(
            StatsStore::load(dir.path().join("stats.json"), 100, &["MESSAGES_UPSERT"]).unwrap(),
        );
        let messages =
            Arc::new(MessageStore::load(dir.path().join("messages.json"), 100, 5000).unwrap());
        let dispatcher = Arc::new(WebhookDispatcher::new(config.clone(), None, "wagate".into()));
        let alerts = Arc::new(AlertSink::new(None, None, "wagate".into(), stats.clone()));
        let handler = MessageHandler::new(
            config.clone(),
            stats.clone(),
            messages.clone(),
            dispatcher,
            alerts,
            MentionDetector::new(vec!["david".into()]),
            MentionConfig::default(),
            false,
            false,
        );
        Fixture {
            handler,
            config,
            stats,
            messages,
            _dir: dir,
        }
    }

    fn upsert_payload(remote: &str, text: &str) -> Value {
        json!({
            "key": {"remoteJid": remote, "id": "MSG-1", "fromMe": false},
            "pushName": "Someone",
            "message": {"conversation": text},
            "messageTimestamp": 1700000000
        })
    }

    #[tokio::test]
    async fn status_broadcast_filtered_without_ring_entry() {
        let f = fixture(None);
        let out = f
            .handler
            .handle_upsert(&upsert_payload("status@broadcast", "story"))
            .await;
        assert_eq!(out.action.as_deref(), Some("filtered"));
        assert_eq!(out.reason.as_deref(), Some("status_broadcast"));
        assert_eq!(f.stats.event_counters("MESSAGES_UPSERT").filtered, 1);
        let (events, _) = f.stats.recent(10, None, 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unknown_contact_filtered_with_reason() {
        let f = fixture(Some("https://ex/w"));
        let out = f
            .handler
            .handle_upsert(&upsert_payload("972500000001@s.whatsapp.net", "hi"))
            .await;
        assert_eq!(out.action.as_deref(), Some("filtered"));
        assert_eq!(out.reason.as_deref(), Some("not_in_allowed_contacts"));
        let (events, _) = f.stats.recent(10, None, 0);
        assert_eq!(events[0].reason.as_deref(), Some("not_in_allowed_contacts"));
        assert_eq!(events[0].sender_name.as_deref(), Some("Someone"));
        assert_eq!(events[0].message_body, "hi");
    }

    #[tokio::test]
    async fn protocol_only_content_skipped() {
        let f = fixture(None);
        let payload = json!({
            "key": {"remoteJid": "972500000001@s.whatsapp.net", "id": "M1"},
            "message": {"senderKeyDistributionMessage": {"groupId": "g"}}
        });
        let out = f.handler.handle_upsert(&payload).await;
        assert_eq!(out.reason.as_deref(), Some("protocol_only"));
        assert_eq!(f.stats.event_counters("MESSAGES_UPSERT").filtered, 1);
    }

    #[tokio::test]
    async fn self_phone_auto_authorized() {
        let f = fixture(None);
        f.handler.set_self_phone("972500000099");
        let out = f
            .handler
            .handle_upsert(&upsert_payload("972500000099@s.whatsapp.net", "note"))
            .await;
        // Allowed with no destination anywhere: explicit success outcome.
        assert_eq!(out.action.as_deref(), Some("forwarded"));
        assert_eq!(out.reason.as_deref(), Some("no_destination_for_type"));
        let (events, _) = f.stats.recent(10, None, 0);
        assert_eq!(events[0].entity_type.as_deref(), Some("SELF"));
    }

    #[tokio::test]
    async fn allowed_without_destination_counts_forwarded() {
        let f = fixture(None);
        f.config
            .add_contact(Contact {
                phone: "972500000004".into(),
                name: "Team Member".into(),
                contact_type: "WORK".into(),
                linked_id: None,
            })
            .unwrap();
        let out = f
            .handler
            .handle_upsert(&upsert_payload("972500000004@s.whatsapp.net", "hello"))
            .await;
        assert_eq!(out.action.as_deref(), Some("forwarded"));
        assert_eq!(out.reason.as_deref(), Some("no_destination_for_type"));
        assert_eq!(f.stats.event_counters("MESSAGES_UPSERT").forwarded, 1);
        assert_eq!(f.stats.event_counters("MESSAGES_UPSERT").failed, 0);
    }

    #[tokio::test]
    async fn allowed_message_stored_in_history() {
        let f = fixture(None);
        f.config
            .add_contact(Contact {
                phone: "972500000004".into(),
                name: "Team Member".into(),
                contact_type: "WORK".into(),
                linked_id: None,
            })
            .unwrap();
        f.handler
            .handle_upsert(&upsert_payload("972500000004@s.whatsapp.net", "hello"))
            .await;
        let (page, _) = f.messages.get("972500000004", 10, 0);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].message.body, "hello");
    }

    #[tokio::test]
    async fn group_allowed_via_suffix_normalization() {
        let f = fixture(None);
        f.config
            .add_group(Group {
                group_id: "120363000000000000".into(),
                name: "The Team".into(),
                group_type: "WORK".into(),
            })
            .unwrap();
        let out = f
            .handler
            .handle_upsert(&upsert_payload("120363000000000000@g.us", "standup"))
            .await;
        assert_eq!(out.action.as_deref(), Some("forwarded"));
        let (events, _) = f.stats.recent(10, None, 0);
        assert_eq!(events[0].entity_type.as_deref(), Some("WORK"));
        assert_eq!(events[0].source_type.as_deref(), Some("group"));
    }

    #[tokio::test]
    async fn lid_resolved_from_payload_hint() {
        let f = fixture(None);
        f.config
            .add_contact(Contact {
                phone: "972500000005".into(),
                name: "Linked Friend".into(),
                contact_type: "FRIEND".into(),
                linked_id: None,
            })
            .unwrap();
        let payload = json!({
            "key": {
                "remoteJid": "123456789012345678@lid",
                "id": "M1",
                "senderPn": "972500000005@s.whatsapp.net"
            },
            "message": {"conversation": "hi via lid"}
        });
        let out = f.handler.handle_upsert(&payload).await;
        assert_eq!(out.action.as_deref(), Some("forwarded"));
        let (events, _) = f.stats.recent(10, None, 0);
        assert_eq!(events[0].source.as_deref(), Some("972500000005"));
    }

    #[tokio::test]
    async fn lid_resolved_from_contact_index() {
        let f = fixture(None);
        f.config
            .add_contact(Contact {
                phone: "972500000006".into(),
                name: "Indexed Friend".into(),
                contact_type: "FRIEND".into(),
                linked_id: Some("123456789012345678".into()),
            })
            .unwrap();
        let payload = json!({
            "key": {"remoteJid": "123456789012345678@lid", "id": "M1"},
            "message": {"conversation": "hi"}
        });
        let out = f.handler.handle_upsert(&payload).await;
        assert_eq!(out.action.as_deref(), Some("forwarded"));
    }

    #[tokio::test]
    async fn unresolved_lid_falls_back_to_raw_and_matches_lid_field() {
        let f = fixture(None);
        // Contact allowed by its linked identifier value directly.
        f.config
            .add_contact(Contact {
                phone: "972500000007".into(),
                name: "Lid Person".into(),
                contact_type: "FRIEND".into(),
                linked_id: Some("999888777666555".into()),
            })
            .unwrap();
        let payload = json!({
            "key": {"remoteJid": "999888777666555@lid", "id": "M1"},
            "message": {"conversation": "hi"}
        });
        let out = f.handler.handle_upsert(&payload).await;
        // resolve_lid finds the phone via the contact index.
        assert_eq!(out.action.as_deref(), Some("forwarded"));
    }

    #[tokio::test]
    async fn outgoing_stored_not_forwarded_without_flag() {
        let f = fixture(Some("https://ex/w"));
        f.config
            .add_contact(Contact {
                phone: "972500000004".into(),
                name: "Team Member".into(),
                contact_type: "WORK".into(),
                linked_id: None,
            })
            .unwrap();
        let payload = json!({
            "key": {"remoteJid": "972500000004@s.whatsapp.net", "id": "OUT-1", "fromMe": true},
            "message": {"conversation": "my reply"}
        });
        let out = f.handler.handle_outgoing(&payload).await;
        assert_eq!(out.action.as_deref(), Some("stored"));
        let (page, _) = f.messages.get("972500000004", 10, 0);
        assert!(page[0].message.from_self);
        assert!(f.messages.is_own_message("OUT-1"));
    }

    #[tokio::test]
    async fn updates_logged_without_flag() {
        let f = fixture(Some("https://ex/w"));
        let payload = json!({
            "key": {"remoteJid": "972500000004@s.whatsapp.net", "id": "M1"},
            "update": {"status": 3}
        });
        let out = f.handler.handle_update(&payload).await;
        assert_eq!(out.action.as_deref(), Some("logged"));
    }

    #[tokio::test]
    async fn malformed_payload_logged_not_fatal() {
        let f = fixture(None);
        let out = f.handler.handle_upsert(&json!({"nonsense": true})).await;
        assert!(out.success);
        assert_eq!(out.reason.as_deref(), Some("malformed_payload"));
        let (events, _) = f.stats.recent(10, None, 0);
        assert!(events[0].error.is_some());
    }

    #[tokio::test]
    async fn preview_truncated_to_53_chars() {
        let f = fixture(Some("https://ex/w"));
        let long_body = "x".repeat(120);
        let out = f
            .handler
            .handle_upsert(&upsert_payload("972500000001@s.whatsapp.net", &long_body))
            .await;
        assert_eq!(out.action.as_deref(), Some("filtered"));
        let (events, _) = f.stats.recent(10, None, 0);
        assert_eq!(events[0].message_preview.chars().count(), 53);
        assert_eq!(events[0].message_body.len(), 120);
    }
}
