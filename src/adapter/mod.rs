//! Direct WhatsApp client adapter.
//!
//! The protocol socket itself lives behind the [`ClientSession`] trait;
//! this module owns everything the pipeline relies on: session lifecycle
//! with capped reconnect backoff, auth wipe on terminal logout, self-echo
//! deduplication, linked-identifier resolution, thumbnail extraction with
//! media-download fallback, and envelope production onto the channel the
//! event router consumes.

use crate::envelope::{self, EventEnvelope};
use crate::handlers::message::LidLookup;
use crate::identity::normalize_phone;
use crate::store::MediaStore;
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const RECONNECT_MAX_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Events a protocol session emits toward the adapter.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A raw event envelope (message, chat, contact, group, ...).
    Envelope(EventEnvelope),
    /// Raw connection-state string from the socket.
    Connection { raw_state: String },
    /// Pairing QR payload.
    Qr { data: String },
    /// The session learned (or confirmed) the owner's phone number.
    Owner { phone: String },
    /// Terminal logout: auth material must be wiped.
    LoggedOut,
}

/// Protocol socket abstraction. Implementations own the wire details;
/// the adapter owns the interface guarantees consumed by the pipeline.
#[async_trait]
pub trait ClientSession: Send + Sync {
    /// Run the socket until it closes, emitting events. An `Err` return
    /// triggers the adapter's reconnect policy; `Ok` is a clean shutdown.
    async fn run(&self, events: mpsc::Sender<ClientEvent>) -> Result<()>;

    fn owner_phone(&self) -> Option<String>;

    /// Send a text message. Returns the upstream message id.
    async fn send_text(&self, to: &str, body: &str) -> Result<String>;

    /// Send a media message. Returns the upstream message id.
    async fn send_media(
        &self,
        to: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        caption: Option<&str>,
    ) -> Result<String>;

    /// Download the full media payload referenced by message `data`.
    async fn download_media(&self, data: &Value) -> Result<Vec<u8>>;

    /// Remove on-disk auth material after a terminal logout.
    async fn wipe_auth(&self) -> Result<()>;
}

pub struct ClientAdapter {
    session: Arc<dyn ClientSession>,
    envelopes: mpsc::Sender<EventEnvelope>,
    media: Arc<MediaStore>,
    /// Linked identifier digits → phone digits, learned from contact
    /// events and per-message hints.
    lid_map: RwLock<HashMap<String, String>>,
    owner: watch::Sender<Option<String>>,
}

impl ClientAdapter {
    pub fn new(
        session: Arc<dyn ClientSession>,
        envelopes: mpsc::Sender<EventEnvelope>,
        media: Arc<MediaStore>,
    ) -> Self {
        let (owner, _) = watch::channel(session.owner_phone().map(|p| normalize_phone(&p)));
        Self {
            session,
            envelopes,
            media,
            lid_map: RwLock::new(HashMap::new()),
            owner,
        }
    }

    /// Subscribe to owner-phone discovery.
    pub fn owner_watch(&self) -> watch::Receiver<Option<String>> {
        self.owner.subscribe()
    }

    pub fn owner_phone(&self) -> Option<String> {
        self.owner.borrow().clone()
    }

    pub async fn send_text(&self, to: &str, body: &str) -> Result<String> {
        self.session.send_text(to, body).await
    }

    pub async fn send_media(
        &self,
        to: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        caption: Option<&str>,
    ) -> Result<String> {
        self.session.send_media(to, bytes, mime_type, caption).await
    }

    /// Run the session with capped exponential reconnect. Returns when
    /// the session shuts down cleanly, logs out terminally, or the
    /// retry budget is exhausted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let (tx, rx) = mpsc::channel::<ClientEvent>(64);
            let session = self.session.clone();
            let run_handle = tokio::spawn(async move { session.run(tx).await });

            let terminal = self.consume_events(rx, &mut shutdown).await;
            let run_result = run_handle.await;

            if terminal || *shutdown.borrow() {
                return Ok(());
            }

            match run_result {
                Ok(Ok(())) => {
                    info!("adapter.session_closed");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    attempt += 1;
                    if attempt >= RECONNECT_MAX_ATTEMPTS {
                        warn!(error = %e, attempt, "adapter.reconnect_exhausted");
                        self.emit_connection("disconnected").await;
                        anyhow::bail!("client session failed after {attempt} attempts: {e}");
                    }
                    let delay = reconnect_delay(attempt);
                    warn!(error = %e, attempt, delay_secs = delay.as_secs(), "adapter.reconnecting");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
                Err(join_err) => {
                    anyhow::bail!("client session task panicked: {join_err}");
                }
            }
        }
    }

    /// Drain session events. Returns true on terminal logout.
    async fn consume_events(
        &self,
        mut rx: mpsc::Receiver<ClientEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = shutdown.changed() => return false,
            };
            let Some(event) = event else {
                return false;
            };
            match event {
                ClientEvent::Envelope(env) => {
                    if let Some(env) = self.prepare_envelope(env) {
                        if self.envelopes.send(env).await.is_err() {
                            // Router side is gone; shutting down.
                            return false;
                        }
                    }
                }
                ClientEvent::Connection { raw_state } => {
                    self.emit_connection(&raw_state).await;
                }
                ClientEvent::Qr { data } => {
                    let env = EventEnvelope {
                        event: "QRCODE_UPDATED".into(),
                        data: json!({ "qrcode": data }),
                        source: "client".into(),
                    };
                    let _ = self.envelopes.send(env).await;
                }
                ClientEvent::Owner { phone } => {
                    let digits = normalize_phone(&phone);
                    if !digits.is_empty() {
                        self.owner.send_replace(Some(digits));
                    }
                }
                ClientEvent::LoggedOut => {
                    warn!("adapter.logged_out");
                    if let Err(e) = self.session.wipe_auth().await {
                        warn!(error = %e, "adapter.auth_wipe_failed");
                    }
                    let env = EventEnvelope {
                        event: "LOGOUT_INSTANCE".into(),
                        data: json!({}),
                        source: "client".into(),
                    };
                    let _ = self.envelopes.send(env).await;
                    return true;
                }
            }
        }
    }

    async fn emit_connection(&self, raw_state: &str) {
        let env = EventEnvelope {
            event: "CONNECTION_UPDATE".into(),
            data: json!({ "state": raw_state }),
            source: "client".into(),
        };
        let _ = self.envelopes.send(env).await;
    }

    /// Apply the interface guarantees to a raw envelope before it reaches
    /// the router. Returns `None` when the envelope must be dropped.
    fn prepare_envelope(&self, mut env: EventEnvelope) -> Option<EventEnvelope> {
        if env.event == "CONTACTS_UPSERT" || env.event == "CONTACTS_UPDATE" {
            self.learn_lids(&env.data);
        }
        if env.event != "MESSAGES_UPSERT" {
            return Some(env);
        }

        let data = env.data.clone();
        let remote = data
            .pointer("/key/remoteJid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // Self-echo dedup: chats with the owner's own number are dropped
        // before delivery.
        if let Some(owner) = self.owner_phone() {
            let digits = normalize_phone(remote.split('@').next().unwrap_or(&remote));
            if !digits.is_empty() && digits == owner {
                debug!("adapter.dropped_self_echo");
                return None;
            }
        }

        let content_owned = data.get("message").map(envelope::unwrap_content);

        // Broadcast channels carrying protocol-only payloads are noise.
        if remote.contains("@broadcast") {
            if content_owned.is_none_or(envelope::is_protocol_only) {
                debug!("adapter.dropped_broadcast_protocol");
                return None;
            }
        }

        // Surface linked-identifier resolutions in the payload so the
        // handler (and any downstream consumer) sees the phone form.
        if remote.contains("@lid") {
            let lid = normalize_phone(remote.split('@').next().unwrap_or_default());
            if data.pointer("/key/senderPn").is_none() {
                if let Some(phone) = self.resolve_lid_digits(&lid) {
                    if let Some(key) = env.data.pointer_mut("/key") {
                        key["senderPn"] = Value::String(phone);
                    }
                }
            }
        }
        if let Some(participant) = data.pointer("/key/participant").and_then(Value::as_str) {
            if participant.contains("@lid") && data.pointer("/key/participantPn").is_none() {
                let lid = normalize_phone(participant.split('@').next().unwrap_or_default());
                if let Some(phone) = self.resolve_lid_digits(&lid) {
                    if let Some(key) = env.data.pointer_mut("/key") {
                        key["participantPn"] = Value::String(phone);
                    }
                }
            }
        }

        // Media: always expose the inline thumbnail; fetch the full blob
        // in the background with the thumbnail as the stored fallback.
        if let Some(content) = content_owned {
            if let Some(thumb) = envelope::jpeg_thumbnail(content) {
                if env.data.is_object() {
                    env.data["thumbnail"] =
                        Value::String(format!("data:image/jpeg;base64,{thumb}"));
                }
            }
            if envelope::classify(content).is_media() {
                self.spawn_media_download(&env.data, content);
            }
        }

        Some(env)
    }

    fn spawn_media_download(&self, data: &Value, content: &Value) {
        let message_id = data
            .pointer("/key/id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if message_id.is_empty() {
            return;
        }
        let mime = envelope::media_mime(content)
            .unwrap_or("application/octet-stream")
            .to_string();
        let thumbnail = envelope::jpeg_thumbnail(content).map(str::to_string);
        let session = self.session.clone();
        let media = self.media.clone();
        let data = data.clone();
        tokio::spawn(async move {
            match session.download_media(&data).await {
                Ok(bytes) => {
                    if media.save(&message_id, &bytes, &mime).is_none() {
                        debug!(message_id, "adapter.media_rejected");
                    }
                }
                Err(e) => {
                    debug!(message_id, error = %e, "adapter.media_download_failed");
                    // Fallback: keep at least the thumbnail bytes.
                    if let Some(thumb) = thumbnail {
                        if let Ok(bytes) =
                            base64::engine::general_purpose::STANDARD.decode(thumb.as_bytes())
                        {
                            media.save(&message_id, &bytes, "image/jpeg");
                        }
                    }
                }
            }
        });
    }

    /// Learn lid→phone pairs from contact sync events.
    fn learn_lids(&self, data: &Value) {
        let entries = match data {
            Value::Array(entries) => entries.as_slice(),
            Value::Object(_) => std::slice::from_ref(data),
            _ => return,
        };
        let mut map = self.lid_map.write();
        for entry in entries {
            let lid = entry
                .get("lid")
                .and_then(Value::as_str)
                .map(normalize_phone);
            let phone = entry
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.contains("@lid"))
                .map(|id| normalize_phone(id.split('@').next().unwrap_or(id)));
            if let (Some(lid), Some(phone)) = (lid, phone) {
                if !lid.is_empty() && !phone.is_empty() {
                    map.insert(lid, phone);
                }
            }
        }
    }

    fn resolve_lid_digits(&self, lid: &str) -> Option<String> {
        self.lid_map.read().get(lid).cloned()
    }
}

impl LidLookup for ClientAdapter {
    fn phone_for_lid(&self, lid: &str) -> Option<String> {
        self.resolve_lid_digits(&normalize_phone(lid))
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE_DELAY.saturating_mul(1 << (attempt - 1).min(6));
    exp.min(RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Scripted session: plays a fixed event sequence per run() call.
    struct ScriptedSession {
        runs: Mutex<Vec<Vec<ClientEvent>>>,
        results: Mutex<Vec<Result<()>>>,
        media_bytes: Option<Vec<u8>>,
        wiped: Mutex<bool>,
    }

    impl ScriptedSession {
        fn new(runs: Vec<Vec<ClientEvent>>, results: Vec<Result<()>>) -> Self {
            Self {
                runs: Mutex::new(runs),
                results: Mutex::new(results),
                media_bytes: None,
                wiped: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl ClientSession for ScriptedSession {
        async fn run(&self, events: mpsc::Sender<ClientEvent>) -> Result<()> {
            let script = {
                let mut runs = self.runs.lock();
                if runs.is_empty() {
                    Vec::new()
                } else {
                    runs.remove(0)
                }
            };
            for event in script {
                let _ = events.send(event).await;
            }
            let mut results = self.results.lock();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }

        fn owner_phone(&self) -> Option<String> {
            Some("972500000099".into())
        }

        async fn send_text(&self, _to: &str, _body: &str) -> Result<String> {
            Ok("SENT-1".into())
        }

        async fn send_media(
            &self,
            _to: &str,
            _bytes: Vec<u8>,
            _mime: &str,
            _caption: Option<&str>,
        ) -> Result<String> {
            Ok("SENT-2".into())
        }

        async fn download_media(&self, _data: &Value) -> Result<Vec<u8>> {
            self.media_bytes
                .clone()
                .ok_or_else(|| anyhow::anyhow!("download unavailable"))
        }

        async fn wipe_auth(&self) -> Result<()> {
            *self.wiped.lock() = true;
            Ok(())
        }
    }

    fn adapter_with(
        session: Arc<ScriptedSession>,
        dir: &TempDir,
    ) -> (Arc<ClientAdapter>, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(64);
        let media =
            Arc::new(MediaStore::load(dir.path().join("media"), 10, 1024 * 1024).unwrap());
        (Arc::new(ClientAdapter::new(session, tx, media)), rx)
    }

    fn message_envelope(remote: &str, text: &str) -> EventEnvelope {
        EventEnvelope {
            event: "MESSAGES_UPSERT".into(),
            data: json!({
                "key": {"remoteJid": remote, "id": "M1"},
                "message": {"conversation": text}
            }),
            source: "client".into(),
        }
    }

    #[tokio::test]
    async fn self_echo_dropped() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(ScriptedSession::new(vec![], vec![]));
        let (adapter, _rx) = adapter_with(session, &dir);
        assert!(adapter
            .prepare_envelope(message_envelope("972500000099@s.whatsapp.net", "echo"))
            .is_none());
        assert!(adapter
            .prepare_envelope(message_envelope("972500000001@s.whatsapp.net", "real"))
            .is_some());
    }

    #[tokio::test]
    async fn broadcast_protocol_only_dropped() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(ScriptedSession::new(vec![], vec![]));
        let (adapter, _rx) = adapter_with(session, &dir);
        let env = EventEnvelope {
            event: "MESSAGES_UPSERT".into(),
            data: json!({
                "key": {"remoteJid": "1234567890@broadcast", "id": "B1"},
                "message": {"senderKeyDistributionMessage": {}}
            }),
            source: "client".into(),
        };
        assert!(adapter.prepare_envelope(env).is_none());

        // A broadcast with real content passes through.
        let env = message_envelope("1234567890@broadcast", "announcement");
        assert!(adapter.prepare_envelope(env).is_some());
    }

    #[tokio::test]
    async fn lid_resolution_injected_from_learned_map() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(ScriptedSession::new(vec![], vec![]));
        let (adapter, _rx) = adapter_with(session, &dir);
        adapter.learn_lids(&json!([
            {"id": "972500000005@s.whatsapp.net", "lid": "111222333444555@lid"}
        ]));

        let env = message_envelope("111222333444555@lid", "hello");
        let prepared = adapter.prepare_envelope(env).unwrap();
        assert_eq!(
            prepared.data.pointer("/key/senderPn").and_then(Value::as_str),
            Some("972500000005")
        );
    }

    #[tokio::test]
    async fn thumbnail_extracted_to_data_uri() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(ScriptedSession::new(vec![], vec![]));
        let (adapter, _rx) = adapter_with(session, &dir);
        let env = EventEnvelope {
            event: "MESSAGES_UPSERT".into(),
            data: json!({
                "key": {"remoteJid": "972500000001@s.whatsapp.net", "id": "M9"},
                "message": {"imageMessage": {
                    "mimetype": "image/jpeg",
                    "jpegThumbnail": "QUJDRA=="
                }}
            }),
            source: "client".into(),
        };
        let prepared = adapter.prepare_envelope(env).unwrap();
        assert_eq!(
            prepared.data.get("thumbnail").and_then(Value::as_str),
            Some("data:image/jpeg;base64,QUJDRA==")
        );
    }

    #[tokio::test]
    async fn media_download_failure_persists_thumbnail_fallback() {
        let dir = TempDir::new().unwrap();
        // download_media errors (media_bytes: None) → thumbnail persisted.
        let session = Arc::new(ScriptedSession::new(vec![], vec![]));
        let (adapter, _rx) = adapter_with(session, &dir);
        let env = EventEnvelope {
            event: "MESSAGES_UPSERT".into(),
            data: json!({
                "key": {"remoteJid": "972500000001@s.whatsapp.net", "id": "MEDIA1"},
                "message": {"imageMessage": {
                    "mimetype": "image/jpeg",
                    "jpegThumbnail": "QUJDRA=="
                }}
            }),
            source: "client".into(),
        };
        adapter.prepare_envelope(env).unwrap();
        // Wait for the spawned download task to run its fallback.
        for _ in 0..50 {
            if adapter.media.count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(adapter.media.count(), 1);
    }

    #[tokio::test]
    async fn logout_wipes_auth_and_stops() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(ScriptedSession::new(
            vec![vec![
                ClientEvent::Connection {
                    raw_state: "open".into(),
                },
                ClientEvent::LoggedOut,
            ]],
            vec![Ok(())],
        ));
        let (adapter, mut rx) = adapter_with(session.clone(), &dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        adapter.run(shutdown_rx).await.unwrap();

        assert!(*session.wiped.lock());
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, "CONNECTION_UPDATE");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, "LOGOUT_INSTANCE");
    }

    #[tokio::test]
    async fn owner_discovery_published() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(ScriptedSession::new(
            vec![vec![ClientEvent::Owner {
                phone: "+972 50-000-0099".into(),
            }]],
            vec![Ok(())],
        ));
        let (adapter, _rx) = adapter_with(session, &dir);
        let watch_rx = adapter.owner_watch();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        adapter.clone().run(shutdown_rx).await.unwrap();
        assert_eq!(watch_rx.borrow().as_deref(), Some("972500000099"));
    }

    #[test]
    fn reconnect_delays_double_and_cap() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(4), Duration::from_secs(8));
        assert_eq!(reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(reconnect_delay(12), Duration::from_secs(30));
    }
}
