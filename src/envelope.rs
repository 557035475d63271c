//! Event envelopes and the WhatsApp message content model.
//!
//! Upstream emitters deliver heterogeneous JSON; the content of a message
//! is a tagged union keyed by field name (`conversation`, `imageMessage`,
//! ...) that may nest inside wrapper layers (`ephemeralMessage`,
//! `viewOnceMessage`, `viewOnceMessageV2`, `documentWithCaptionMessage`).
//! This module unwraps and classifies that union without forcing the whole
//! payload through a rigid schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The normalized event object flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Canonical event name, e.g. `MESSAGES_UPSERT`.
    pub event: String,
    pub data: Value,
    /// Origin tag: `webhook`, `client`, or a caller-supplied label.
    #[serde(default)]
    pub source: String,
}

/// Wrapper layers, in unwrap order. Each wrapper's `message` field holds
/// the next level down.
const WRAPPER_KEYS: [&str; 4] = [
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "documentWithCaptionMessage",
];

/// Content keys that carry no user payload on their own.
const PROTOCOL_KEYS: [&str; 3] = [
    "protocolMessage",
    "senderKeyDistributionMessage",
    "messageContextInfo",
];

/// Classification of unwrapped message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Contact,
    Location,
    Reaction,
    Protocol,
    Unknown,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Contact => "contact",
            Self::Location => "location",
            Self::Reaction => "reaction",
            Self::Protocol => "protocol",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_media(self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document | Self::Sticker
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peel wrapper layers off message content. Depth is bounded by the
/// wrapper chain length, so a malicious payload cannot loop us.
pub fn unwrap_content(content: &Value) -> &Value {
    let mut current = content;
    for _ in 0..WRAPPER_KEYS.len() {
        let Some(obj) = current.as_object() else {
            break;
        };
        let mut unwrapped = None;
        for key in WRAPPER_KEYS {
            if let Some(inner) = obj.get(key).and_then(|w| w.get("message")) {
                unwrapped = Some(inner);
                break;
            }
        }
        match unwrapped {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}

/// Classify unwrapped content by its dominant key.
pub fn classify(content: &Value) -> MessageKind {
    let Some(obj) = content.as_object() else {
        return MessageKind::Unknown;
    };
    if obj.contains_key("conversation") || obj.contains_key("extendedTextMessage") {
        MessageKind::Text
    } else if obj.contains_key("imageMessage") {
        MessageKind::Image
    } else if obj.contains_key("videoMessage") {
        MessageKind::Video
    } else if obj.contains_key("audioMessage") {
        MessageKind::Audio
    } else if obj.contains_key("documentMessage") {
        MessageKind::Document
    } else if obj.contains_key("stickerMessage") {
        MessageKind::Sticker
    } else if obj.contains_key("contactMessage") || obj.contains_key("contactsArrayMessage") {
        MessageKind::Contact
    } else if obj.contains_key("locationMessage") || obj.contains_key("liveLocationMessage") {
        MessageKind::Location
    } else if obj.contains_key("reactionMessage") {
        MessageKind::Reaction
    } else if is_protocol_only(content) {
        MessageKind::Protocol
    } else {
        MessageKind::Unknown
    }
}

/// True when the only remaining keys are key-distribution / protocol
/// bookkeeping with no user payload.
pub fn is_protocol_only(content: &Value) -> bool {
    let Some(obj) = content.as_object() else {
        return false;
    };
    !obj.is_empty() && obj.keys().all(|k| PROTOCOL_KEYS.contains(&k.as_str()))
}

/// Extract the human-readable body of unwrapped content.
pub fn extract_body(content: &Value) -> String {
    if let Some(text) = content.get("conversation").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(text) = content
        .pointer("/extendedTextMessage/text")
        .and_then(Value::as_str)
    {
        return text.to_string();
    }
    for media in ["imageMessage", "videoMessage", "documentMessage"] {
        if let Some(caption) = content
            .get(media)
            .and_then(|m| m.get("caption"))
            .and_then(Value::as_str)
        {
            return caption.to_string();
        }
    }
    if let Some(name) = content
        .pointer("/documentMessage/fileName")
        .and_then(Value::as_str)
    {
        return name.to_string();
    }
    if let Some(reaction) = content
        .pointer("/reactionMessage/text")
        .and_then(Value::as_str)
    {
        return reaction.to_string();
    }
    if let Some(display) = content
        .pointer("/contactMessage/displayName")
        .and_then(Value::as_str)
    {
        return display.to_string();
    }
    if let Some(location) = content.get("locationMessage") {
        let lat = location
            .get("degreesLatitude")
            .and_then(Value::as_f64)
            .unwrap_or_default();
        let lng = location
            .get("degreesLongitude")
            .and_then(Value::as_f64)
            .unwrap_or_default();
        return format!("{lat},{lng}");
    }
    String::new()
}

/// Locate `contextInfo` wherever the content variant carries it.
pub fn context_info(content: &Value) -> Option<&Value> {
    let obj = content.as_object()?;
    if let Some(info) = obj.get("contextInfo") {
        return Some(info);
    }
    obj.values().find_map(|v| v.get("contextInfo"))
}

/// Body of the message this content quotes, when present.
pub fn extract_quoted_body(content: &Value) -> Option<String> {
    let quoted = context_info(content)?.get("quotedMessage")?;
    let body = extract_body(unwrap_content(quoted));
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

/// MIME type of the media variant, when present.
pub fn media_mime(content: &Value) -> Option<&str> {
    for media in [
        "imageMessage",
        "videoMessage",
        "audioMessage",
        "documentMessage",
        "stickerMessage",
    ] {
        if let Some(mime) = content
            .get(media)
            .and_then(|m| m.get("mimetype"))
            .and_then(Value::as_str)
        {
            return Some(mime);
        }
    }
    None
}

/// Inline JPEG thumbnail (base64) carried by media variants.
pub fn jpeg_thumbnail(content: &Value) -> Option<&str> {
    for media in ["imageMessage", "videoMessage", "documentMessage"] {
        if let Some(thumb) = content
            .get(media)
            .and_then(|m| m.get("jpegThumbnail"))
            .and_then(Value::as_str)
        {
            if !thumb.is_empty() {
                return Some(thumb);
            }
        }
    }
    None
}

/// Convert the envelope's `messageTimestamp` (unix seconds as number or
/// string) to RFC 3339. Falls back to now.
pub fn timestamp_iso(data: &Value) -> String {
    let secs = match data.get("messageTimestamp") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    secs.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// Derived artifact of the message handler, persisted into the history
/// store and replayed by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub id: String,
    pub body: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub has_media: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub from_self: bool,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted_body: Option<String>,
}

impl NormalizedMessage {
    /// Build a normalized message from envelope `data` whose content has
    /// already been unwrapped.
    pub fn from_event_data(data: &Value, content: &Value, from_self: bool) -> Self {
        let kind = classify(content);
        let id = data
            .pointer("/key/id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            id,
            body: extract_body(content),
            msg_type: kind.as_str().to_string(),
            has_media: kind.is_media(),
            media_type: kind.is_media().then(|| kind.as_str().to_string()),
            media_handle: data
                .get("mediaHandle")
                .and_then(Value::as_str)
                .map(str::to_string),
            thumbnail: data
                .get("thumbnail")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| jpeg_thumbnail(content).map(str::to_string)),
            from_self,
            timestamp: timestamp_iso(data),
            quoted_body: extract_quoted_body(content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwrap_plain_content_is_identity() {
        let content = json!({"conversation": "hi"});
        assert_eq!(unwrap_content(&content), &content);
    }

    #[test]
    fn unwrap_ephemeral_layer() {
        let content = json!({
            "ephemeralMessage": {"message": {"conversation": "hidden"}}
        });
        assert_eq!(
            unwrap_content(&content),
            &json!({"conversation": "hidden"})
        );
    }

    #[test]
    fn unwrap_nested_wrappers() {
        let content = json!({
            "ephemeralMessage": {"message": {
                "viewOnceMessageV2": {"message": {
                    "imageMessage": {"caption": "once"}
                }}
            }}
        });
        let inner = unwrap_content(&content);
        assert_eq!(classify(inner), MessageKind::Image);
        assert_eq!(extract_body(inner), "once");
    }

    #[test]
    fn unwrap_document_with_caption() {
        let content = json!({
            "documentWithCaptionMessage": {"message": {
                "documentMessage": {"fileName": "report.pdf", "caption": "Q3"}
            }}
        });
        let inner = unwrap_content(&content);
        assert_eq!(classify(inner), MessageKind::Document);
        assert_eq!(extract_body(inner), "Q3");
    }

    #[test]
    fn classify_variants() {
        assert_eq!(classify(&json!({"conversation": "x"})), MessageKind::Text);
        assert_eq!(
            classify(&json!({"extendedTextMessage": {"text": "x"}})),
            MessageKind::Text
        );
        assert_eq!(classify(&json!({"imageMessage": {}})), MessageKind::Image);
        assert_eq!(classify(&json!({"stickerMessage": {}})), MessageKind::Sticker);
        assert_eq!(
            classify(&json!({"reactionMessage": {"text": "👍"}})),
            MessageKind::Reaction
        );
        assert_eq!(classify(&json!({"bogus": {}})), MessageKind::Unknown);
    }

    #[test]
    fn protocol_only_detected() {
        assert!(is_protocol_only(&json!({
            "senderKeyDistributionMessage": {"groupId": "g"}
        })));
        assert!(is_protocol_only(&json!({
            "protocolMessage": {}, "messageContextInfo": {}
        })));
        assert!(!is_protocol_only(&json!({
            "senderKeyDistributionMessage": {}, "conversation": "hi"
        })));
        assert!(!is_protocol_only(&json!({})));
    }

    #[test]
    fn body_from_caption() {
        let content = json!({"imageMessage": {"caption": "sunset"}});
        assert_eq!(extract_body(&content), "sunset");
    }

    #[test]
    fn body_from_location() {
        let content = json!({"locationMessage": {
            "degreesLatitude": 32.08, "degreesLongitude": 34.78
        }});
        assert_eq!(extract_body(&content), "32.08,34.78");
    }

    #[test]
    fn quoted_body_extracted() {
        let content = json!({"extendedTextMessage": {
            "text": "replying",
            "contextInfo": {"quotedMessage": {"conversation": "original"}}
        }});
        assert_eq!(extract_quoted_body(&content).as_deref(), Some("original"));
    }

    #[test]
    fn context_info_found_in_variant() {
        let content = json!({"extendedTextMessage": {
            "text": "x",
            "contextInfo": {"stanzaId": "abc"}
        }});
        let info = context_info(&content).unwrap();
        assert_eq!(info.get("stanzaId").and_then(Value::as_str), Some("abc"));
    }

    #[test]
    fn timestamp_accepts_number_and_string() {
        let iso = timestamp_iso(&json!({"messageTimestamp": 1700000000}));
        assert!(iso.starts_with("2023-11-14"));
        let iso = timestamp_iso(&json!({"messageTimestamp": "1700000000"}));
        assert!(iso.starts_with("2023-11-14"));
    }

    #[test]
    fn normalized_message_from_data() {
        let data = json!({
            "key": {"remoteJid": "972500000001@s.whatsapp.net", "id": "MSG1"},
            "message": {"imageMessage": {"caption": "pic", "jpegThumbnail": "abcd"}},
            "messageTimestamp": 1700000000
        });
        let content = unwrap_content(data.get("message").unwrap());
        let msg = NormalizedMessage::from_event_data(&data, content, false);
        assert_eq!(msg.id, "MSG1");
        assert_eq!(msg.body, "pic");
        assert_eq!(msg.msg_type, "image");
        assert!(msg.has_media);
        assert_eq!(msg.thumbnail.as_deref(), Some("abcd"));
        assert!(!msg.from_self);
    }
}
