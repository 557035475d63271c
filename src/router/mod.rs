//! Table-driven event routing.
//!
//! The canonical event kinds form a closed enum; anything else falls
//! through to the generic handler and gets its counters registered
//! lazily, so unknown upstream kinds are observable without code changes.

use crate::handlers::connection::ConnectionHandler;
use crate::handlers::message::MessageHandler;
use crate::store::{EventAction, StatField, StatsStore, StoredEvent};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Canonical event kinds recognized by the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessagesUpsert,
    MessagesUpdate,
    MessagesDelete,
    MessagesSet,
    SendMessage,
    ConnectionUpdate,
    QrcodeUpdated,
    LogoutInstance,
    RemoveInstance,
    ApplicationStartup,
    ChatsUpsert,
    ChatsUpdate,
    ChatsDelete,
    ChatsSet,
    GroupsUpsert,
    GroupsUpdate,
    GroupParticipantsUpdate,
    ContactsUpsert,
    ContactsUpdate,
    ContactsSet,
    Call,
    LabelsAssociation,
    LabelsEdit,
    PresenceUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 24] = [
        Self::MessagesUpsert,
        Self::MessagesUpdate,
        Self::MessagesDelete,
        Self::MessagesSet,
        Self::SendMessage,
        Self::ConnectionUpdate,
        Self::QrcodeUpdated,
        Self::LogoutInstance,
        Self::RemoveInstance,
        Self::ApplicationStartup,
        Self::ChatsUpsert,
        Self::ChatsUpdate,
        Self::ChatsDelete,
        Self::ChatsSet,
        Self::GroupsUpsert,
        Self::GroupsUpdate,
        Self::GroupParticipantsUpdate,
        Self::ContactsUpsert,
        Self::ContactsUpdate,
        Self::ContactsSet,
        Self::Call,
        Self::LabelsAssociation,
        Self::LabelsEdit,
        Self::PresenceUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessagesUpsert => "MESSAGES_UPSERT",
            Self::MessagesUpdate => "MESSAGES_UPDATE",
            Self::MessagesDelete => "MESSAGES_DELETE",
            Self::MessagesSet => "MESSAGES_SET",
            Self::SendMessage => "SEND_MESSAGE",
            Self::ConnectionUpdate => "CONNECTION_UPDATE",
            Self::QrcodeUpdated => "QRCODE_UPDATED",
            Self::LogoutInstance => "LOGOUT_INSTANCE",
            Self::RemoveInstance => "REMOVE_INSTANCE",
            Self::ApplicationStartup => "APPLICATION_STARTUP",
            Self::ChatsUpsert => "CHATS_UPSERT",
            Self::ChatsUpdate => "CHATS_UPDATE",
            Self::ChatsDelete => "CHATS_DELETE",
            Self::ChatsSet => "CHATS_SET",
            Self::GroupsUpsert => "GROUPS_UPSERT",
            Self::GroupsUpdate => "GROUPS_UPDATE",
            Self::GroupParticipantsUpdate => "GROUP_PARTICIPANTS_UPDATE",
            Self::ContactsUpsert => "CONTACTS_UPSERT",
            Self::ContactsUpdate => "CONTACTS_UPDATE",
            Self::ContactsSet => "CONTACTS_SET",
            Self::Call => "CALL",
            Self::LabelsAssociation => "LABELS_ASSOCIATION",
            Self::LabelsEdit => "LABELS_EDIT",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Canonical names, used to seed the stats store.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|k| k.as_str()).collect()
    }
}

/// Result of routing one event. Handler failures land here instead of
/// propagating.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOutcome {
    pub success: bool,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouteOutcome {
    fn logged(event: &str) -> Self {
        Self {
            success: true,
            event: event.to_string(),
            action: Some("logged".into()),
            reason: None,
            error: None,
        }
    }
}

/// Heuristic event-kind inference for shapeless payloads.
pub fn detect_event_kind(payload: &Value) -> Option<EventKind> {
    // Envelopes may nest the interesting object under `data`.
    let data = payload
        .get("data")
        .filter(|d| d.is_object())
        .unwrap_or(payload);

    if data.get("key").is_some() && data.get("message").is_some() {
        return Some(EventKind::MessagesUpsert);
    }
    if data.get("update").is_some() && data.get("key").is_some() {
        return Some(EventKind::MessagesUpdate);
    }
    if data.get("state").is_some() || data.get("connection").is_some() {
        return Some(EventKind::ConnectionUpdate);
    }
    if data.get("qrcode").is_some() || data.get("base64").is_some() {
        return Some(EventKind::QrcodeUpdated);
    }
    if data.get("subject").is_some()
        && data
            .get("id")
            .and_then(Value::as_str)
            .is_some_and(|id| id.contains("@g.us"))
    {
        return Some(EventKind::GroupsUpsert);
    }
    if data.get("participants").is_some() && data.get("action").is_some() {
        return Some(EventKind::GroupParticipantsUpdate);
    }
    None
}

pub struct EventRouter {
    messages: Arc<MessageHandler>,
    connection: Arc<ConnectionHandler>,
    stats: Arc<StatsStore>,
    log_presence: bool,
}

impl EventRouter {
    pub fn new(
        messages: Arc<MessageHandler>,
        connection: Arc<ConnectionHandler>,
        stats: Arc<StatsStore>,
        log_presence: bool,
    ) -> Self {
        Self {
            messages,
            connection,
            stats,
            log_presence,
        }
    }

    /// Route one event by canonical kind name. Unknown kinds register
    /// their counters lazily and take the generic path.
    pub async fn route(&self, kind_name: &str, payload: &Value) -> RouteOutcome {
        self.stats.increment(kind_name, StatField::Total);

        let Some(kind) = EventKind::from_name(kind_name) else {
            debug!(event = kind_name, "router.unknown_kind");
            self.log_generic(kind_name);
            return RouteOutcome::logged(kind_name);
        };

        match kind {
            EventKind::MessagesUpsert => self.messages.handle_upsert(payload).await,
            EventKind::SendMessage => self.messages.handle_outgoing(payload).await,
            EventKind::MessagesUpdate => self.messages.handle_update(payload).await,
            EventKind::ConnectionUpdate => self.connection.handle_update(payload).await,
            EventKind::QrcodeUpdated => self.connection.handle_qr(payload).await,
            EventKind::LogoutInstance | EventKind::RemoveInstance => {
                self.connection.handle_logout(kind.as_str()).await
            }
            EventKind::ApplicationStartup => {
                info!(event = kind.as_str(), "router.application_startup");
                self.log_generic(kind.as_str());
                RouteOutcome::logged(kind.as_str())
            }
            EventKind::PresenceUpdate => {
                if self.log_presence {
                    debug!(payload = %payload, "router.presence");
                    self.log_generic(kind.as_str());
                }
                RouteOutcome::logged(kind.as_str())
            }
            EventKind::MessagesDelete
            | EventKind::MessagesSet
            | EventKind::ChatsUpsert
            | EventKind::ChatsUpdate
            | EventKind::ChatsDelete
            | EventKind::ChatsSet
            | EventKind::GroupsUpsert
            | EventKind::GroupsUpdate
            | EventKind::GroupParticipantsUpdate
            | EventKind::ContactsUpsert
            | EventKind::ContactsUpdate
            | EventKind::ContactsSet
            | EventKind::Call
            | EventKind::LabelsAssociation
            | EventKind::LabelsEdit => {
                self.log_generic(kind.as_str());
                RouteOutcome::logged(kind.as_str())
            }
        }
    }

    fn log_generic(&self, kind_name: &str) {
        self.stats
            .log_event(StoredEvent::new(kind_name, EventAction::Logged));
    }
}
