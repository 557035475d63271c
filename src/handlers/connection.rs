//! Connection-state tracking for the upstream session.
//!
//! Raw state strings from heterogeneous upstreams map onto a small
//! canonical set; transitions are recorded only when the canonical state
//! actually changes, each with a bounded history entry and at most one
//! alert.

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::router::RouteOutcome;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "connecting")]
    Connecting,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "loggedOut")]
    LoggedOut,
    #[serde(rename = "waitingForPairing")]
    WaitingForPairing,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut => "loggedOut",
            Self::WaitingForPairing => "waitingForPairing",
        }
    }
}

/// Map a raw upstream state string to a canonical status.
pub fn map_raw_state(raw: &str) -> ConnectionStatus {
    match raw.to_ascii_lowercase().as_str() {
        "open" | "connected" => ConnectionStatus::Connected,
        "connecting" => ConnectionStatus::Connecting,
        "close" | "closed" | "disconnected" => ConnectionStatus::Disconnected,
        "logged_out" | "loggedout" | "logout" => ConnectionStatus::LoggedOut,
        _ => ConnectionStatus::Unknown,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrState {
    pub data: String,
    pub data_uri: String,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub status_since: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<QrState>,
    pub history: Vec<TransitionRecord>,
}

struct ConnectionInner {
    state: ConnectionState,
    /// Whether the session has been connected at least once, to tell a
    /// first connect from a recovery.
    was_connected: bool,
}

pub struct ConnectionHandler {
    inner: Mutex<ConnectionInner>,
    alerts: Arc<AlertSink>,
}

impl ConnectionHandler {
    pub fn new(alerts: Arc<AlertSink>) -> Self {
        Self {
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState {
                    status: ConnectionStatus::Unknown,
                    status_since: Utc::now().to_rfc3339(),
                    phone_owner: None,
                    qr: None,
                    history: Vec::new(),
                },
                was_connected: false,
            }),
            alerts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    pub fn phone_owner(&self) -> Option<String> {
        self.inner.lock().state.phone_owner.clone()
    }

    pub fn set_phone_owner(&self, phone: &str) {
        self.inner.lock().state.phone_owner = Some(phone.to_string());
    }

    /// Handle a connection-update event from the router.
    pub async fn handle_update(&self, payload: &Value) -> RouteOutcome {
        let data = payload
            .get("data")
            .filter(|d| d.is_object())
            .unwrap_or(payload);
        let raw = data
            .get("state")
            .or_else(|| data.get("connection"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let status = map_raw_state(raw);
        self.apply_transition(status).await;
        RouteOutcome {
            success: true,
            event: "CONNECTION_UPDATE".into(),
            action: Some("logged".into()),
            reason: Some(status.as_str().to_string()),
            error: None,
        }
    }

    /// Record a transition, returning the previous status when the
    /// canonical state actually changed.
    pub async fn apply_transition(&self, status: ConnectionStatus) -> Option<ConnectionStatus> {
        let (previous, recovered) = {
            let mut inner = self.inner.lock();
            if inner.state.status == status {
                return None;
            }
            let previous = inner.state.status;
            inner.state.history.push(TransitionRecord {
                from: previous,
                to: status,
                timestamp: Utc::now().to_rfc3339(),
            });
            let overflow = inner.state.history.len().saturating_sub(HISTORY_LIMIT);
            if overflow > 0 {
                inner.state.history.drain(..overflow);
            }
            inner.state.status = status;
            inner.state.status_since = Utc::now().to_rfc3339();
            let recovered = inner.was_connected;
            if status == ConnectionStatus::Connected {
                inner.state.qr = None;
                inner.was_connected = true;
            }
            (previous, recovered)
        };

        info!(
            from = previous.as_str(),
            to = status.as_str(),
            "connection.transition"
        );

        match status {
            ConnectionStatus::Connected => {
                let (event, title) = if recovered {
                    ("connection.restored", "WhatsApp connection restored")
                } else {
                    ("connection.established", "WhatsApp connected")
                };
                self.alerts
                    .send(
                        Alert::new(AlertLevel::Info, event, title, "Session is connected")
                            .detail("previous", previous.as_str()),
                    )
                    .await;
            }
            ConnectionStatus::Disconnected => {
                self.alerts
                    .send(
                        Alert::new(
                            AlertLevel::Critical,
                            "connection.lost",
                            "WhatsApp disconnected",
                            "The session lost its connection",
                        )
                        .detail("current", status.as_str())
                        .detail("previous", previous.as_str()),
                    )
                    .await;
            }
            ConnectionStatus::Connecting => {
                if previous != ConnectionStatus::Connecting {
                    self.alerts
                        .send(
                            Alert::new(
                                AlertLevel::Warning,
                                "connection.connecting",
                                "WhatsApp reconnecting",
                                "The session is attempting to connect",
                            )
                            .detail("previous", previous.as_str()),
                        )
                        .await;
                }
            }
            ConnectionStatus::LoggedOut => {
                self.alerts
                    .send(Alert::new(
                        AlertLevel::Critical,
                        "connection.logged_out",
                        "WhatsApp session logged out",
                        "The session was logged out and needs re-pairing",
                    ))
                    .await;
            }
            ConnectionStatus::Unknown | ConnectionStatus::WaitingForPairing => {}
        }

        Some(previous)
    }

    /// Handle a QR-update event: store the artifact and raise the
    /// scan-required alert.
    pub async fn handle_qr(&self, payload: &Value) -> RouteOutcome {
        let data = payload
            .get("data")
            .filter(|d| d.is_object())
            .unwrap_or(payload);
        let qr = data
            .get("qrcode")
            .or_else(|| data.get("base64"))
            .or_else(|| data.get("qr"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if qr.is_empty() {
            warn!("connection.qr_empty");
            return RouteOutcome {
                success: false,
                event: "QRCODE_UPDATED".into(),
                action: None,
                reason: None,
                error: Some("empty QR payload".into()),
            };
        }
        self.set_qr(qr).await;
        RouteOutcome {
            success: true,
            event: "QRCODE_UPDATED".into(),
            action: Some("logged".into()),
            reason: Some("qr_updated".into()),
            error: None,
        }
    }

    pub async fn set_qr(&self, data: &str) {
        let data_uri = if data.starts_with("data:") {
            data.to_string()
        } else if is_base64(data) {
            format!("data:image/png;base64,{data}")
        } else {
            // Raw pairing payload: encode so the admin surface can render it.
            format!(
                "data:text/plain;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(data)
            )
        };
        {
            let mut inner = self.inner.lock();
            inner.state.qr = Some(QrState {
                data: data.to_string(),
                data_uri,
                generated_at: Utc::now().to_rfc3339(),
            });
        }
        self.apply_transition(ConnectionStatus::WaitingForPairing)
            .await;
        self.alerts
            .send(Alert::new(
                AlertLevel::Critical,
                "connection.qr",
                "WhatsApp pairing required",
                "Scan the QR code to link the session",
            ))
            .await;
    }

    pub async fn handle_logout(&self, event: &str) -> RouteOutcome {
        self.apply_transition(ConnectionStatus::LoggedOut).await;
        RouteOutcome {
            success: true,
            event: event.to_string(),
            action: Some("logged".into()),
            reason: Some("loggedOut".into()),
            error: None,
        }
    }
}

fn is_base64(s: &str) -> bool {
    !s.is_empty()
        && s.len() % 4 == 0
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}
