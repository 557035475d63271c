//! Alert fan-out to configured notification endpoints.
//!
//! Two channels: a generic JSON endpoint, and a rich-format endpoint that
//! only sees critical and warning levels. Both are best-effort; the alert
//! is always counted in stats even when nothing is configured.

use crate::store::StatsStore;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ALERT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RICH_DETAILS: usize = 10;
const MAX_RICH_ACTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Critical,
    Warning,
    Info,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    fn emoji(self) -> &'static str {
        match self {
            Self::Critical => "🔴",
            Self::Warning => "🟠",
            Self::Info => "🔵",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertAction {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    /// Machine event name, e.g. `connection.lost`.
    pub event: String,
    pub title: String,
    pub message: String,
    pub details: Vec<(String, String)>,
    pub actions: Vec<AlertAction>,
}

impl Alert {
    pub fn new(level: AlertLevel, event: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            event: event.into(),
            title: title.into(),
            message: message.into(),
            details: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.push((key.into(), value.into()));
        self
    }

    pub fn action(mut self, label: &str, url: &str) -> Self {
        self.actions.push(AlertAction {
            label: label.into(),
            url: url.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertOutcome {
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct AlertSink {
    client: reqwest::Client,
    generic_url: Option<String>,
    rich_url: Option<String>,
    instance: String,
    stats: Arc<StatsStore>,
}

impl AlertSink {
    pub fn new(
        generic_url: Option<String>,
        rich_url: Option<String>,
        instance: String,
        stats: Arc<StatsStore>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            generic_url,
            rich_url,
            instance,
            stats,
        }
    }

    /// Fan an alert out to every configured channel. Failures are logged,
    /// never propagated.
    pub async fn send(&self, alert: Alert) -> AlertOutcome {
        let rich_eligible = matches!(alert.level, AlertLevel::Critical | AlertLevel::Warning);
        let has_generic = self.generic_url.is_some();
        let has_rich = self.rich_url.is_some() && rich_eligible;

        if !has_generic && !has_rich {
            self.stats.increment_alert(alert.level.as_str(), None);
            return AlertOutcome {
                sent: false,
                reason: Some("no_channels".into()),
            };
        }

        let mut delivered = false;

        if let Some(url) = &self.generic_url {
            delivered |= self.post_generic(url, &alert).await;
        }
        if has_rich {
            if let Some(url) = &self.rich_url {
                delivered |= self.post_rich(url, &alert).await;
            }
        }

        self.stats
            .increment_alert(alert.level.as_str(), Some(delivered));
        AlertOutcome {
            sent: delivered,
            reason: (!delivered).then(|| "delivery_failed".to_string()),
        }
    }

    async fn post_generic(&self, url: &str, alert: &Alert) -> bool {
        let body = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "timestamp": Utc::now().to_rfc3339(),
            "source": "wagate",
            "instance": self.instance,
            "level": alert.level.as_str(),
            "event": alert.event,
            "title": alert.title,
            "message": alert.message,
            "details": alert.details.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
            "actions": alert.actions,
        });
        let result = self
            .client
            .post(url)
            .timeout(ALERT_TIMEOUT)
            .header("X-Alert-Level", alert.level.as_str())
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(event = %alert.event, "alert.delivered");
                true
            }
            Ok(resp) => {
                warn!(event = %alert.event, status = resp.status().as_u16(), "alert.rejected");
                false
            }
            Err(e) => {
                warn!(event = %alert.event, error = %e, "alert.unreachable");
                false
            }
        }
    }

    async fn post_rich(&self, url: &str, alert: &Alert) -> bool {
        let result = self
            .client
            .post(url)
            .timeout(ALERT_TIMEOUT)
            .json(&rich_blocks(alert, &self.instance))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(event = %alert.event, status = resp.status().as_u16(), "alert.rich_rejected");
                false
            }
            Err(e) => {
                warn!(event = %alert.event, error = %e, "alert.rich_unreachable");
                false
            }
        }
    }
}

/// Block layout for the rich endpoint: header, message, up to ten detail
/// fields, up to five action buttons.
fn rich_blocks(alert: &Alert, instance: &str) -> Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("{} {}", alert.level.emoji(), alert.title),
            }
        }),
        json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": alert.message}
        }),
    ];

    if !alert.details.is_empty() {
        let fields: Vec<Value> = alert
            .details
            .iter()
            .take(MAX_RICH_DETAILS)
            .map(|(k, v)| json!({"type": "mrkdwn", "text": format!("*{k}:* {v}")}))
            .collect();
        blocks.push(json!({"type": "section", "fields": fields}));
    }

    if !alert.actions.is_empty() {
        let elements: Vec<Value> = alert
            .actions
            .iter()
            .take(MAX_RICH_ACTIONS)
            .map(|a| {
                json!({
                    "type": "button",
                    "text": {"type": "plain_text", "text": a.label},
                    "url": a.url,
                })
            })
            .collect();
        blocks.push(json!({"type": "actions", "elements": elements}));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("{instance} · {} · {}", alert.event, Utc::now().to_rfc3339()),
        }]
    }));

    json!({"blocks": blocks})
}
