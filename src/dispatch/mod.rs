//! Webhook dispatcher: destination resolution, retry with backoff, and
//! per-destination health tracking.
//!
//! Destinations resolve per entity type, falling back to the default URL.
//! Delivery is at-least-once: up to three attempts, retrying only when no
//! HTTP response arrived or the response was a 5xx. A configured secondary
//! destination receives a fire-and-forget copy that never blocks and never
//! fails the primary.

use crate::store::ConfigStore;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const FIRST_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const SECONDARY_TIMEOUT: Duration = Duration::from_secs(5);
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery metadata stamped into request headers.
#[derive(Debug, Clone)]
pub struct ForwardMeta {
    pub source_id: String,
    pub source_type: String,
    pub entity_type: Option<String>,
    pub event_kind: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSuccess {
    pub destination: String,
    /// 1-based attempt number that succeeded.
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No type-specific route and no default destination. An explicit
    /// non-delivery outcome, never a silent success.
    #[error("no destination configured")]
    NoDestination,

    /// Non-5xx error status: permanent, not retried.
    #[error("destination {destination} returned {status}")]
    Terminal {
        destination: String,
        status: u16,
        consecutive_failures: u32,
    },

    /// All attempts exhausted on transport errors or 5xx responses.
    #[error("delivery to {destination} failed after {attempts} attempts: {message}")]
    Exhausted {
        destination: String,
        attempts: u32,
        message: String,
        last_status: Option<u16>,
        consecutive_failures: u32,
    },
}

impl DispatchError {
    /// Consecutive-failure count of the destination, for alert thresholds.
    pub fn consecutive_failures(&self) -> u32 {
        match self {
            Self::NoDestination => 0,
            Self::Terminal {
                consecutive_failures,
                ..
            }
            | Self::Exhausted {
                consecutive_failures,
                ..
            } => *consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookHealth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<WebhookError>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookError {
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeCounters {
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub destinations: HashMap<String, WebhookHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<SecondaryHealth>,
    pub by_type: HashMap<String, TypeCounters>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryHealth {
    pub url: String,
    #[serde(flatten)]
    pub health: WebhookHealth,
}

/// Result of a synthetic test delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
    secondary_url: Option<String>,
    instance: String,
    health: Mutex<HashMap<String, WebhookHealth>>,
    by_type: Mutex<HashMap<String, TypeCounters>>,
}

impl WebhookDispatcher {
    pub fn new(config: Arc<ConfigStore>, secondary_url: Option<String>, instance: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            secondary_url,
            instance,
            health: Mutex::new(HashMap::new()),
            by_type: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the destination for an entity type: type route first, then
    /// the default. Pure in the routing snapshot.
    pub fn resolve_destination(&self, entity_type: Option<&str>) -> Option<String> {
        entity_type
            .and_then(|t| self.config.type_webhook(t))
            .or_else(|| self.config.default_webhook_url())
    }

    /// Forward a payload. The body is POSTed unchanged; routing metadata
    /// travels in headers.
    pub async fn forward(
        &self,
        payload: &Value,
        meta: &ForwardMeta,
    ) -> Result<DispatchSuccess, DispatchError> {
        let destination = self
            .resolve_destination(meta.entity_type.as_deref())
            .ok_or(DispatchError::NoDestination)?;

        self.fan_out_secondary(payload, meta);

        let type_key = meta
            .entity_type
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let mut last_message = String::new();
        let mut last_status: Option<u16> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let timeout = if attempt == 1 {
                FIRST_ATTEMPT_TIMEOUT
            } else {
                RETRY_ATTEMPT_TIMEOUT
            };
            match self
                .post(&destination, payload, meta, timeout)
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.record_success(&destination);
                        self.bump_type(&type_key, true);
                        info!(
                            destination = %destination,
                            attempt,
                            event = %meta.event_kind,
                            "webhook.forwarded"
                        );
                        return Ok(DispatchSuccess {
                            destination,
                            attempt,
                        });
                    }
                    let code = status.as_u16();
                    if code < 500 {
                        // 4xx is terminal: retrying cannot help.
                        let failures =
                            self.record_failure(&destination, &format!("status {code}"), Some(code));
                        self.bump_type(&type_key, false);
                        warn!(destination = %destination, status = code, "webhook.rejected");
                        return Err(DispatchError::Terminal {
                            destination,
                            status: code,
                            consecutive_failures: failures,
                        });
                    }
                    last_message = format!("status {code}");
                    last_status = Some(code);
                    debug!(destination = %destination, status = code, attempt, "webhook.retryable");
                }
                Err(e) => {
                    last_message = e.to_string();
                    last_status = None;
                    debug!(destination = %destination, error = %e, attempt, "webhook.unreachable");
                }
            }

            if attempt < MAX_ATTEMPTS {
                // Backoff schedule: 1 s after the first attempt, 2 s after
                // the second.
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }

        let failures = self.record_failure(&destination, &last_message, last_status);
        self.bump_type(&type_key, false);
        warn!(
            destination = %destination,
            error = %last_message,
            "webhook.exhausted"
        );
        Err(DispatchError::Exhausted {
            destination,
            attempts: MAX_ATTEMPTS,
            message: last_message,
            last_status,
            consecutive_failures: failures,
        })
    }

    /// Fire-and-forget copy to the secondary destination. Never blocks the
    /// primary and never surfaces a failure.
    fn fan_out_secondary(&self, payload: &Value, meta: &ForwardMeta) {
        let Some(secondary) = self.secondary_url.clone() else {
            return;
        };
        let client = self.client.clone();
        let payload = payload.clone();
        let meta = meta.clone();
        let instance = self.instance.clone();
        tokio::spawn(async move {
            let result = apply_meta_headers(
                client.post(&secondary).timeout(SECONDARY_TIMEOUT),
                &instance,
                &meta,
            )
            .json(&payload)
            .send()
            .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(destination = %secondary, "webhook.secondary_delivered");
                }
                Ok(resp) => {
                    debug!(destination = %secondary, status = resp.status().as_u16(), "webhook.secondary_rejected");
                }
                Err(e) => {
                    debug!(destination = %secondary, error = %e, "webhook.secondary_unreachable");
                }
            }
        });
    }

    async fn post(
        &self,
        destination: &str,
        payload: &Value,
        meta: &ForwardMeta,
        timeout: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        apply_meta_headers(
            self.client.post(destination).timeout(timeout),
            &self.instance,
            meta,
        )
        .json(payload)
        .send()
        .await
    }

    /// Deliver a minimal synthetic payload to the resolved destination.
    pub async fn test(&self, entity_type: Option<&str>) -> TestOutcome {
        let Some(destination) = self.resolve_destination(entity_type) else {
            return TestOutcome {
                success: false,
                destination: None,
                status: None,
                error: Some("no destination configured".into()),
            };
        };
        let payload = json!({
            "test": true,
            "timestamp": Utc::now().to_rfc3339(),
            "message": "wagate connectivity test",
            "source": self.instance,
            "entityType": entity_type,
        });
        let result = self
            .client
            .post(&destination)
            .timeout(TEST_TIMEOUT)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if resp.status().is_success() {
                    self.record_success(&destination);
                    TestOutcome {
                        success: true,
                        destination: Some(destination),
                        status: Some(status),
                        error: None,
                    }
                } else {
                    self.record_failure(&destination, &format!("status {status}"), Some(status));
                    TestOutcome {
                        success: false,
                        destination: Some(destination),
                        status: Some(status),
                        error: Some(format!("destination returned {status}")),
                    }
                }
            }
            Err(e) => {
                self.record_failure(&destination, &e.to_string(), None);
                TestOutcome {
                    success: false,
                    destination: Some(destination),
                    status: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        let health = self.health.lock();
        let secondary = self.secondary_url.as_ref().map(|url| SecondaryHealth {
            url: url.clone(),
            health: health.get(url).cloned().unwrap_or_default(),
        });
        let mut destinations = health.clone();
        if let Some(url) = &self.secondary_url {
            destinations.remove(url);
        }
        HealthReport {
            destinations,
            secondary,
            by_type: self.by_type.lock().clone(),
        }
    }

    pub fn consecutive_failures(&self, destination: &str) -> u32 {
        self.health
            .lock()
            .get(destination)
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }

    fn record_success(&self, destination: &str) {
        let mut health = self.health.lock();
        let entry = health.entry(destination.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.last_success = Some(Utc::now().to_rfc3339());
        entry.last_error = None;
    }

    fn record_failure(&self, destination: &str, message: &str, code: Option<u16>) -> u32 {
        let mut health = self.health.lock();
        let entry = health.entry(destination.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_error = Some(WebhookError {
            message: message.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            code,
        });
        entry.consecutive_failures
    }

    fn bump_type(&self, type_key: &str, success: bool) {
        let mut by_type = self.by_type.lock();
        let entry = by_type.entry(type_key.to_string()).or_default();
        if success {
            entry.success += 1;
        } else {
            entry.failure += 1;
        }
    }
}

fn apply_meta_headers(
    builder: reqwest::RequestBuilder,
    instance: &str,
    meta: &ForwardMeta,
) -> reqwest::RequestBuilder {
    builder
        .header("X-Filter-Source", instance)
        .header("X-Source-Id", meta.source_id.as_str())
        .header("X-Source-Type", meta.source_type.as_str())
        .header(
            "X-Entity-Type",
            meta.entity_type.as_deref().unwrap_or_default(),
        )
        .header("X-Event-Type", meta.event_kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, default_url: Option<&str>) -> Arc<ConfigStore> {
        Arc::new(
            ConfigStore::load(
                dir.path().join("contacts.json"),
                default_url.map(str::to_string),
            )
            .unwrap(),
        )
    }

    fn meta(entity_type: Option<&str>) -> ForwardMeta {
        ForwardMeta {
            source_id: "972500000001".into(),
            source_type: "contact".into(),
            entity_type: entity_type.map(str::to_string),
            event_kind: "MESSAGES_UPSERT".into(),
        }
    }

    #[tokio::test]
    async fn no_destination_is_explicit() {
        let dir = TempDir::new().unwrap();
        let dispatcher = WebhookDispatcher::new(config(&dir, None), None, "wagate".into());
        let err = dispatcher
            .forward(&json!({"x": 1}), &meta(Some("TEAM")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoDestination));
    }

    #[tokio::test]
    async fn type_route_beats_default() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, Some("https://ex/default"));
        let mut routes = HashMap::new();
        routes.insert("VIP".to_string(), "https://ex/vip".to_string());
        cfg.set_type_webhooks(routes).unwrap();
        let dispatcher = WebhookDispatcher::new(cfg, None, "wagate".into());
        assert_eq!(
            dispatcher.resolve_destination(Some("VIP")).as_deref(),
            Some("https://ex/vip")
        );
        assert_eq!(
            dispatcher.resolve_destination(Some("TEAM")).as_deref(),
            Some("https://ex/default")
        );
        assert_eq!(
            dispatcher.resolve_destination(None).as_deref(),
            Some("https://ex/default")
        );
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, Some("https://ex/default"));
        let dispatcher = WebhookDispatcher::new(cfg, None, "wagate".into());
        let first = dispatcher.resolve_destination(Some("VIP"));
        for _ in 0..10 {
            assert_eq!(dispatcher.resolve_destination(Some("VIP")), first);
        }
    }

    #[test]
    fn health_starts_empty() {
        let dir = TempDir::new().unwrap();
        let dispatcher = WebhookDispatcher::new(
            config(&dir, None),
            Some("https://ex/secondary".into()),
            "wagate".into(),
        );
        let report = dispatcher.health();
        assert!(report.destinations.is_empty());
        let secondary = report.secondary.unwrap();
        assert_eq!(secondary.url, "https://ex/secondary");
        assert_eq!(secondary.health.consecutive_failures, 0);
    }

    #[test]
    fn failure_bookkeeping_counts_up_and_resets() {
        let dir = TempDir::new().unwrap();
        let dispatcher = WebhookDispatcher::new(config(&dir, None), None, "wagate".into());
        assert_eq!(dispatcher.record_failure("https://ex/w", "boom", None), 1);
        assert_eq!(dispatcher.record_failure("https://ex/w", "boom", None), 2);
        dispatcher.record_success("https://ex/w");
        assert_eq!(dispatcher.consecutive_failures("https://ex/w"), 0);
    }
}
