//! Runtime options, resolved from the environment.
//!
//! Every option has a stable effect documented on its field. The gateway
//! reads the environment once at startup; mutable routing state (contacts,
//! groups, per-type destinations) lives in the config store instead.

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::util::env_flag;

pub const DEFAULT_MENTION_KEYWORDS: &str = "דוד,david";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding every persistent file (`contacts.json`,
    /// `stats.json`, `messages.json`, media blobs, adapter auth material).
    pub data_dir: PathBuf,
    /// Default destination URL. When set from the environment it wins over
    /// the persisted value and is never written back.
    pub webhook_url: Option<String>,
    /// Secondary destination, fire-and-forget fan-out.
    pub secondary_webhook_url: Option<String>,
    /// Admin surface credentials (HTTP basic). Both or neither.
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    /// Bind port for the HTTP server.
    pub port: u16,
    /// Comma-separated IP allow-list, plain addresses or CIDR prefixes.
    /// Empty list allows all.
    pub ip_allowlist: Vec<String>,
    /// Mention detection for allowed group messages.
    pub mention_enabled: bool,
    pub mention_webhook_url: Option<String>,
    /// Bearer token attached to mention forwards.
    pub mention_token: Option<String>,
    /// Comma-separated keyword list matched case-insensitively.
    pub mention_keywords: String,
    /// When set, a mentioned group message goes only to the mention
    /// destination, skipping normal forwarding.
    pub mentions_only: bool,
    /// Forward messages sent by the connected account itself.
    pub forward_outgoing: bool,
    /// Forward message edits; off means they are logged only.
    pub forward_message_updates: bool,
    /// Run the direct WhatsApp client adapter.
    pub adapter_enabled: bool,
    /// Log presence events (they are high-volume noise otherwise).
    pub log_presence: bool,
    /// Generic alert notification endpoint.
    pub alert_webhook_url: Option<String>,
    /// Rich-format alert endpoint (critical/warning only).
    pub alert_rich_url: Option<String>,
    /// Bounds for the stats ring buffer and the stores.
    pub recent_events_limit: usize,
    pub messages_per_source: usize,
    pub max_total_messages: usize,
    pub max_media_files: usize,
    pub max_media_bytes: usize,
    /// Instance label stamped on outbound headers and alerts.
    pub instance_name: String,
}

fn default_data_dir() -> PathBuf {
    UserDirs::new()
        .map(|u| u.home_dir().join(".wagate"))
        .unwrap_or_else(|| PathBuf::from(".wagate"))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            webhook_url: None,
            secondary_webhook_url: None,
            admin_user: None,
            admin_password: None,
            port: 8080,
            ip_allowlist: Vec::new(),
            mention_enabled: false,
            mention_webhook_url: None,
            mention_token: None,
            mention_keywords: DEFAULT_MENTION_KEYWORDS.into(),
            mentions_only: false,
            forward_outgoing: false,
            forward_message_updates: false,
            adapter_enabled: false,
            log_presence: false,
            alert_webhook_url: None,
            alert_rich_url: None,
            recent_events_limit: 100,
            messages_per_source: 100,
            max_total_messages: 5000,
            max_media_files: 500,
            max_media_bytes: 10 * 1024 * 1024,
            instance_name: "wagate".into(),
        }
    }
}

impl Settings {
    /// Resolve settings from the environment.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(dir) = var("WAGATE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = var("WAGATE_WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }
        if let Some(url) = var("WAGATE_SECONDARY_WEBHOOK_URL") {
            self.secondary_webhook_url = Some(url);
        }
        self.admin_user = var("WAGATE_ADMIN_USER").or(self.admin_user.take());
        self.admin_password = var("WAGATE_ADMIN_PASSWORD").or(self.admin_password.take());
        if let Some(port) = var("WAGATE_PORT").or_else(|| var("PORT")) {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }
        if let Some(list) = var("WAGATE_IP_ALLOWLIST") {
            self.ip_allowlist = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("WAGATE_MENTION_ENABLED") {
            self.mention_enabled = env_flag(&v);
        }
        if let Some(url) = var("WAGATE_MENTION_WEBHOOK_URL") {
            self.mention_webhook_url = Some(url);
        }
        if let Some(token) = var("WAGATE_MENTION_TOKEN") {
            self.mention_token = Some(token);
        }
        if let Some(keywords) = var("WAGATE_MENTION_KEYWORDS") {
            self.mention_keywords = keywords;
        }
        if let Some(v) = var("WAGATE_MENTIONS_ONLY") {
            self.mentions_only = env_flag(&v);
        }
        if let Some(v) = var("WAGATE_FORWARD_OUTGOING") {
            self.forward_outgoing = env_flag(&v);
        }
        if let Some(v) = var("WAGATE_FORWARD_MESSAGE_UPDATES") {
            self.forward_message_updates = env_flag(&v);
        }
        if let Some(v) = var("WAGATE_ADAPTER_ENABLED") {
            self.adapter_enabled = env_flag(&v);
        }
        if let Some(v) = var("WAGATE_LOG_PRESENCE") {
            self.log_presence = env_flag(&v);
        }
        if let Some(url) = var("WAGATE_ALERT_WEBHOOK_URL") {
            self.alert_webhook_url = Some(url);
        }
        if let Some(url) = var("WAGATE_ALERT_RICH_URL") {
            self.alert_rich_url = Some(url);
        }
        if let Some(v) = var("WAGATE_RECENT_EVENTS_LIMIT") {
            if let Ok(n) = v.parse() {
                self.recent_events_limit = n;
            }
        }
        if let Some(v) = var("WAGATE_MESSAGES_PER_SOURCE") {
            if let Ok(n) = v.parse() {
                self.messages_per_source = n;
            }
        }
        if let Some(v) = var("WAGATE_MAX_TOTAL_MESSAGES") {
            if let Ok(n) = v.parse() {
                self.max_total_messages = n;
            }
        }
        if let Some(v) = var("WAGATE_MAX_MEDIA_FILES") {
            if let Ok(n) = v.parse() {
                self.max_media_files = n;
            }
        }
        if let Some(v) = var("WAGATE_MAX_MEDIA_BYTES") {
            if let Ok(n) = v.parse() {
                self.max_media_bytes = n;
            }
        }
        if let Some(name) = var("WAGATE_INSTANCE_NAME") {
            self.instance_name = name;
        }
    }

    /// Startup validation. The only fatal configuration states: no default
    /// destination without the adapter, and half-configured credentials.
    pub fn validate(&self) -> Result<()> {
        if self.webhook_url.is_none() && !self.adapter_enabled {
            anyhow::bail!(
                "no default destination configured: set WAGATE_WEBHOOK_URL \
                 or enable the client adapter (WAGATE_ADAPTER_ENABLED=1)"
            );
        }
        if self.admin_user.is_some() != self.admin_password.is_some() {
            anyhow::bail!(
                "admin credentials half-configured: set both WAGATE_ADMIN_USER \
                 and WAGATE_ADMIN_PASSWORD, or neither"
            );
        }
        for (name, url) in [
            ("WAGATE_WEBHOOK_URL", &self.webhook_url),
            ("WAGATE_SECONDARY_WEBHOOK_URL", &self.secondary_webhook_url),
            ("WAGATE_MENTION_WEBHOOK_URL", &self.mention_webhook_url),
            ("WAGATE_ALERT_WEBHOOK_URL", &self.alert_webhook_url),
            ("WAGATE_ALERT_RICH_URL", &self.alert_rich_url),
        ] {
            if let Some(url) = url {
                reqwest::Url::parse(url).with_context(|| format!("invalid URL in {name}"))?;
            }
        }
        Ok(())
    }

    /// Mention keywords as a cleaned list, lowercased.
    pub fn mention_keyword_list(&self) -> Vec<String> {
        self.mention_keywords
            .split(',')
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect()
    }
}
