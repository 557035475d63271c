//! Remote-address parsing and identity normalization.
//!
//! WhatsApp identifies the far side of a chat with a suffixed address:
//! `<digits>@s.whatsapp.net` for contacts, `<digits>@g.us` for groups,
//! `<digits>@lid` for linked identifiers that alias a real phone number,
//! and `status@broadcast` for status posts. Everything downstream
//! (authorization, routing, storage keys) works on the normalized
//! digits-only form, so normalization must be applied on both sides of
//! every comparison.

use serde::{Deserialize, Serialize};

const GROUP_SUFFIX: &str = "@g.us";
const CONTACT_SUFFIX: &str = "@s.whatsapp.net";
const LID_SUFFIX: &str = "@lid";
const STATUS_BROADCAST: &str = "status@broadcast";

/// Classification of a remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Contact,
    Group,
    Status,
    Unknown,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Group => "group",
            Self::Status => "status",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of parsing a raw remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSource {
    /// Suffix-stripped identifier. Empty for status broadcasts.
    pub source_id: String,
    pub source_type: SourceType,
    pub is_status_broadcast: bool,
    /// The address used the `@lid` alias form and must be resolved to a
    /// phone number before authorization.
    pub is_linked_id: bool,
}

/// Parse a remote address into its source classification.
pub fn parse_remote_address(remote: &str) -> ParsedSource {
    let remote = remote.trim();

    if remote.is_empty() {
        return ParsedSource {
            source_id: String::new(),
            source_type: SourceType::Unknown,
            is_status_broadcast: false,
            is_linked_id: false,
        };
    }

    if remote.contains(STATUS_BROADCAST) {
        return ParsedSource {
            source_id: String::new(),
            source_type: SourceType::Status,
            is_status_broadcast: true,
            is_linked_id: false,
        };
    }

    if remote.contains(GROUP_SUFFIX) {
        return ParsedSource {
            source_id: remote.replace(GROUP_SUFFIX, ""),
            source_type: SourceType::Group,
            is_status_broadcast: false,
            is_linked_id: false,
        };
    }

    if remote.contains(LID_SUFFIX) {
        return ParsedSource {
            source_id: remote.replace(LID_SUFFIX, ""),
            source_type: SourceType::Contact,
            is_status_broadcast: false,
            is_linked_id: true,
        };
    }

    ParsedSource {
        source_id: remote.replace(CONTACT_SUFFIX, ""),
        source_type: SourceType::Contact,
        is_status_broadcast: false,
        is_linked_id: false,
    }
}

/// Strip every non-digit character. Idempotent by construction.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Strip a trailing `@g.us` suffix only. Group ids keep their digits as-is.
pub fn normalize_group_id(raw: &str) -> String {
    raw.trim()
        .strip_suffix(GROUP_SUFFIX)
        .unwrap_or(raw.trim())
        .to_string()
}

/// A normalized phone is valid at 10-15 digits.
pub fn is_valid_phone(digits: &str) -> bool {
    (10..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// A normalized group id is valid at 10-25 digits.
pub fn is_valid_group_id(digits: &str) -> bool {
    (10..=25).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
