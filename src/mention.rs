//! Mention detection for allowed group messages.
//!
//! Three signals, checked in order: an explicit tag of the owner's phone,
//! a configured keyword in the body, and a reply to a message this
//! instance authored. The first hit wins.

use crate::envelope::{context_info, extract_body};
use crate::identity::normalize_phone;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionMethod {
    Tag,
    Keyword,
    Reply,
}

#[derive(Debug, Clone, Serialize)]
pub struct MentionMatch {
    pub method: MentionMethod,
    /// Keywords that matched (empty for tag/reply mentions).
    pub keywords: Vec<String>,
}

pub struct MentionDetector {
    keywords: Vec<String>,
}

impl MentionDetector {
    /// Build from a lowercased keyword list (see
    /// `Settings::mention_keyword_list`).
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }

    /// Inspect unwrapped message content. `is_own_message` answers whether
    /// a stanza id was authored by this instance.
    pub fn detect(
        &self,
        content: &Value,
        self_phone: &str,
        is_own_message: impl Fn(&str) -> bool,
    ) -> Option<MentionMatch> {
        let self_phone = normalize_phone(self_phone);
        if self_phone.is_empty() {
            return None;
        }

        if self.tagged(content, &self_phone) {
            return Some(MentionMatch {
                method: MentionMethod::Tag,
                keywords: Vec::new(),
            });
        }

        let matched = self.matched_keywords(content);
        if !matched.is_empty() {
            return Some(MentionMatch {
                method: MentionMethod::Keyword,
                keywords: matched,
            });
        }

        if let Some(stanza_id) = context_info(content)
            .and_then(|info| info.get("stanzaId"))
            .and_then(Value::as_str)
        {
            if is_own_message(stanza_id) {
                return Some(MentionMatch {
                    method: MentionMethod::Reply,
                    keywords: Vec::new(),
                });
            }
        }

        None
    }

    fn tagged(&self, content: &Value, self_phone: &str) -> bool {
        let Some(mentioned) = context_info(content)
            .and_then(|info| info.get("mentionedJid"))
            .and_then(Value::as_array)
        else {
            return false;
        };
        mentioned
            .iter()
            .filter_map(Value::as_str)
            .map(normalize_phone)
            .any(|digits| {
                !digits.is_empty() && (digits == self_phone || digits.ends_with(self_phone))
            })
    }

    fn matched_keywords(&self, content: &Value) -> Vec<String> {
        let body = extract_body(content).to_lowercase();
        if body.is_empty() {
            return Vec::new();
        }
        self.keywords
            .iter()
            .filter(|k| body.contains(k.as_str()))
            .cloned()
            .collect()
    }
}
