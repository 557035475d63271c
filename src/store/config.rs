//! Routing configuration store: allowed contacts, allowed groups, the
//! per-type destination map and custom entity types, persisted as
//! `contacts.json`.
//!
//! An environment-provided default destination wins over the persisted
//! one and is never written back, so a deployment can pin the URL without
//! the admin surface drifting it.

use super::{read_json, write_json_atomic, StoreError};
use crate::identity::{is_valid_group_id, is_valid_phone, normalize_group_id, normalize_phone};
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

pub const DEFAULT_CONTACT_TYPES: [&str; 7] = [
    "FAMILY", "FRIEND", "WORK", "BUSINESS", "SERVICE", "VIP", "OTHER",
];
pub const DEFAULT_GROUP_TYPES: [&str; 5] = ["FAMILY", "WORK", "COMMUNITY", "BUSINESS", "OTHER"];

/// Entity type auto-assigned to the connected account's own phone.
pub const SELF_TYPE: &str = "SELF";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub phone: String,
    pub name: String,
    #[serde(rename = "type")]
    pub contact_type: String,
    /// Linked identifier aliasing this phone, when known.
    #[serde(rename = "lid", skip_serializing_if = "Option::is_none")]
    pub linked_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    #[serde(rename = "groupId")]
    pub group_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
}

/// Partial update for a contact. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactUpdate {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub contact_type: Option<String>,
    #[serde(rename = "lid")]
    pub linked_id: Option<String>,
}

/// Partial update for a group.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub group_type: Option<String>,
}

/// On-disk document shape (`contacts.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoutingDoc {
    #[serde(rename = "allowedNumbers", default)]
    allowed_numbers: Vec<Contact>,
    #[serde(rename = "allowedGroups", default)]
    allowed_groups: Vec<Group>,
    #[serde(rename = "typeWebhooks", default)]
    type_webhooks: HashMap<String, String>,
    #[serde(rename = "customContactTypes", default)]
    custom_contact_types: Vec<String>,
    #[serde(rename = "customGroupTypes", default)]
    custom_group_types: Vec<String>,
    /// Opaque legacy counters carried for older readers of this file.
    #[serde(default = "empty_object")]
    stats: Value,
    #[serde(rename = "webhookUrl", default, skip_serializing_if = "Option::is_none")]
    webhook_url: Option<String>,
}

impl Default for RoutingDoc {
    fn default() -> Self {
        Self {
            allowed_numbers: Vec::new(),
            allowed_groups: Vec::new(),
            type_webhooks: HashMap::new(),
            custom_contact_types: Vec::new(),
            custom_group_types: Vec::new(),
            stats: empty_object(),
            webhook_url: None,
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
    /// Environment-pinned default destination; wins over the document.
    env_webhook_url: Option<String>,
    inner: Mutex<RoutingDoc>,
}

impl ConfigStore {
    /// Load from disk; a missing file starts empty.
    pub fn load(path: PathBuf, env_webhook_url: Option<String>) -> Result<Self> {
        let doc: RoutingDoc = read_json(&path)?.unwrap_or_default();
        info!(
            contacts = doc.allowed_numbers.len(),
            groups = doc.allowed_groups.len(),
            path = %path.display(),
            "config.loaded"
        );
        Ok(Self {
            path,
            env_webhook_url,
            inner: Mutex::new(doc),
        })
    }

    pub fn save(&self) -> Result<()> {
        let doc = self.inner.lock().clone();
        self.persist(&doc)
    }

    fn persist(&self, doc: &RoutingDoc) -> Result<()> {
        let mut to_save = doc.clone();
        if self.env_webhook_url.is_some() {
            // Env-pinned URL is never written back.
            to_save.webhook_url = None;
        }
        write_json_atomic(&self.path, &to_save)?;
        debug!(path = %self.path.display(), "config.saved");
        Ok(())
    }

    fn persist_or_storage_err(&self, doc: &RoutingDoc) -> Result<(), StoreError> {
        self.persist(doc).map_err(|e| StoreError::Storage(e.to_string()))
    }

    // ── Contacts ─────────────────────────────────────────────

    pub fn contacts(&self) -> Vec<Contact> {
        self.inner.lock().allowed_numbers.clone()
    }

    pub fn add_contact(&self, contact: Contact) -> Result<Contact, StoreError> {
        let contact = self.validate_contact(contact)?;
        let mut doc = self.inner.lock();
        if doc
            .allowed_numbers
            .iter()
            .any(|c| normalize_phone(&c.phone) == contact.phone)
        {
            return Err(StoreError::duplicate("contact", contact.phone));
        }
        doc.allowed_numbers.push(contact.clone());
        self.persist_or_storage_err(&doc)?;
        info!(phone = %contact.phone, name = %contact.name, "contact.added");
        Ok(contact)
    }

    pub fn update_contact(&self, phone: &str, update: ContactUpdate) -> Result<Contact, StoreError> {
        let key = normalize_phone(phone);
        let mut doc = self.inner.lock();
        let allowed_types = allowed_types(&DEFAULT_CONTACT_TYPES, &doc.custom_contact_types);
        let contact = doc
            .allowed_numbers
            .iter_mut()
            .find(|c| normalize_phone(&c.phone) == key)
            .ok_or_else(|| StoreError::not_found("contact", key.clone()))?;
        if let Some(name) = update.name {
            validate_name(&name)?;
            contact.name = name;
        }
        if let Some(contact_type) = update.contact_type {
            let contact_type = contact_type.to_uppercase();
            if !allowed_types.contains(&contact_type) {
                return Err(StoreError::invalid("type", format!("unknown contact type {contact_type}")));
            }
            contact.contact_type = contact_type;
        }
        if let Some(lid) = update.linked_id {
            let lid = normalize_phone(&lid);
            contact.linked_id = if lid.is_empty() { None } else { Some(lid) };
        }
        let updated = contact.clone();
        self.persist_or_storage_err(&doc)?;
        Ok(updated)
    }

    pub fn delete_contact(&self, phone: &str) -> Result<(), StoreError> {
        let key = normalize_phone(phone);
        let mut doc = self.inner.lock();
        let before = doc.allowed_numbers.len();
        doc.allowed_numbers
            .retain(|c| normalize_phone(&c.phone) != key);
        if doc.allowed_numbers.len() == before {
            return Err(StoreError::not_found("contact", key));
        }
        self.persist_or_storage_err(&doc)?;
        info!(phone = %key, "contact.deleted");
        Ok(())
    }

    fn validate_contact(&self, mut contact: Contact) -> Result<Contact, StoreError> {
        contact.phone = normalize_phone(&contact.phone);
        if !is_valid_phone(&contact.phone) {
            return Err(StoreError::invalid("phone", "must normalize to 10-15 digits"));
        }
        validate_name(&contact.name)?;
        contact.contact_type = contact.contact_type.to_uppercase();
        let doc = self.inner.lock();
        let types = allowed_types(&DEFAULT_CONTACT_TYPES, &doc.custom_contact_types);
        drop(doc);
        if !types.contains(&contact.contact_type) {
            return Err(StoreError::invalid(
                "type",
                format!("unknown contact type {}", contact.contact_type),
            ));
        }
        if let Some(lid) = contact.linked_id.take() {
            let lid = normalize_phone(&lid);
            contact.linked_id = if lid.is_empty() { None } else { Some(lid) };
        }
        Ok(contact)
    }

    /// Look up a contact by normalized phone digits or linked identifier.
    pub fn find_contact(&self, normalized: &str) -> Option<Contact> {
        let doc = self.inner.lock();
        doc.allowed_numbers
            .iter()
            .find(|c| {
                normalize_phone(&c.phone) == normalized
                    || c.linked_id.as_deref() == Some(normalized)
            })
            .cloned()
    }

    /// Resolve a linked identifier to its contact's phone, if indexed.
    pub fn phone_for_linked_id(&self, lid: &str) -> Option<String> {
        let lid = normalize_phone(lid);
        let doc = self.inner.lock();
        doc.allowed_numbers
            .iter()
            .find(|c| c.linked_id.as_deref() == Some(lid.as_str()))
            .map(|c| normalize_phone(&c.phone))
    }

    // ── Groups ───────────────────────────────────────────────

    pub fn groups(&self) -> Vec<Group> {
        self.inner.lock().allowed_groups.clone()
    }

    pub fn add_group(&self, group: Group) -> Result<Group, StoreError> {
        let group = self.validate_group(group)?;
        let mut doc = self.inner.lock();
        if doc
            .allowed_groups
            .iter()
            .any(|g| normalize_group_id(&g.group_id) == group.group_id)
        {
            return Err(StoreError::duplicate("group", group.group_id));
        }
        doc.allowed_groups.push(group.clone());
        self.persist_or_storage_err(&doc)?;
        info!(group = %group.group_id, name = %group.name, "group.added");
        Ok(group)
    }

    pub fn update_group(&self, group_id: &str, update: GroupUpdate) -> Result<Group, StoreError> {
        let key = normalize_group_id(group_id);
        let mut doc = self.inner.lock();
        let allowed = allowed_types(&DEFAULT_GROUP_TYPES, &doc.custom_group_types);
        let group = doc
            .allowed_groups
            .iter_mut()
            .find(|g| normalize_group_id(&g.group_id) == key)
            .ok_or_else(|| StoreError::not_found("group", key.clone()))?;
        if let Some(name) = update.name {
            validate_name(&name)?;
            group.name = name;
        }
        if let Some(group_type) = update.group_type {
            let group_type = group_type.to_uppercase();
            if !allowed.contains(&group_type) {
                return Err(StoreError::invalid("type", format!("unknown group type {group_type}")));
            }
            group.group_type = group_type;
        }
        let updated = group.clone();
        self.persist_or_storage_err(&doc)?;
        Ok(updated)
    }

    pub fn delete_group(&self, group_id: &str) -> Result<(), StoreError> {
        let key = normalize_group_id(group_id);
        let mut doc = self.inner.lock();
        let before = doc.allowed_groups.len();
        doc.allowed_groups
            .retain(|g| normalize_group_id(&g.group_id) != key);
        if doc.allowed_groups.len() == before {
            return Err(StoreError::not_found("group", key));
        }
        self.persist_or_storage_err(&doc)?;
        info!(group = %key, "group.deleted");
        Ok(())
    }

    fn validate_group(&self, mut group: Group) -> Result<Group, StoreError> {
        group.group_id = normalize_group_id(&group.group_id);
        if !is_valid_group_id(&group.group_id) {
            return Err(StoreError::invalid("groupId", "must be 10-25 digits"));
        }
        validate_name(&group.name)?;
        group.group_type = group.group_type.to_uppercase();
        let doc = self.inner.lock();
        let types = allowed_types(&DEFAULT_GROUP_TYPES, &doc.custom_group_types);
        drop(doc);
        if !types.contains(&group.group_type) {
            return Err(StoreError::invalid(
                "type",
                format!("unknown group type {}", group.group_type),
            ));
        }
        Ok(group)
    }

    /// Look up a group by normalized id. Normalization happens on both
    /// sides, so `X` and `X@g.us` collide.
    pub fn find_group(&self, group_id: &str) -> Option<Group> {
        let key = normalize_group_id(group_id);
        let doc = self.inner.lock();
        doc.allowed_groups
            .iter()
            .find(|g| normalize_group_id(&g.group_id) == key)
            .cloned()
    }

    // ── Destinations & types ─────────────────────────────────

    /// The effective default destination: environment wins.
    pub fn default_webhook_url(&self) -> Option<String> {
        self.env_webhook_url
            .clone()
            .or_else(|| self.inner.lock().webhook_url.clone())
    }

    pub fn set_default_webhook(&self, url: &str) -> Result<(), StoreError> {
        validate_url(url)?;
        let mut doc = self.inner.lock();
        doc.webhook_url = Some(url.to_string());
        self.persist_or_storage_err(&doc)?;
        Ok(())
    }

    pub fn type_webhooks(&self) -> HashMap<String, String> {
        self.inner.lock().type_webhooks.clone()
    }

    /// Destination for an entity type, when routed explicitly.
    pub fn type_webhook(&self, entity_type: &str) -> Option<String> {
        self.inner
            .lock()
            .type_webhooks
            .get(entity_type)
            .filter(|url| !url.is_empty())
            .cloned()
    }

    pub fn set_type_webhooks(&self, map: HashMap<String, String>) -> Result<(), StoreError> {
        for (entity_type, url) in &map {
            if url.is_empty() {
                continue;
            }
            validate_url(url).map_err(|_| {
                StoreError::invalid("typeWebhooks", format!("invalid URL for {entity_type}"))
            })?;
        }
        let mut doc = self.inner.lock();
        doc.type_webhooks = map
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        self.persist_or_storage_err(&doc)?;
        Ok(())
    }

    pub fn custom_types(&self) -> (Vec<String>, Vec<String>) {
        let doc = self.inner.lock();
        (
            doc.custom_contact_types.clone(),
            doc.custom_group_types.clone(),
        )
    }

    pub fn set_custom_types(
        &self,
        contact_types: Vec<String>,
        group_types: Vec<String>,
    ) -> Result<(), StoreError> {
        let clean = |types: Vec<String>| -> Result<Vec<String>, StoreError> {
            let mut out = Vec::new();
            for t in types {
                let t = t.trim().to_uppercase();
                if t.is_empty() || t.len() > 30 || !t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(StoreError::invalid("customTypes", format!("bad type name {t:?}")));
                }
                if !out.contains(&t) {
                    out.push(t);
                }
            }
            Ok(out)
        };
        let contact_types = clean(contact_types)?;
        let group_types = clean(group_types)?;
        let mut doc = self.inner.lock();
        doc.custom_contact_types = contact_types;
        doc.custom_group_types = group_types;
        self.persist_or_storage_err(&doc)?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn allowed_types(defaults: &[&str], custom: &[String]) -> Vec<String> {
    defaults
        .iter()
        .map(|t| (*t).to_string())
        .chain(custom.iter().cloned())
        .collect()
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let len = name.trim().chars().count();
    if !(2..=50).contains(&len) {
        return Err(StoreError::invalid("name", "must be 2-50 characters"));
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<(), StoreError> {
    reqwest::Url::parse(url)
        .map(|_| ())
        .map_err(|e| StoreError::invalid("url", e.to_string()))
}
