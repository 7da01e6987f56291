use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{ContactId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    OptedIn,
    OptedOut,
    #[default]
    Pending,
}

/// A phone number known to a tenant. Unique per (tenant, phone number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub phone_number: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub consent: ConsentStatus,
    pub last_interaction_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages_received: u64,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(tenant_id: TenantId, phone_number: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: ContactId::new(),
            tenant_id,
            phone_number: phone_number.into(),
            first_name: None,
            last_name: None,
            email: None,
            custom_fields: BTreeMap::new(),
            tags: BTreeSet::new(),
            consent: ConsentStatus::default(),
            last_interaction_at: None,
            messages_received: 0,
            created_at: at,
        }
    }

    /// Contact created from an inbound message; the provider profile name is split
    /// into first name and the remainder as last name.
    pub fn from_profile(
        tenant_id: TenantId,
        phone_number: impl Into<String>,
        profile_name: Option<&str>,
        at: DateTime<Utc>,
    ) -> Self {
        let mut contact = Self::new(tenant_id, phone_number, at);
        if let Some(name) = profile_name {
            let mut parts = name.split_whitespace();
            contact.first_name = parts.next().map(str::to_string);
            let rest = parts.collect::<Vec<_>>().join(" ");
            if !rest.is_empty() {
                contact.last_name = Some(rest);
            }
        }
        contact
    }

    pub fn full_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
            (Some(f), None) => Some(f.clone()),
            (None, Some(l)) => Some(l.clone()),
            (None, None) => None,
        }
    }

    /// Value of a named (built-in) field, if set.
    pub fn named_field(&self, name: &str) -> Option<String> {
        match name {
            "first_name" => self.first_name.clone(),
            "last_name" => self.last_name.clone(),
            "full_name" | "name" => self.full_name(),
            "phone_number" | "phone" => Some(self.phone_number.clone()),
            "email" => self.email.clone(),
            _ => None,
        }
    }

    pub fn record_inbound(&mut self, at: DateTime<Utc>) {
        self.messages_received += 1;
        if self.last_interaction_at.is_none_or(|last| last < at) {
            self.last_interaction_at = Some(at);
        }
    }

    pub fn can_receive_campaigns(&self) -> bool {
        self.consent != ConsentStatus::OptedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_name_is_split() {
        let c = Contact::from_profile(TenantId::new(), "+1555", Some("Ada  King Lovelace"), Utc::now());
        assert_eq!(c.first_name.as_deref(), Some("Ada"));
        assert_eq!(c.last_name.as_deref(), Some("King Lovelace"));
        assert_eq!(c.full_name().as_deref(), Some("Ada King Lovelace"));
    }

    #[test]
    fn missing_profile_leaves_names_empty() {
        let c = Contact::from_profile(TenantId::new(), "+1555", None, Utc::now());
        assert!(c.first_name.is_none() && c.last_name.is_none());
        assert_eq!(c.named_field("phone_number").as_deref(), Some("+1555"));
        assert_eq!(c.named_field("first_name"), None);
    }

    #[test]
    fn inbound_touches_counters() {
        let mut c = Contact::new(TenantId::new(), "+1555", Utc::now());
        let at = Utc::now();
        c.record_inbound(at);
        c.record_inbound(at);
        assert_eq!(c.messages_received, 2);
        assert_eq!(c.last_interaction_at, Some(at));
    }
}
