use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{SubscriptionId, TenantId};

/// Event name a subscription uses to receive every platform event.
pub const ALL_EVENTS: &str = "*";

/// A tenant-registered receiver of platform events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub url: String,
    pub secret: String,
    pub events: BTreeSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn new(
        tenant_id: TenantId,
        url: impl Into<String>,
        secret: impl Into<String>,
        events: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            tenant_id,
            url: url.into(),
            secret: secret.into(),
            events: events.into_iter().map(Into::into).collect(),
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn matches(&self, event: &str) -> bool {
        self.active && (self.events.contains(event) || self.events.contains(ALL_EVENTS))
    }
}
