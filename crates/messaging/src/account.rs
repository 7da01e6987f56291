//! Provider sending identities and per-tenant settings.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{AccountId, TenantId};

/// Default daily send quota for a new account.
pub const DEFAULT_DAILY_LIMIT: u32 = 1000;

/// A tenant-owned sending identity (one registered phone number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub tenant_id: TenantId,
    /// Provider-side identifier; inbound webhooks are routed by it.
    pub phone_number_id: String,
    pub display_phone_number: String,
    pub daily_limit: u32,
    pub daily_sent: u32,
    /// UTC day the `daily_sent` counter belongs to.
    pub quota_day: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Outcome of trying to consume one unit of daily quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum QuotaDecision {
    Granted { remaining: u32 },
    Exhausted { resets_at: DateTime<Utc> },
}

impl Account {
    pub fn new(
        tenant_id: TenantId,
        phone_number_id: impl Into<String>,
        display_phone_number: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AccountId::new(),
            tenant_id,
            phone_number_id: phone_number_id.into(),
            display_phone_number: display_phone_number.into(),
            daily_limit: DEFAULT_DAILY_LIMIT,
            daily_sent: 0,
            quota_day: now.date_naive(),
            access_token: None,
        }
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = limit;
        self
    }

    /// Consume one send from today's quota, rolling the window over at UTC midnight.
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> QuotaDecision {
        let today = now.date_naive();
        if self.quota_day != today {
            self.quota_day = today;
            self.daily_sent = 0;
        }
        if self.daily_sent >= self.daily_limit {
            return QuotaDecision::Exhausted {
                resets_at: next_midnight(today),
            };
        }
        self.daily_sent += 1;
        QuotaDecision::Granted {
            remaining: self.daily_limit - self.daily_sent,
        }
    }
}

pub fn next_midnight(day: NaiveDate) -> DateTime<Utc> {
    day.checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-tenant switches and secrets consulted by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub ai_enabled: bool,
    /// Overrides the global inbound verify token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_token: Option<String>,
    /// Overrides the global inbound app secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
}
