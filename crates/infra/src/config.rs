//! Process configuration, read from environment variables with typed defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::inbound::InboundSecrets;
use crate::workers::{CampaignConfig, DeliveryConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Memory,
    Redis,
}

/// Worker count per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concurrency {
    pub delivery: usize,
    pub ingestion: usize,
    pub campaign: usize,
    pub webhook: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            delivery: 10,
            ingestion: 20,
            campaign: 5,
            webhook: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub bind_addr: String,
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub broker: BrokerBackend,
    pub redis_url: String,
    pub secrets: InboundSecrets,
    /// Fallback provider access token for accounts without their own.
    pub provider_token: Option<String>,
    pub concurrency: Concurrency,
    pub account_rate_per_sec: u32,
    pub account_daily_limit: u32,
    pub campaign: CampaignConfig,
    pub provider_timeout: Duration,
    pub ai_timeout: Duration,
    pub webhook_timeout: Duration,
    /// Finished jobs older than this are purged from the broker.
    pub job_retention: Duration,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            store: StoreBackend::Memory,
            database_url: None,
            broker: BrokerBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            secrets: InboundSecrets::default(),
            provider_token: None,
            concurrency: Concurrency::default(),
            account_rate_per_sec: 80,
            account_daily_limit: courier_messaging::account::DEFAULT_DAILY_LIMIT,
            campaign: CampaignConfig::default(),
            provider_timeout: Duration::from_secs(30),
            ai_timeout: Duration::from_secs(15),
            webhook_timeout: Duration::from_secs(30),
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let store = match env.get("COURIER_STORE").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("postgres") => StoreBackend::Postgres,
            Some(other) => return Err(invalid("COURIER_STORE", other)),
        };
        let broker = match env.get("COURIER_BROKER").as_deref() {
            None | Some("memory") => BrokerBackend::Memory,
            Some("redis") => BrokerBackend::Redis,
            Some(other) => return Err(invalid("COURIER_BROKER", other)),
        };
        let database_url = env.get("DATABASE_URL");
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let campaign = CampaignConfig {
            batch_size: env.parse("COURIER_CAMPAIGN_BATCH_SIZE", defaults.campaign.batch_size)?.max(1),
            pause_every: env.parse("COURIER_CAMPAIGN_PAUSE_EVERY", defaults.campaign.pause_every)?,
            enqueue_pause: env.millis("COURIER_CAMPAIGN_PAUSE_MS", defaults.campaign.enqueue_pause)?,
            ..defaults.campaign
        };

        Ok(Self {
            bind_addr: env.get("COURIER_BIND_ADDR").unwrap_or(defaults.bind_addr),
            store,
            database_url,
            broker,
            redis_url: env.get("REDIS_URL").unwrap_or(defaults.redis_url),
            secrets: InboundSecrets {
                verify_token: env.get("META_WEBHOOK_VERIFY_TOKEN"),
                app_secret: env.get("META_APP_SECRET"),
            },
            provider_token: env.get("META_ACCESS_TOKEN"),
            concurrency: Concurrency {
                delivery: env.parse("COURIER_DELIVERY_CONCURRENCY", defaults.concurrency.delivery)?,
                ingestion: env.parse("COURIER_INGESTION_CONCURRENCY", defaults.concurrency.ingestion)?,
                campaign: env.parse("COURIER_CAMPAIGN_CONCURRENCY", defaults.concurrency.campaign)?,
                webhook: env.parse("COURIER_WEBHOOK_CONCURRENCY", defaults.concurrency.webhook)?,
            },
            account_rate_per_sec: env.parse("COURIER_ACCOUNT_RATE_PER_SEC", defaults.account_rate_per_sec)?,
            account_daily_limit: env.parse("COURIER_ACCOUNT_DAILY_LIMIT", defaults.account_daily_limit)?,
            campaign,
            provider_timeout: env.millis("COURIER_PROVIDER_TIMEOUT_MS", defaults.provider_timeout)?,
            ai_timeout: env.millis("COURIER_AI_TIMEOUT_MS", defaults.ai_timeout)?,
            webhook_timeout: env.millis("COURIER_WEBHOOK_TIMEOUT_MS", defaults.webhook_timeout)?,
            job_retention: Duration::from_secs(
                env.parse("COURIER_JOB_RETENTION_SECS", defaults.job_retention.as_secs())?,
            ),
        })
    }

    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            provider_timeout: self.provider_timeout,
        }
    }
}

fn invalid(var: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Set and non-blank.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(var) {
            Some(raw) => raw.trim().parse().map_err(|_| invalid(var, &raw)),
            None => Ok(default),
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = default.as_millis() as u64;
        self.parse(var, default_ms).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<CourierConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CourierConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn unset_environment_gives_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.broker, BrokerBackend::Memory);
        assert_eq!(config.concurrency, Concurrency::default());
        assert_eq!(config.account_rate_per_sec, 80);
        assert_eq!(config.campaign.batch_size, 100);
        assert_eq!(config.ai_timeout, Duration::from_secs(15));
        assert!(config.secrets.app_secret.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("COURIER_BROKER", "redis"),
            ("REDIS_URL", "redis://queue:6379"),
            ("COURIER_DELIVERY_CONCURRENCY", "3"),
            ("COURIER_CAMPAIGN_BATCH_SIZE", "25"),
            ("COURIER_PROVIDER_TIMEOUT_MS", "500"),
            ("META_APP_SECRET", "s3cret"),
        ])
        .unwrap();
        assert_eq!(config.broker, BrokerBackend::Redis);
        assert_eq!(config.redis_url, "redis://queue:6379");
        assert_eq!(config.concurrency.delivery, 3);
        assert_eq!(config.campaign.batch_size, 25);
        assert_eq!(config.delivery().provider_timeout, Duration::from_millis(500));
        assert_eq!(config.secrets.app_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            config(&[("COURIER_ACCOUNT_RATE_PER_SEC", "fast")]),
            Err(ConfigError::Invalid { var: "COURIER_ACCOUNT_RATE_PER_SEC", .. })
        ));
        assert!(matches!(config(&[("COURIER_STORE", "sqlite")]), Err(ConfigError::Invalid { .. })));
        assert_eq!(
            config(&[("COURIER_STORE", "postgres")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }
}
