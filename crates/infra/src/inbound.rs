//! Acceptance of provider webhooks.
//!
//! The HTTP layer hands over the raw body; this module verifies it, resolves the
//! owning tenant for each change and enqueues one `inbound.process` job per change.
//! Nothing is ingested inline.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use courier_core::TenantId;
use courier_events::{Change, WebhookPayload};

use crate::jobs::{Job, JobKind, JobOptions, JobQueue, QueueError};
use crate::store::{StoreError, Stores};
use crate::workers::{ProcessInbound, keys};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("webhook verification failed")]
    VerificationFailed,
    #[error("malformed webhook payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Process-wide fallbacks for the per-tenant verify token and app secret.
#[derive(Debug, Clone, Default)]
pub struct InboundSecrets {
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
}

/// `Some(challenge)` when the subscription handshake matches.
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected: Option<&str>,
) -> Option<String> {
    match (mode, token, expected) {
        (Some("subscribe"), Some(token), Some(expected)) if token == expected => {
            challenge.map(str::to_string)
        }
        _ => None,
    }
}

/// Constant-time check of a `sha256=<hex>` signature over the raw body.
pub fn verify_signature(secret: &str, header: &str, body: &[u8]) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// What an accepted webhook turned into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcceptReport {
    pub enqueued: usize,
    /// Changes already accepted earlier (provider redelivery).
    pub duplicates: usize,
    /// Changes whose account could not be resolved.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct InboundGateway {
    stores: Stores,
    queue: Arc<dyn JobQueue>,
    secrets: InboundSecrets,
}

impl InboundGateway {
    pub fn new(stores: Stores, queue: Arc<dyn JobQueue>, secrets: InboundSecrets) -> Self {
        Self {
            stores,
            queue,
            secrets,
        }
    }

    /// Answer the GET handshake. The tenant's own token wins over the global one.
    pub async fn verify(
        &self,
        tenant_hint: Option<TenantId>,
        mode: Option<&str>,
        token: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<String, InboundError> {
        let tenant_token = match tenant_hint {
            Some(tenant_id) => self
                .stores
                .tenants
                .settings(tenant_id)
                .await?
                .and_then(|s| s.verify_token),
            None => None,
        };
        let expected = tenant_token.or_else(|| self.secrets.verify_token.clone());
        verify_subscription(mode, token, challenge, expected.as_deref()).ok_or_else(|| {
            warn!(tenant_id = ?tenant_hint, "webhook verification failed");
            InboundError::VerificationFailed
        })
    }

    async fn app_secret(&self, tenant_hint: Option<TenantId>) -> Result<Option<String>, InboundError> {
        let tenant_secret = match tenant_hint {
            Some(tenant_id) => self
                .stores
                .tenants
                .settings(tenant_id)
                .await?
                .and_then(|s| s.app_secret),
            None => None,
        };
        Ok(tenant_secret.or_else(|| self.secrets.app_secret.clone()))
    }

    /// Verify, parse and enqueue a webhook delivery.
    pub async fn accept(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        tenant_hint: Option<TenantId>,
    ) -> Result<AcceptReport, InboundError> {
        if let Some(signature) = signature {
            match self.app_secret(tenant_hint).await? {
                Some(secret) if !verify_signature(&secret, signature, raw_body) => {
                    warn!(tenant_id = ?tenant_hint, "invalid webhook signature");
                    return Err(InboundError::InvalidSignature);
                }
                Some(_) => {}
                None => warn!("no app secret configured, signature not verified"),
            }
        }

        let payload: WebhookPayload = serde_json::from_slice(raw_body)?;
        let mut report = AcceptReport::default();
        for change in payload.changes() {
            match self.enqueue_change(change, tenant_hint).await? {
                Some(true) => report.enqueued += 1,
                Some(false) => report.duplicates += 1,
                None => report.skipped += 1,
            }
        }
        debug!(
            object = %payload.object,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            skipped = report.skipped,
            "webhook accepted"
        );
        Ok(report)
    }

    /// `None` when the change cannot be attributed to a tenant account.
    async fn enqueue_change(&self, change: &Change, tenant_hint: Option<TenantId>) -> Result<Option<bool>, InboundError> {
        let phone_number_id = &change.value.metadata.phone_number_id;
        let Some(account) = self.stores.accounts.find_by_phone_number_id(phone_number_id).await? else {
            warn!(phone_number_id = %phone_number_id, "no account for phone number id");
            return Ok(None);
        };
        if tenant_hint.is_some_and(|tenant_id| tenant_id != account.tenant_id) {
            warn!(
                phone_number_id = %phone_number_id,
                tenant_id = ?tenant_hint,
                "phone number id belongs to another tenant"
            );
            return Ok(None);
        }

        let digest = hex::encode(Sha256::digest(serde_json::to_vec(change)?));
        let request = ProcessInbound {
            account_id: account.id,
            value: change.value.clone(),
        };
        let job = Job::new(account.tenant_id, JobKind::ProcessInbound, serde_json::to_value(&request)?)
            .with_options(JobOptions::default().dedup(keys::inbound(account.tenant_id, &digest)));
        let handle = self.queue.enqueue(job).await?;
        if handle.created {
            info!(tenant_id = %account.tenant_id, job_id = %handle.id, field = %change.field, "inbound change queued");
        }
        Ok(Some(handle.created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobQueue, queues};
    use crate::workers::sign_payload;
    use chrono::Utc;
    use courier_messaging::{Account, TenantSettings};
    use serde_json::json;

    fn body(phone_number_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "metadata": { "phone_number_id": phone_number_id },
                        "messages": [{ "from": "+1555", "id": "wamid.1", "timestamp": "1700000000", "type": "text", "text": { "body": "hi" } }]
                    }
                }]
            }]
        }))
        .unwrap()
    }

    async fn gateway(secrets: InboundSecrets) -> (InboundGateway, Arc<InMemoryJobQueue>, Account) {
        let stores = Stores::in_memory();
        let account = Account::new(TenantId::new(), "PNID-1", "+15550000000", Utc::now());
        stores.accounts.upsert(account.clone()).await.unwrap();
        let queue = InMemoryJobQueue::arc();
        (InboundGateway::new(stores, queue.clone(), secrets), queue, account)
    }

    #[test]
    fn handshake_requires_subscribe_mode_and_matching_token() {
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("tok"), Some("42"), Some("tok")),
            Some("42".to_string())
        );
        assert_eq!(verify_subscription(Some("subscribe"), Some("bad"), Some("42"), Some("tok")), None);
        assert_eq!(verify_subscription(Some("unsubscribe"), Some("tok"), Some("42"), Some("tok")), None);
        assert_eq!(verify_subscription(Some("subscribe"), Some("tok"), Some("42"), None), None);
    }

    #[test]
    fn signature_check_accepts_only_the_exact_body() {
        let body = br#"{"object":"x"}"#;
        let header = sign_payload("secret", body);
        assert!(verify_signature("secret", &header, body));
        assert!(!verify_signature("other", &header, body));
        assert!(!verify_signature("secret", &header, br#"{"object":"y"}"#));
        assert!(!verify_signature("secret", "sha256=zz", body));
        assert!(!verify_signature("secret", "md5=00", body));
    }

    #[tokio::test]
    async fn accepted_changes_are_queued_once() {
        let (gateway, queue, account) = gateway(InboundSecrets::default()).await;
        let body = body("PNID-1");

        let report = gateway.accept(&body, None, None).await.unwrap();
        assert_eq!(report.enqueued, 1);
        let again = gateway.accept(&body, None, None).await.unwrap();
        assert_eq!(again.duplicates, 1);

        let jobs = queue.waiting(queues::INBOUND).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].tenant_id, account.tenant_id);
        let request: ProcessInbound = jobs[0].payload().unwrap();
        assert_eq!(request.account_id, account.id);
    }

    #[tokio::test]
    async fn unknown_phone_number_ids_and_foreign_tenants_are_skipped() {
        let (gateway, queue, _) = gateway(InboundSecrets::default()).await;

        let unknown = gateway.accept(&body("PNID-404"), None, None).await.unwrap();
        assert_eq!(unknown.skipped, 1);
        let foreign = gateway
            .accept(&body("PNID-1"), None, Some(TenantId::new()))
            .await
            .unwrap();
        assert_eq!(foreign.skipped, 1);
        assert!(queue.waiting(queues::INBOUND).unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_when_a_secret_is_known() {
        let secrets = InboundSecrets {
            verify_token: None,
            app_secret: Some("global".into()),
        };
        let (gateway, _, _) = gateway(secrets).await;
        let body = body("PNID-1");

        let err = gateway.accept(&body, Some("sha256=00"), None).await.unwrap_err();
        assert!(matches!(err, InboundError::InvalidSignature));

        let good = sign_payload("global", &body);
        assert_eq!(gateway.accept(&body, Some(&good), None).await.unwrap().enqueued, 1);
    }

    #[tokio::test]
    async fn tenant_verify_token_overrides_global() {
        let secrets = InboundSecrets {
            verify_token: Some("global".into()),
            app_secret: None,
        };
        let (gateway, _, account) = gateway(secrets).await;
        gateway
            .stores
            .tenants
            .upsert_settings(TenantSettings {
                tenant_id: account.tenant_id,
                verify_token: Some("mine".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let hint = Some(account.tenant_id);
        assert_eq!(
            gateway.verify(hint, Some("subscribe"), Some("mine"), Some("c")).await.unwrap(),
            "c"
        );
        assert!(gateway.verify(hint, Some("subscribe"), Some("global"), Some("c")).await.is_err());
        assert!(gateway.verify(None, Some("subscribe"), Some("global"), Some("c")).await.is_ok());
    }
}
