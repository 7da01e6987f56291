//! Outgoing webhook fan-out and dispatch.
//!
//! Each matching subscription gets its own `webhook.send` job, so one slow or
//! failing receiver never holds up another. The body is signed with the
//! subscription secret: `X-Webhook-Signature: sha256=<hex hmac-sha256(secret, body)>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use courier_core::{SubscriptionId, TenantId};
use courier_events::{PlatformEvent, TenantScoped};

use super::{WorkerError, keys};
use crate::jobs::{Job, JobHandler, JobKind, JobOptions, JobQueue, JobResult, RetryPolicy};
use crate::store::{StoreError, Stores};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Payload of a `webhook.send` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendWebhook {
    pub subscription_id: SubscriptionId,
    pub url: String,
    pub secret: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl SendWebhook {
    pub fn into_job(self, tenant_id: TenantId, subject: &str, retry: RetryPolicy) -> Result<Job, WorkerError> {
        let options = JobOptions::default()
            .dedup(keys::webhook(self.subscription_id, &self.event, subject))
            .retry(retry);
        Ok(Job::new(tenant_id, JobKind::SendOutgoing, serde_json::to_value(&self)?).with_options(options))
    }
}

/// Default delivery policy: 5 attempts, exponential backoff from 5 s.
pub fn default_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(5, Duration::from_secs(5), Duration::from_secs(300))
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Enqueue one delivery job per active subscription of the tenant matching the event.
pub async fn fan_out(
    stores: &Stores,
    queue: &dyn JobQueue,
    tenant_id: TenantId,
    event: &PlatformEvent,
    retry: &RetryPolicy,
) -> Result<usize, WorkerError> {
    if event.tenant_id() != tenant_id {
        warn!(tenant_id = %tenant_id, event_tenant_id = %event.tenant_id(), "event does not belong to the tenant");
        return Err(StoreError::TenantIsolation.into());
    }
    let subscriptions = stores.subscriptions.list_matching(tenant_id, event.name()).await?;
    if subscriptions.is_empty() {
        return Ok(0);
    }

    let payload = serde_json::to_value(event)?;
    let subject = event.subject();
    let mut jobs = Vec::with_capacity(subscriptions.len());
    for subscription in subscriptions {
        let send = SendWebhook {
            subscription_id: subscription.id,
            url: subscription.url,
            secret: subscription.secret,
            event: event.name().to_string(),
            payload: payload.clone(),
        };
        jobs.push(send.into_job(tenant_id, &subject, retry.clone())?);
    }

    let handles = queue.enqueue_bulk(jobs).await?;
    let created = handles.iter().filter(|h| h.created).count();
    debug!(tenant_id = %tenant_id, event = event.name(), created, "webhook fan-out");
    Ok(created)
}

/// A signed request ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("webhook request timed out")]
    Timeout,
    #[error("webhook request failed: {0}")]
    Network(String),
    #[error("webhook receiver answered {0}")]
    Status(u16),
}

/// HTTP capability used to deliver webhooks.
#[async_trait]
pub trait WebhookTransport: Send + Sync + 'static {
    /// POST the request; returns the response status code.
    async fn post(&self, request: &WebhookRequest) -> Result<u16, TransportError>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, request: &WebhookRequest) -> Result<u16, TransportError> {
        let mut builder = self.client.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        Ok(response.status().as_u16())
    }
}

/// Handles `webhook.send` jobs.
pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
}

impl WebhookDispatcher {
    pub fn new(transport: Arc<dyn WebhookTransport>) -> Self {
        Self { transport }
    }

    /// Build the signed request for a job payload.
    pub fn request(send: &SendWebhook, timestamp_ms: i64) -> Result<WebhookRequest, WorkerError> {
        let body = serde_json::to_vec(&send.payload)?;
        let signature = sign_payload(&send.secret, &body);
        Ok(WebhookRequest {
            url: send.url.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                (SIGNATURE_HEADER.to_string(), signature),
                (EVENT_HEADER.to_string(), send.event.clone()),
                (TIMESTAMP_HEADER.to_string(), timestamp_ms.to_string()),
            ],
            body,
        })
    }

    /// Sign and POST one event. Any non-2xx answer is an error.
    pub async fn deliver(&self, send: &SendWebhook) -> Result<(), TransportError> {
        let request = Self::request(send, Utc::now().timestamp_millis())
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = self.transport.post(&request).await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(TransportError::Status(status))
        }
    }
}

#[async_trait]
impl JobHandler for WebhookDispatcher {
    async fn handle(&self, job: &Job) -> JobResult {
        let send: SendWebhook = match job.payload() {
            Ok(send) => send,
            Err(err) => return JobResult::Abandon(format!("invalid webhook payload: {err}")),
        };

        match self.deliver(&send).await {
            Ok(()) => {
                info!(
                    tenant_id = %job.tenant_id,
                    subscription_id = %send.subscription_id,
                    event = %send.event,
                    "webhook delivered"
                );
                JobResult::Success
            }
            Err(err) => {
                warn!(
                    tenant_id = %job.tenant_id,
                    job_id = %job.id,
                    subscription_id = %send.subscription_id,
                    attempt = job.attempt,
                    error = %err,
                    "webhook delivery failed"
                );
                JobResult::Failure(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn send() -> SendWebhook {
        SendWebhook {
            subscription_id: SubscriptionId::new(),
            url: "https://tenant.example/hooks".into(),
            secret: "s3cret".into(),
            event: "message.received".into(),
            payload: json!({ "event": "message.received", "data": { "id": 1 } }),
        }
    }

    #[test]
    fn signature_is_hex_hmac_of_exact_body() {
        // RFC 4231 test case 2
        let sig = sign_payload("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn request_carries_signature_event_and_timestamp() {
        let send = send();
        let request = WebhookDispatcher::request(&send, 1_700_000_000_000).unwrap();

        assert_eq!(request.header("x-webhook-event"), Some("message.received"));
        assert_eq!(request.header(TIMESTAMP_HEADER), Some("1700000000000"));
        assert_eq!(
            request.header(SIGNATURE_HEADER),
            Some(sign_payload("s3cret", &request.body).as_str())
        );
        assert_eq!(request.header("content-type"), Some("application/json"));
    }

    struct Always(Result<u16, TransportError>);

    #[async_trait]
    impl WebhookTransport for Always {
        async fn post(&self, _request: &WebhookRequest) -> Result<u16, TransportError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn non_2xx_and_timeouts_fail_the_job() {
        let tenant = TenantId::new();
        let job = send().into_job(tenant, "wamid.1", default_retry_policy()).unwrap();

        let ok = WebhookDispatcher::new(Arc::new(Always(Ok(204))));
        assert_eq!(ok.handle(&job).await, JobResult::Success);

        let rejected = WebhookDispatcher::new(Arc::new(Always(Ok(500))));
        assert!(matches!(rejected.handle(&job).await, JobResult::Failure(_)));

        let timeout = WebhookDispatcher::new(Arc::new(Always(Err(TransportError::Timeout))));
        assert!(matches!(timeout.handle(&job).await, JobResult::Failure(_)));
    }

    #[test]
    fn job_dedup_key_names_subscription_event_and_subject() {
        let send = send();
        let sub = send.subscription_id;
        let job = send.into_job(TenantId::new(), "wamid.1", default_retry_policy()).unwrap();
        assert_eq!(
            job.dedup_key,
            Some(format!("webhook:{sub}:message.received:wamid.1"))
        );
        assert_eq!(job.kind, JobKind::SendOutgoing);
        assert_eq!(job.retry_policy.max_attempts, 5);
    }

    fn status_event(tenant_id: TenantId) -> PlatformEvent {
        PlatformEvent::MessageStatusUpdated(courier_events::MessageStatusUpdated {
            tenant_id,
            message_id: courier_core::MessageId::new(),
            conversation_id: courier_core::ConversationId::new(),
            provider_message_id: "wamid.7".into(),
            campaign_id: None,
            status: courier_messaging::MessageStatus::Read,
            timestamp: Utc::now(),
            error: None,
        })
    }

    #[tokio::test]
    async fn fan_out_enqueues_one_job_per_matching_subscription() {
        use crate::jobs::{InMemoryJobQueue, queues};
        use courier_messaging::WebhookSubscription;

        let tenant = TenantId::new();
        let stores = Stores::in_memory();
        for (url, events) in [
            ("https://a.example/hook", vec!["message.status_updated"]),
            ("https://b.example/hook", vec!["message.status_updated", "message.received"]),
            ("https://c.example/hook", vec!["message.received"]),
        ] {
            stores
                .subscriptions
                .upsert(WebhookSubscription::new(tenant, url, "s", events))
                .await
                .unwrap();
        }
        let queue = InMemoryJobQueue::new();
        let event = status_event(tenant);

        let created = fan_out(&stores, &queue, tenant, &event, &default_retry_policy()).await.unwrap();
        assert_eq!(created, 2);
        // the same occurrence again adds nothing
        let again = fan_out(&stores, &queue, tenant, &event, &default_retry_policy()).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(queue.waiting(queues::OUTGOING_WEBHOOKS).unwrap().len(), 2);

        let foreign = fan_out(&stores, &queue, TenantId::new(), &event, &default_retry_policy()).await;
        assert!(matches!(foreign, Err(WorkerError::Store(StoreError::TenantIsolation))));
    }
}
