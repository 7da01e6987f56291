//! Job handlers of the messaging pipeline.
//!
//! | Queue | Kind | Handler |
//! |-------|------|---------|
//! | `messages` | `message.send` | [`DeliveryWorker`] |
//! | `inbound` | `inbound.process` | [`IngestionWorker`] |
//! | `inbound` | `inbound.enrich` | [`EnrichmentWorker`] |
//! | `campaigns` | `campaign.*` | [`CampaignOrchestrator`] |
//! | `outgoing-webhooks` | `webhook.send` | [`WebhookDispatcher`] |
//!
//! Handlers never decide job state themselves; they return a
//! [`JobResult`](crate::jobs::JobResult) and the broker records it.

use crate::jobs::QueueError;
use crate::store::StoreError;

pub mod campaign;
pub mod delivery;
pub mod enrichment;
pub mod ingestion;
pub mod webhook;

pub use campaign::{
    BatchOutcome, CampaignConfig, CampaignOrchestrator, CampaignReport, LaunchCampaign,
    LaunchOutcome, ProcessBatch, RecordOutcome,
};
pub use delivery::{DeliveryConfig, DeliveryOutcome, DeliveryWorker, SendMessage};
pub use enrichment::{EnrichMessage, EnrichmentWorker};
pub use ingestion::{
    FollowUp, IngestOutcome, IngestReport, IngestionWorker, Ingestor, ProcessInbound,
};
pub use webhook::{
    HttpTransport, SendWebhook, TransportError, WebhookDispatcher, WebhookRequest,
    WebhookTransport, fan_out, sign_payload,
};

/// Error raised by a handler step; the handler maps it to a retry.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Deterministic de-duplication and group keys.
pub mod keys {
    use courier_core::{CampaignId, MessageId, SubscriptionId, TenantId};
    use courier_messaging::CampaignCounter;

    pub fn message(id: MessageId) -> String {
        format!("msg:{id}")
    }

    pub fn campaign_group(id: CampaignId) -> String {
        format!("campaign:{id}")
    }

    pub fn campaign_launch(id: CampaignId) -> String {
        format!("campaign:{id}:launch")
    }

    pub fn campaign_batch(id: CampaignId, batch_number: u32) -> String {
        format!("campaign:{id}:batch:{batch_number}")
    }

    pub fn campaign_outcome(id: CampaignId, message: MessageId, counter: CampaignCounter) -> String {
        let counter = match counter {
            CampaignCounter::Sent => "sent",
            CampaignCounter::Delivered => "delivered",
            CampaignCounter::Read => "read",
            CampaignCounter::Failed => "failed",
        };
        format!("campaign:{id}:outcome:{message}:{counter}")
    }

    pub fn inbound(tenant_id: TenantId, digest: &str) -> String {
        format!("inbound:{tenant_id}:{digest}")
    }

    pub fn enrichment(message: MessageId) -> String {
        format!("enrich:{message}")
    }

    pub fn webhook(subscription: SubscriptionId, event: &str, subject: &str) -> String {
        format!("webhook:{subscription}:{event}:{subject}")
    }
}
