//! AI enrichment of inbound text messages (`inbound.enrich`, single attempt).
//!
//! Enrichment never fails a job: errors and timeouts are logged and the message
//! simply stays without an insight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use courier_ai::{AiError, AnalysisContext, MessageAnalyzer};
use courier_core::{MessageId, TenantId};
use courier_messaging::Insight;

use super::{WorkerError, keys};
use crate::jobs::{Job, JobHandler, JobKind, JobOptions, JobResult, RetryPolicy};
use crate::store::Stores;

/// Payload of an `inbound.enrich` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichMessage {
    pub message_id: MessageId,
}

impl EnrichMessage {
    pub fn into_job(self, tenant_id: TenantId) -> Result<Job, WorkerError> {
        let options = JobOptions::default()
            .dedup(keys::enrichment(self.message_id))
            .retry(RetryPolicy::no_retry());
        Ok(Job::new(tenant_id, JobKind::EnrichMessage, serde_json::to_value(self)?).with_options(options))
    }
}

/// Handles `inbound.enrich` jobs.
pub struct EnrichmentWorker {
    stores: Stores,
    analyzer: Arc<dyn MessageAnalyzer>,
    timeout: Duration,
}

impl EnrichmentWorker {
    pub fn new(stores: Stores, analyzer: Arc<dyn MessageAnalyzer>, timeout: Duration) -> Self {
        Self {
            stores,
            analyzer,
            timeout,
        }
    }

    /// Analyze the message and write the result onto it and its conversation.
    ///
    /// `Ok(None)` when there is nothing to do or the analyzer gave up.
    pub async fn enrich(&self, tenant_id: TenantId, request: &EnrichMessage) -> Result<Option<Insight>, WorkerError> {
        let Some(message) = self.stores.messages.get(tenant_id, request.message_id).await? else {
            return Ok(None);
        };
        let Some(text) = message.content.plain_text() else {
            return Ok(None);
        };
        if message.insight.is_some() {
            return Ok(None);
        }

        let contact_name = self
            .stores
            .contacts
            .get(tenant_id, message.contact_id)
            .await?
            .and_then(|c| c.full_name());
        let context = AnalysisContext {
            tenant_id,
            conversation_id: message.conversation_id,
            contact_name,
        };

        let analysis = match tokio::time::timeout(self.timeout, self.analyzer.analyze(text, &context)).await {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(err)) => {
                warn!(tenant_id = %tenant_id, message_id = %message.id, error = %err, "enrichment failed");
                return Ok(None);
            }
            Err(_) => {
                warn!(tenant_id = %tenant_id, message_id = %message.id, error = %AiError::Timeout, "enrichment failed");
                return Ok(None);
            }
        };

        let insight = analysis.into_insight(Utc::now());
        self.stores
            .messages
            .set_insight(tenant_id, message.id, insight.clone())
            .await?;
        self.stores
            .conversations
            .apply_insight(tenant_id, message.conversation_id, &insight)
            .await?;
        debug!(
            message_id = %message.id,
            sentiment = insight.sentiment.as_str(),
            intent = %insight.intent,
            replies = insight.suggested_replies.len(),
            "message enriched"
        );
        Ok(Some(insight))
    }
}

#[async_trait]
impl JobHandler for EnrichmentWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let request: EnrichMessage = match job.payload() {
            Ok(request) => request,
            Err(err) => return JobResult::Abandon(format!("invalid enrichment payload: {err}")),
        };
        if let Err(err) = self.enrich(job.tenant_id, &request).await {
            warn!(tenant_id = %job.tenant_id, message_id = %request.message_id, error = %err, "enrichment skipped");
        }
        JobResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_ai::{Analysis, LexiconAnalyzer};
    use courier_core::AccountId;
    use courier_messaging::{Contact, Message, MessageContent, Sentiment};

    struct Unavailable;

    #[async_trait]
    impl MessageAnalyzer for Unavailable {
        async fn analyze(&self, _text: &str, _context: &AnalysisContext) -> Result<Analysis, AiError> {
            Err(AiError::Unavailable("down".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl MessageAnalyzer for Slow {
        async fn analyze(&self, _text: &str, _context: &AnalysisContext) -> Result<Analysis, AiError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Analysis::neutral())
        }
    }

    async fn stored_message(stores: &Stores, tenant: TenantId, content: MessageContent) -> Message {
        let contact = Contact::new(tenant, "+15551234567", Utc::now());
        stores.contacts.upsert(contact.clone()).await.unwrap();
        let account = AccountId::new();
        let conversation = stores
            .conversations
            .get_or_open(tenant, contact.id, account, Utc::now())
            .await
            .unwrap();
        let message = Message::inbound(tenant, conversation.id, contact.id, account, "+15551234567", "wamid.1", content, Utc::now());
        stores.messages.insert(message).await.unwrap().into_inner()
    }

    #[tokio::test]
    async fn insight_lands_on_message_and_conversation() {
        let tenant = TenantId::new();
        let stores = Stores::in_memory();
        let message = stored_message(&stores, tenant, MessageContent::text("thanks, this is great!")).await;
        let worker = EnrichmentWorker::new(stores.clone(), Arc::new(LexiconAnalyzer::new()), Duration::from_secs(1));

        let job = EnrichMessage { message_id: message.id }.into_job(tenant).unwrap();
        assert_eq!(worker.handle(&job).await, JobResult::Success);

        let stored = stores.messages.get(tenant, message.id).await.unwrap().unwrap();
        assert_eq!(stored.insight.as_ref().map(|i| i.sentiment), Some(Sentiment::Positive));
        let replies = stored.insight.as_ref().map(|i| i.suggested_replies.clone()).unwrap_or_default();
        assert!(!replies.is_empty());
        assert!(replies.len() <= courier_ai::lexicon::MAX_REPLIES);
        let conversation = stores
            .conversations
            .get(tenant, message.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(conversation.insight.is_some());
    }

    #[tokio::test]
    async fn analyzer_errors_and_timeouts_leave_message_unenriched() {
        let tenant = TenantId::new();
        let stores = Stores::in_memory();
        let message = stored_message(&stores, tenant, MessageContent::text("hello")).await;
        let job = EnrichMessage { message_id: message.id }.into_job(tenant).unwrap();

        let failing = EnrichmentWorker::new(stores.clone(), Arc::new(Unavailable), Duration::from_secs(1));
        assert_eq!(failing.handle(&job).await, JobResult::Success);

        let slow = EnrichmentWorker::new(stores.clone(), Arc::new(Slow), Duration::from_millis(20));
        assert_eq!(slow.handle(&job).await, JobResult::Success);

        let stored = stores.messages.get(tenant, message.id).await.unwrap().unwrap();
        assert!(stored.insight.is_none());
    }

    #[test]
    fn enrichment_jobs_run_once() {
        let job = EnrichMessage {
            message_id: MessageId::new(),
        }
        .into_job(TenantId::new())
        .unwrap();
        assert_eq!(job.retry_policy.max_attempts, 1);
        assert!(job.dedup_key.as_deref().is_some_and(|k| k.starts_with("enrich:")));
    }
}
