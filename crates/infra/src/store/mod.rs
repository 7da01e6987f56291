//! Persistence contracts the workers require, plus in-memory and Postgres adapters.
//!
//! Every operation is keyed by tenant id. Mutations that must not lose updates
//! under concurrent workers (status transitions, counters, quotas) are single
//! store operations rather than read-then-write sequences in the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{
    AccountId, CampaignId, ContactId, ConversationId, DomainError, MessageId, SubscriptionId,
    TenantId,
};
use courier_messaging::{
    Account, AudienceSelection, Campaign, CampaignCounter, CampaignStatus, Contact, Conversation,
    DeliveryError, Insight, Message, QuotaDecision, StatusUpdate, TenantSettings,
    Transition, WebhookSubscription,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Persistence error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("document (de)serialization failed: {err}"))
    }
}

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Created<T> {
    New(T),
    Existing(T),
}

impl<T> Created<T> {
    pub fn is_new(&self) -> bool {
        matches!(self, Created::New(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Created::New(v) | Created::Existing(v) => v,
        }
    }

    pub fn get(&self) -> &T {
        match self {
            Created::New(v) | Created::Existing(v) => v,
        }
    }
}

/// State changes of a campaign routed through its domain transition functions.
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignChange {
    Schedule { at: DateTime<Utc> },
    Start { total_recipients: u64 },
    Transition(CampaignStatus),
    FailLaunch { error: String },
}

impl CampaignChange {
    pub fn apply(&self, campaign: &mut Campaign, at: DateTime<Utc>) -> Result<(), DomainError> {
        match self {
            CampaignChange::Schedule { at: when } => campaign.schedule(*when, at),
            CampaignChange::Start { total_recipients } => campaign.start(*total_recipients, at),
            CampaignChange::Transition(to) => campaign.transition(*to, at),
            CampaignChange::FailLaunch { error } => campaign.fail_launch(error.clone(), at),
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Insert unless a message with the same id, or the same provider message id
    /// within the tenant, already exists.
    ///
    /// A new message is counted on its conversation (and, when inbound, on its
    /// contact) in the same atomic step: either all of it is written or none of it.
    /// The conversation, and the contact of an inbound message, must exist.
    async fn insert(&self, message: Message) -> Result<Created<Message>, StoreError>;

    async fn get(&self, tenant_id: TenantId, id: MessageId) -> Result<Option<Message>, StoreError>;

    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// Apply a status update under the store's per-message serialization.
    async fn apply_status(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        update: StatusUpdate,
    ) -> Result<(Transition, Message), StoreError>;

    /// Record a failed attempt that will be retried. Returns whether it was recorded.
    async fn record_retry(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        at: DateTime<Utc>,
        error: DeliveryError,
    ) -> Result<bool, StoreError>;

    async fn set_insight(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        insight: Insight,
    ) -> Result<(), StoreError>;

    /// Messages of a conversation, oldest first.
    async fn list_by_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    /// The active conversation of the triple, opened if there is none.
    async fn get_or_open(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Conversation, StoreError>;

    async fn get(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn apply_insight(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
        insight: &Insight,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ContactStore: Send + Sync + 'static {
    async fn get(&self, tenant_id: TenantId, id: ContactId) -> Result<Option<Contact>, StoreError>;

    async fn find_by_phone(
        &self,
        tenant_id: TenantId,
        phone_number: &str,
    ) -> Result<Option<Contact>, StoreError>;

    /// Insert unless the tenant already has a contact with the same phone number.
    async fn get_or_create(&self, contact: Contact) -> Result<Created<Contact>, StoreError>;

    async fn upsert(&self, contact: Contact) -> Result<(), StoreError>;

    /// Ids of contacts matching an audience, in a stable order.
    async fn select(
        &self,
        tenant_id: TenantId,
        audience: &AudienceSelection,
    ) -> Result<Vec<ContactId>, StoreError>;
}

#[async_trait]
pub trait CampaignStore: Send + Sync + 'static {
    async fn get(&self, tenant_id: TenantId, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    async fn upsert(&self, campaign: Campaign) -> Result<(), StoreError>;

    /// Apply a state change atomically.
    async fn modify(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        change: CampaignChange,
        at: DateTime<Utc>,
    ) -> Result<Campaign, StoreError>;

    /// Atomically count one outcome. `None` when the campaign already accounts
    /// for every recipient and a dispatch outcome was refused.
    async fn increment(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        counter: CampaignCounter,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>, StoreError>;

    /// Atomic `running → completed` when `sent + failed == total`. `Some` only if it moved.
    async fn complete_if_done(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>, StoreError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Active subscriptions of the tenant that receive `event`.
    async fn list_matching(
        &self,
        tenant_id: TenantId,
        event: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;

    async fn get(
        &self,
        tenant_id: TenantId,
        id: SubscriptionId,
    ) -> Result<Option<WebhookSubscription>, StoreError>;

    async fn upsert(&self, subscription: WebhookSubscription) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    async fn get(&self, tenant_id: TenantId, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn upsert(&self, account: Account) -> Result<(), StoreError>;

    /// Resolve the account (and so the tenant) an inbound webhook change belongs to.
    async fn find_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Account>, StoreError>;

    /// Atomically consume one unit of the account's daily quota.
    async fn try_consume_quota(
        &self,
        tenant_id: TenantId,
        id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError>;
}

#[async_trait]
pub trait TenantDirectory: Send + Sync + 'static {
    async fn settings(&self, tenant_id: TenantId) -> Result<Option<TenantSettings>, StoreError>;

    async fn upsert_settings(&self, settings: TenantSettings) -> Result<(), StoreError>;
}

/// Every persistence contract, shared by the workers.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub campaigns: Arc<dyn CampaignStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub tenants: Arc<dyn TenantDirectory>,
}

impl Stores {
    /// Use one backend for every contract.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: MessageStore
            + ConversationStore
            + ContactStore
            + CampaignStore
            + SubscriptionStore
            + AccountStore
            + TenantDirectory,
    {
        Self {
            messages: backend.clone(),
            conversations: backend.clone(),
            contacts: backend.clone(),
            campaigns: backend.clone(),
            subscriptions: backend.clone(),
            accounts: backend.clone(),
            tenants: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryStore::new()))
    }
}
