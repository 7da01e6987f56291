//! In-memory implementation of every persistence contract, for tests/dev.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{
    AccountId, CampaignId, ContactId, ConversationId, MessageId, SubscriptionId, TenantId,
};
use courier_messaging::{
    Account, AudienceSelection, Campaign, CampaignCounter, Contact, Conversation, ConversationStatus,
    DeliveryError, Direction, Insight, Message, QuotaDecision, StatusUpdate, TenantSettings,
    Transition, WebhookSubscription,
};

use super::{
    AccountStore, CampaignChange, CampaignStore, ContactStore, ConversationStore, Created,
    MessageStore, StoreError, SubscriptionStore, TenantDirectory,
};

#[derive(Debug, Default)]
struct State {
    messages: HashMap<(TenantId, MessageId), Message>,
    provider_ids: HashMap<(TenantId, String), MessageId>,
    conversations: HashMap<(TenantId, ConversationId), Conversation>,
    contacts: HashMap<(TenantId, ContactId), Contact>,
    phones: HashMap<(TenantId, String), ContactId>,
    campaigns: HashMap<(TenantId, CampaignId), Campaign>,
    subscriptions: HashMap<(TenantId, SubscriptionId), WebhookSubscription>,
    accounts: HashMap<(TenantId, AccountId), Account>,
    tenants: HashMap<TenantId, TenantSettings>,
}

/// Tenant-isolated in-memory store. One lock serializes writers, which gives
/// every compound operation the atomicity the contracts require.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert(&self, message: Message) -> Result<Created<Message>, StoreError> {
        let mut state = self.write()?;
        let tenant_id = message.tenant_id;

        if let Some(existing) = state.messages.get(&(tenant_id, message.id)) {
            return Ok(Created::Existing(existing.clone()));
        }
        if let Some(pid) = &message.provider_message_id {
            let existing = state
                .provider_ids
                .get(&(tenant_id, pid.clone()))
                .and_then(|id| state.messages.get(&(tenant_id, *id)));
            if let Some(existing) = existing {
                return Ok(Created::Existing(existing.clone()));
            }
        }

        // Check everything the write touches before changing anything
        if !state.conversations.contains_key(&(tenant_id, message.conversation_id)) {
            return Err(StoreError::not_found("conversation", message.conversation_id));
        }
        let inbound = message.direction == Direction::Inbound;
        if inbound && !state.contacts.contains_key(&(tenant_id, message.contact_id)) {
            return Err(StoreError::not_found("contact", message.contact_id));
        }

        if let Some(conversation) = state.conversations.get_mut(&(tenant_id, message.conversation_id)) {
            conversation.record_message(message.direction, message.content.preview(), message.created_at);
        }
        if inbound {
            if let Some(contact) = state.contacts.get_mut(&(tenant_id, message.contact_id)) {
                contact.record_inbound(message.created_at);
            }
        }
        if let Some(pid) = &message.provider_message_id {
            state.provider_ids.insert((tenant_id, pid.clone()), message.id);
        }
        state.messages.insert((tenant_id, message.id), message.clone());
        Ok(Created::New(message))
    }

    async fn get(&self, tenant_id: TenantId, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.read()?.messages.get(&(tenant_id, id)).cloned())
    }

    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let state = self.read()?;
        Ok(state
            .provider_ids
            .get(&(tenant_id, provider_message_id.to_string()))
            .and_then(|id| state.messages.get(&(tenant_id, *id)))
            .cloned())
    }

    async fn apply_status(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        update: StatusUpdate,
    ) -> Result<(Transition, Message), StoreError> {
        let mut state = self.write()?;
        let message = state
            .messages
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("message", id))?;

        let transition = message.apply(update);
        let message = message.clone();
        if let Some(pid) = &message.provider_message_id {
            state
                .provider_ids
                .entry((tenant_id, pid.clone()))
                .or_insert(message.id);
        }
        Ok((transition, message))
    }

    async fn record_retry(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        at: DateTime<Utc>,
        error: DeliveryError,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let message = state
            .messages
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("message", id))?;
        Ok(message.record_retry(at, error))
    }

    async fn set_insight(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        insight: Insight,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let message = state
            .messages
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("message", id))?;
        message.set_insight(insight);
        Ok(())
    }

    async fn list_by_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.read()?;
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages.truncate(limit);
        Ok(messages)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn get_or_open(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.write()?;
        let active = state
            .conversations
            .values()
            .find(|c| c.tenant_id == tenant_id && c.is_active_for(contact_id, account_id));
        if let Some(conversation) = active {
            return Ok(conversation.clone());
        }

        let conversation = Conversation::open(tenant_id, contact_id, account_id, at);
        state
            .conversations
            .insert((tenant_id, conversation.id), conversation.clone());
        Ok(conversation)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.read()?.conversations.get(&(tenant_id, id)).cloned())
    }

    async fn apply_insight(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
        insight: &Insight,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let conversation = state
            .conversations
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("conversation", id))?;
        conversation.apply_insight(insight);
        Ok(())
    }
}

#[async_trait]
impl ContactStore for InMemoryStore {
    async fn get(&self, tenant_id: TenantId, id: ContactId) -> Result<Option<Contact>, StoreError> {
        Ok(self.read()?.contacts.get(&(tenant_id, id)).cloned())
    }

    async fn find_by_phone(
        &self,
        tenant_id: TenantId,
        phone_number: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let state = self.read()?;
        Ok(state
            .phones
            .get(&(tenant_id, phone_number.to_string()))
            .and_then(|id| state.contacts.get(&(tenant_id, *id)))
            .cloned())
    }

    async fn get_or_create(&self, contact: Contact) -> Result<Created<Contact>, StoreError> {
        let mut state = self.write()?;
        let phone_key = (contact.tenant_id, contact.phone_number.clone());

        let existing = state
            .phones
            .get(&phone_key)
            .and_then(|id| state.contacts.get(&(contact.tenant_id, *id)));
        if let Some(existing) = existing {
            return Ok(Created::Existing(existing.clone()));
        }

        state.phones.insert(phone_key, contact.id);
        state
            .contacts
            .insert((contact.tenant_id, contact.id), contact.clone());
        Ok(Created::New(contact))
    }

    async fn upsert(&self, contact: Contact) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let phone_key = (contact.tenant_id, contact.phone_number.clone());
        if let Some(owner) = state.phones.get(&phone_key) {
            if *owner != contact.id {
                return Err(StoreError::Conflict(format!(
                    "phone number {} already belongs to contact {owner}",
                    contact.phone_number
                )));
            }
        }
        state.phones.insert(phone_key, contact.id);
        state.contacts.insert((contact.tenant_id, contact.id), contact);
        Ok(())
    }

    async fn select(
        &self,
        tenant_id: TenantId,
        audience: &AudienceSelection,
    ) -> Result<Vec<ContactId>, StoreError> {
        let state = self.read()?;
        let mut matched: Vec<&Contact> = state
            .contacts
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.can_receive_campaigns() && audience.matches(c))
            .collect();
        matched.sort_by_key(|c| (c.created_at, c.id));
        Ok(matched.into_iter().map(|c| c.id).collect())
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn get(&self, tenant_id: TenantId, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.read()?.campaigns.get(&(tenant_id, id)).cloned())
    }

    async fn upsert(&self, campaign: Campaign) -> Result<(), StoreError> {
        self.write()?
            .campaigns
            .insert((campaign.tenant_id, campaign.id), campaign);
        Ok(())
    }

    async fn modify(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        change: CampaignChange,
        at: DateTime<Utc>,
    ) -> Result<Campaign, StoreError> {
        let mut state = self.write()?;
        let campaign = state
            .campaigns
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("campaign", id))?;

        // Apply to a copy so a refused change leaves the record untouched
        let mut next = campaign.clone();
        change.apply(&mut next, at)?;
        *campaign = next.clone();
        Ok(next)
    }

    async fn increment(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        counter: CampaignCounter,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>, StoreError> {
        let mut state = self.write()?;
        let campaign = state
            .campaigns
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("campaign", id))?;
        match campaign.record(counter, at) {
            Ok(()) => Ok(Some(campaign.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn complete_if_done(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>, StoreError> {
        let mut state = self.write()?;
        let campaign = state
            .campaigns
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("campaign", id))?;
        Ok(campaign.complete_if_done(at).then(|| campaign.clone()))
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn list_matching(
        &self,
        tenant_id: TenantId,
        event: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let state = self.read()?;
        let mut matching: Vec<WebhookSubscription> = state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.matches(event))
            .cloned()
            .collect();
        matching.sort_by_key(|s| (s.created_at, s.id));
        Ok(matching)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: SubscriptionId,
    ) -> Result<Option<WebhookSubscription>, StoreError> {
        Ok(self.read()?.subscriptions.get(&(tenant_id, id)).cloned())
    }

    async fn upsert(&self, subscription: WebhookSubscription) -> Result<(), StoreError> {
        self.write()?
            .subscriptions
            .insert((subscription.tenant_id, subscription.id), subscription);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn get(&self, tenant_id: TenantId, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.read()?.accounts.get(&(tenant_id, id)).cloned())
    }

    async fn upsert(&self, account: Account) -> Result<(), StoreError> {
        self.write()?
            .accounts
            .insert((account.tenant_id, account.id), account);
        Ok(())
    }

    async fn find_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .read()?
            .accounts
            .values()
            .find(|a| a.phone_number_id == phone_number_id)
            .cloned())
    }

    async fn try_consume_quota(
        &self,
        tenant_id: TenantId,
        id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let mut state = self.write()?;
        let account = state
            .accounts
            .get_mut(&(tenant_id, id))
            .ok_or_else(|| StoreError::not_found("account", id))?;
        Ok(account.try_consume(now))
    }
}

#[async_trait]
impl TenantDirectory for InMemoryStore {
    async fn settings(&self, tenant_id: TenantId) -> Result<Option<TenantSettings>, StoreError> {
        Ok(self.read()?.tenants.get(&tenant_id).cloned())
    }

    async fn upsert_settings(&self, settings: TenantSettings) -> Result<(), StoreError> {
        self.write()?.tenants.insert(settings.tenant_id, settings);
        Ok(())
    }
}

impl InMemoryStore {
    /// Active conversations of a tenant (test/diagnostic helper).
    pub fn active_conversations(&self, tenant_id: TenantId) -> Result<Vec<Conversation>, StoreError> {
        Ok(self
            .read()?
            .conversations
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.status == ConversationStatus::Active)
            .cloned()
            .collect())
    }

    /// Count of contacts of a tenant (test/diagnostic helper).
    pub fn contact_count(&self, tenant_id: TenantId) -> Result<usize, StoreError> {
        Ok(self
            .read()?
            .contacts
            .keys()
            .filter(|(t, _)| *t == tenant_id)
            .count())
    }

    /// Count of messages of a tenant (test/diagnostic helper).
    pub fn message_count(&self, tenant_id: TenantId) -> Result<usize, StoreError> {
        Ok(self
            .read()?
            .messages
            .keys()
            .filter(|(t, _)| *t == tenant_id)
            .count())
    }
}
