//! Postgres-backed implementation of the persistence contracts.
//!
//! Records are JSONB documents next to the columns that are filtered on,
//! constrained, or atomically incremented (see `migrations/0001_courier.sql`).
//!
//! ## Atomicity
//!
//! - Campaign counters, campaign completion and account quotas are single guarded
//!   `UPDATE ... RETURNING` statements.
//! - Message, conversation and contact mutations lock the row (`SELECT ... FOR UPDATE`)
//!   and run the domain transition function inside the transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Conflict` |
//! | Anything else | | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use courier_core::{
    AccountId, CampaignId, ContactId, ConversationId, MessageId, SubscriptionId, TenantId,
};
use courier_messaging::account::next_midnight;
use courier_messaging::{
    Account, AudienceSelection, Campaign, CampaignCounter, CampaignStatus, Contact, Conversation,
    DeliveryError, Direction, Insight, Message, QuotaDecision, StatusUpdate, TenantSettings,
    Transition, WebhookSubscription,
};

use super::{
    AccountStore, CampaignChange, CampaignStore, ContactStore, ConversationStore, Created,
    MessageStore, StoreError, SubscriptionStore, TenantDirectory,
};

const SCHEMA: &str = include_str!("../../migrations/0001_courier.sql");

const CAMPAIGN_COLUMNS: &str = "status, total_recipients, sent_count, delivered_count, read_count, \
     failed_count, completed_at, updated_at, doc";

/// Postgres store. Every query includes `tenant_id` in its WHERE clause.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    /// Lock a message row, run `f`, and write the document back if `f` changed it.
    async fn modify_message<R, F>(
        &self,
        operation: &'static str,
        tenant_id: TenantId,
        id: MessageId,
        f: F,
    ) -> Result<(R, Message), StoreError>
    where
        R: Send,
        F: FnOnce(&mut Message) -> (R, bool) + Send,
    {
        let mut tx = self.begin(operation).await?;
        let row = sqlx::query("SELECT doc FROM messages WHERE tenant_id = $1 AND id = $2 FOR UPDATE")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or_else(|| StoreError::not_found("message", id))?;
        let mut message: Message = doc(&row)?;

        let (result, changed) = f(&mut message);
        if changed {
            sqlx::query(
                r#"
                UPDATE messages
                SET doc = $3, provider_message_id = COALESCE(provider_message_id, $4)
                WHERE tenant_id = $1 AND id = $2
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .bind(Json(&message))
            .bind(message.provider_message_id.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok((result, message))
    }

    async fn modify_conversation<F>(
        &self,
        operation: &'static str,
        tenant_id: TenantId,
        id: ConversationId,
        f: F,
    ) -> Result<Conversation, StoreError>
    where
        F: FnOnce(&mut Conversation) + Send,
    {
        let mut tx = self.begin(operation).await?;
        let conversation = Self::modify_conversation_in(&mut tx, operation, tenant_id, id, f).await?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(conversation)
    }

    /// Lock a conversation row inside `tx`, run `f`, and write it back.
    async fn modify_conversation_in<F>(
        tx: &mut Transaction<'static, Postgres>,
        operation: &'static str,
        tenant_id: TenantId,
        id: ConversationId,
        f: F,
    ) -> Result<Conversation, StoreError>
    where
        F: FnOnce(&mut Conversation) + Send,
    {
        let row = sqlx::query(
            "SELECT doc FROM conversations WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or_else(|| StoreError::not_found("conversation", id))?;
        let mut conversation: Conversation = doc(&row)?;

        f(&mut conversation);
        sqlx::query("UPDATE conversations SET doc = $3, status = $4 WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .bind(Json(&conversation))
            .bind(enum_str(&conversation.status)?)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(conversation)
    }

    /// Lock a contact row inside `tx` and count one received message on it.
    async fn record_inbound_in(
        tx: &mut Transaction<'static, Postgres>,
        tenant_id: TenantId,
        id: ContactId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT doc FROM contacts WHERE tenant_id = $1 AND id = $2 FOR UPDATE")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("record_inbound", e))?
            .ok_or_else(|| StoreError::not_found("contact", id))?;
        let mut contact: Contact = doc(&row)?;
        contact.record_inbound(at);

        sqlx::query("UPDATE contacts SET doc = $3 WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .bind(Json(&contact))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("record_inbound", e))?;
        Ok(())
    }

    async fn find_active_conversation(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        account_id: AccountId,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM conversations
            WHERE tenant_id = $1 AND contact_id = $2 AND account_id = $3 AND status = 'active'
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(contact_id.as_uuid())
        .bind(account_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_conversation", e))?;
        row.as_ref().map(doc).transpose()
    }

    async fn campaign_exists(&self, tenant_id: TenantId, id: CampaignId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM campaigns WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("campaign_exists", e))?;
        Ok(row.is_some())
    }

    async fn write_campaign<'c, E>(executor: E, campaign: &Campaign) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO campaigns
                (tenant_id, id, status, total_recipients, sent_count, delivered_count,
                 read_count, failed_count, completed_at, updated_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                status = EXCLUDED.status,
                total_recipients = EXCLUDED.total_recipients,
                sent_count = EXCLUDED.sent_count,
                delivered_count = EXCLUDED.delivered_count,
                read_count = EXCLUDED.read_count,
                failed_count = EXCLUDED.failed_count,
                completed_at = EXCLUDED.completed_at,
                updated_at = EXCLUDED.updated_at,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(campaign.tenant_id.as_uuid())
        .bind(campaign.id.as_uuid())
        .bind(campaign.status.as_str())
        .bind(campaign.total_recipients as i64)
        .bind(campaign.sent_count as i64)
        .bind(campaign.delivered_count as i64)
        .bind(campaign.read_count as i64)
        .bind(campaign.failed_count as i64)
        .bind(campaign.completed_at)
        .bind(campaign.updated_at)
        .bind(Json(campaign))
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error("write_campaign", e))?;
        Ok(())
    }
}

fn doc<T: DeserializeOwned>(row: &PgRow) -> Result<T, StoreError> {
    let Json(value) = row
        .try_get::<Json<T>, _>("doc")
        .map_err(|e| StoreError::Backend(format!("failed to decode document: {e}")))?;
    Ok(value)
}

/// The serde name of a unit enum variant (e.g. `opted_out`).
fn enum_str<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Backend(format!("expected a string variant, got {other}"))),
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Backend(format!("failed to decode column {name}: {e}")))
}

/// Campaign document with the authoritative column values laid over it.
fn campaign_from_row(row: &PgRow) -> Result<Campaign, StoreError> {
    let mut campaign: Campaign = doc(row)?;
    let status: String = column(row, "status")?;
    campaign.status = serde_json::from_value::<CampaignStatus>(serde_json::Value::String(status))?;
    campaign.total_recipients = column::<i64>(row, "total_recipients")?.max(0) as u64;
    campaign.sent_count = column::<i64>(row, "sent_count")?.max(0) as u64;
    campaign.delivered_count = column::<i64>(row, "delivered_count")?.max(0) as u64;
    campaign.read_count = column::<i64>(row, "read_count")?.max(0) as u64;
    campaign.failed_count = column::<i64>(row, "failed_count")?.max(0) as u64;
    campaign.completed_at = column(row, "completed_at")?;
    campaign.updated_at = column(row, "updated_at")?;
    Ok(campaign)
}

/// Account document with the live quota columns laid over it.
fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let mut account: Account = doc(row)?;
    account.daily_limit = column::<i32>(row, "daily_limit")?.max(0) as u32;
    account.daily_sent = column::<i32>(row, "daily_sent")?.max(0) as u32;
    account.quota_day = column::<NaiveDate>(row, "quota_day")?;
    Ok(account)
}

#[async_trait]
impl MessageStore for PostgresStore {
    #[instrument(skip(self, message), fields(tenant_id = %message.tenant_id, message_id = %message.id), err)]
    async fn insert(&self, message: Message) -> Result<Created<Message>, StoreError> {
        let mut tx = self.begin("insert_message").await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (tenant_id, id, conversation_id, provider_message_id, created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(message.tenant_id.as_uuid())
        .bind(message.id.as_uuid())
        .bind(message.conversation_id.as_uuid())
        .bind(message.provider_message_id.as_deref())
        .bind(message.created_at)
        .bind(Json(&message))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_message", e))?;

        if inserted.is_some() {
            let (direction, preview, at) = (message.direction, message.content.preview(), message.created_at);
            Self::modify_conversation_in(&mut tx, "insert_message", message.tenant_id, message.conversation_id, move |c| {
                c.record_message(direction, preview, at)
            })
            .await?;
            if direction == Direction::Inbound {
                Self::record_inbound_in(&mut tx, message.tenant_id, message.contact_id, at).await?;
            }
            tx.commit().await.map_err(|e| map_sqlx_error("insert_message", e))?;
            return Ok(Created::New(message));
        }
        tx.rollback().await.map_err(|e| map_sqlx_error("insert_message", e))?;

        let existing = sqlx::query(
            r#"
            SELECT doc FROM messages
            WHERE tenant_id = $1 AND (id = $2 OR provider_message_id = $3)
            LIMIT 1
            "#,
        )
        .bind(message.tenant_id.as_uuid())
        .bind(message.id.as_uuid())
        .bind(message.provider_message_id.as_deref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_message", e))?
        .ok_or_else(|| StoreError::Conflict(format!("message {} conflicted but was not found", message.id)))?;
        Ok(Created::Existing(doc(&existing)?))
    }

    async fn get(&self, tenant_id: TenantId, id: MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query("SELECT doc FROM messages WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_message", e))?;
        row.as_ref().map(doc).transpose()
    }

    async fn find_by_provider_id(
        &self,
        tenant_id: TenantId,
        provider_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(
            "SELECT doc FROM messages WHERE tenant_id = $1 AND provider_message_id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(provider_message_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_provider_id", e))?;
        row.as_ref().map(doc).transpose()
    }

    #[instrument(skip(self, update), fields(tenant_id = %tenant_id, message_id = %id, status = %update.status), err)]
    async fn apply_status(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        update: StatusUpdate,
    ) -> Result<(Transition, Message), StoreError> {
        self.modify_message("apply_status", tenant_id, id, move |m| {
            let transition = m.apply(update);
            (transition, transition == Transition::Applied)
        })
        .await
    }

    async fn record_retry(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        at: DateTime<Utc>,
        error: DeliveryError,
    ) -> Result<bool, StoreError> {
        let (recorded, _) = self
            .modify_message("record_retry", tenant_id, id, move |m| {
                let recorded = m.record_retry(at, error);
                (recorded, recorded)
            })
            .await?;
        Ok(recorded)
    }

    async fn set_insight(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        insight: Insight,
    ) -> Result<(), StoreError> {
        self.modify_message("set_insight", tenant_id, id, move |m| {
            m.set_insight(insight);
            ((), true)
        })
        .await?;
        Ok(())
    }

    async fn list_by_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM messages
            WHERE tenant_id = $1 AND conversation_id = $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(conversation_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_conversation", e))?;
        rows.iter().map(doc).collect()
    }
}

#[async_trait]
impl ConversationStore for PostgresStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn get_or_open(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        if let Some(existing) = self
            .find_active_conversation(tenant_id, contact_id, account_id)
            .await?
        {
            return Ok(existing);
        }

        let conversation = Conversation::open(tenant_id, contact_id, account_id, at);
        sqlx::query(
            r#"
            INSERT INTO conversations (tenant_id, id, contact_id, account_id, status, doc)
            VALUES ($1, $2, $3, $4, 'active', $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(conversation.id.as_uuid())
        .bind(contact_id.as_uuid())
        .bind(account_id.as_uuid())
        .bind(Json(&conversation))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_conversation", e))?;

        // Either ours or the one a concurrent writer opened first
        self.find_active_conversation(tenant_id, contact_id, account_id)
            .await?
            .ok_or_else(|| StoreError::Conflict("active conversation vanished".to_string()))
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query("SELECT doc FROM conversations WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_conversation", e))?;
        row.as_ref().map(doc).transpose()
    }

    async fn apply_insight(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
        insight: &Insight,
    ) -> Result<(), StoreError> {
        let insight = insight.clone();
        self.modify_conversation("apply_insight", tenant_id, id, move |c| {
            c.apply_insight(&insight)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContactStore for PostgresStore {
    async fn get(&self, tenant_id: TenantId, id: ContactId) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query("SELECT doc FROM contacts WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_contact", e))?;
        row.as_ref().map(doc).transpose()
    }

    async fn find_by_phone(
        &self,
        tenant_id: TenantId,
        phone_number: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query("SELECT doc FROM contacts WHERE tenant_id = $1 AND phone_number = $2")
            .bind(tenant_id.as_uuid())
            .bind(phone_number)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_contact_by_phone", e))?;
        row.as_ref().map(doc).transpose()
    }

    #[instrument(skip(self, contact), fields(tenant_id = %contact.tenant_id), err)]
    async fn get_or_create(&self, contact: Contact) -> Result<Created<Contact>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO contacts (tenant_id, id, phone_number, tags, consent, created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, phone_number) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(contact.tenant_id.as_uuid())
        .bind(contact.id.as_uuid())
        .bind(&contact.phone_number)
        .bind(contact.tags.iter().cloned().collect::<Vec<String>>())
        .bind(enum_str(&contact.consent)?)
        .bind(contact.created_at)
        .bind(Json(&contact))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_contact", e))?;

        if inserted.is_some() {
            return Ok(Created::New(contact));
        }
        self.find_by_phone(contact.tenant_id, &contact.phone_number)
            .await?
            .map(Created::Existing)
            .ok_or_else(|| StoreError::Conflict("contact conflicted but was not found".to_string()))
    }

    async fn upsert(&self, contact: Contact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO contacts (tenant_id, id, phone_number, tags, consent, created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                phone_number = EXCLUDED.phone_number,
                tags = EXCLUDED.tags,
                consent = EXCLUDED.consent,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(contact.tenant_id.as_uuid())
        .bind(contact.id.as_uuid())
        .bind(&contact.phone_number)
        .bind(contact.tags.iter().cloned().collect::<Vec<String>>())
        .bind(enum_str(&contact.consent)?)
        .bind(contact.created_at)
        .bind(Json(&contact))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_contact", e))?;
        Ok(())
    }

    async fn select(
        &self,
        tenant_id: TenantId,
        audience: &AudienceSelection,
    ) -> Result<Vec<ContactId>, StoreError> {
        let ids: Vec<Uuid> = audience.contact_ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id FROM contacts
            WHERE tenant_id = $1
              AND consent <> 'opted_out'
              AND (id = ANY($2) OR tags && $3)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&ids)
        .bind(&audience.tags)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_audience", e))?;

        rows.iter()
            .map(|row| column::<Uuid>(row, "id").map(ContactId::from_uuid))
            .collect()
    }
}

#[async_trait]
impl CampaignStore for PostgresStore {
    async fn get(&self, tenant_id: TenantId, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_campaign", e))?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn upsert(&self, campaign: Campaign) -> Result<(), StoreError> {
        Self::write_campaign(&*self.pool, &campaign).await
    }

    #[instrument(skip(self, change), fields(tenant_id = %tenant_id, campaign_id = %id), err)]
    async fn modify(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        change: CampaignChange,
        at: DateTime<Utc>,
    ) -> Result<Campaign, StoreError> {
        let mut tx = self.begin("modify_campaign").await?;
        let row = sqlx::query(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("modify_campaign", e))?
        .ok_or_else(|| StoreError::not_found("campaign", id))?;

        let mut campaign = campaign_from_row(&row)?;
        change.apply(&mut campaign, at)?;
        Self::write_campaign(&mut *tx, &campaign).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("modify_campaign", e))?;
        Ok(campaign)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, campaign_id = %id), err)]
    async fn increment(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        counter: CampaignCounter,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>, StoreError> {
        let set = match counter {
            CampaignCounter::Sent => "sent_count = sent_count + 1",
            CampaignCounter::Delivered => "delivered_count = delivered_count + 1",
            CampaignCounter::Read => "read_count = read_count + 1",
            CampaignCounter::Failed => "failed_count = failed_count + 1",
        };
        let guard = if counter.is_dispatch_outcome() {
            "AND sent_count + failed_count < total_recipients"
        } else {
            ""
        };
        let row = sqlx::query(&format!(
            r#"
            UPDATE campaigns SET {set}, updated_at = GREATEST(updated_at, $3)
            WHERE tenant_id = $1 AND id = $2 {guard}
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_campaign", e))?;

        match row {
            Some(row) => Ok(Some(campaign_from_row(&row)?)),
            None if self.campaign_exists(tenant_id, id).await? => Ok(None),
            None => Err(StoreError::not_found("campaign", id)),
        }
    }

    async fn complete_if_done(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE campaigns
            SET status = 'completed', completed_at = $3, updated_at = $3
            WHERE tenant_id = $1 AND id = $2
              AND status = 'running'
              AND sent_count + failed_count = total_recipients
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_campaign", e))?;
        row.as_ref().map(campaign_from_row).transpose()
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn list_matching(
        &self,
        tenant_id: TenantId,
        event: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM webhook_subscriptions
            WHERE tenant_id = $1 AND active AND ($2 = ANY(events) OR '*' = ANY(events))
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(event)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_subscriptions", e))?;
        rows.iter().map(doc).collect()
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: SubscriptionId,
    ) -> Result<Option<WebhookSubscription>, StoreError> {
        let row = sqlx::query("SELECT doc FROM webhook_subscriptions WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_subscription", e))?;
        row.as_ref().map(doc).transpose()
    }

    async fn upsert(&self, subscription: WebhookSubscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions (tenant_id, id, active, events, created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                active = EXCLUDED.active,
                events = EXCLUDED.events,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(subscription.tenant_id.as_uuid())
        .bind(subscription.id.as_uuid())
        .bind(subscription.active)
        .bind(subscription.events.iter().cloned().collect::<Vec<String>>())
        .bind(subscription.created_at)
        .bind(Json(&subscription))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_subscription", e))?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PostgresStore {
    async fn get(&self, tenant_id: TenantId, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT doc, daily_limit, daily_sent, quota_day FROM accounts WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_account", e))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn upsert(&self, account: Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (tenant_id, id, phone_number_id, daily_limit, daily_sent, quota_day, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                phone_number_id = EXCLUDED.phone_number_id,
                daily_limit = EXCLUDED.daily_limit,
                doc = EXCLUDED.doc
            "#,
        )
        .bind(account.tenant_id.as_uuid())
        .bind(account.id.as_uuid())
        .bind(&account.phone_number_id)
        .bind(account.daily_limit as i32)
        .bind(account.daily_sent as i32)
        .bind(account.quota_day)
        .bind(Json(&account))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_account", e))?;
        Ok(())
    }

    async fn find_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT doc, daily_limit, daily_sent, quota_day FROM accounts WHERE phone_number_id = $1",
        )
        .bind(phone_number_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_account", e))?;
        row.as_ref().map(account_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %id), err)]
    async fn try_consume_quota(
        &self,
        tenant_id: TenantId,
        id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let today = now.date_naive();
        let row = sqlx::query(
            r#"
            UPDATE accounts SET
                daily_sent = CASE WHEN quota_day < $3 THEN 1 ELSE daily_sent + 1 END,
                quota_day = GREATEST(quota_day, $3)
            WHERE tenant_id = $1 AND id = $2
              AND daily_limit > 0
              AND (quota_day < $3 OR daily_sent < daily_limit)
            RETURNING daily_limit, daily_sent
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(today)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("consume_quota", e))?;

        if let Some(row) = row {
            let limit: i32 = column(&row, "daily_limit")?;
            let sent: i32 = column(&row, "daily_sent")?;
            return Ok(QuotaDecision::Granted {
                remaining: (limit - sent).max(0) as u32,
            });
        }
        match AccountStore::get(self, tenant_id, id).await? {
            Some(_) => Ok(QuotaDecision::Exhausted {
                resets_at: next_midnight(today),
            }),
            None => Err(StoreError::not_found("account", id)),
        }
    }
}

#[async_trait]
impl TenantDirectory for PostgresStore {
    async fn settings(&self, tenant_id: TenantId) -> Result<Option<TenantSettings>, StoreError> {
        let row = sqlx::query("SELECT doc FROM tenant_settings WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_settings", e))?;
        row.as_ref().map(doc).transpose()
    }

    async fn upsert_settings(&self, settings: TenantSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_settings (tenant_id, doc) VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(settings.tenant_id.as_uuid())
        .bind(Json(&settings))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_settings", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation / check violation (campaign counter bound)
                Some("23505") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_table() {
        for table in [
            "tenant_settings",
            "accounts",
            "contacts",
            "conversations",
            "messages",
            "campaigns",
            "webhook_subscriptions",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn enum_columns_use_serde_names() {
        assert_eq!(
            enum_str(&courier_messaging::ConsentStatus::OptedOut).unwrap(),
            "opted_out"
        );
        assert_eq!(enum_str(&CampaignStatus::Running).unwrap(), "running");
    }
}
