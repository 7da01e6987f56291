//! `courier-messaging`: the messaging domain model.
//!
//! Pure state and state machines with no I/O. Transitions take their timestamps
//! from the caller. Every entity carries its owning tenant.

pub mod account;
pub mod campaign;
pub mod contact;
pub mod content;
pub mod conversation;
pub mod insight;
pub mod message;
pub mod subscription;
pub mod template;

pub use account::{Account, QuotaDecision, TenantSettings};
pub use campaign::{
    AudienceSelection, Campaign, CampaignCounter, CampaignProgress, CampaignStatus,
};
pub use contact::{ConsentStatus, Contact};
pub use content::{
    InteractiveContent, InteractiveOption, LocationContent, MediaContent, MediaKind, MediaRef,
    MessageContent, MessageType, TemplateContent,
};
pub use conversation::{Conversation, ConversationInsight, ConversationStatus};
pub use insight::{Insight, Sentiment};
pub use message::{
    DeliveryError, Direction, Message, MessageStatus, StatusEntry, StatusUpdate, Transition,
};
pub use subscription::{WebhookSubscription, ALL_EVENTS};
pub use template::{CampaignTemplate, TemplateVariable, VariableKind};
