//! Events crossing the platform boundary.
//!
//! - [`inbound`]: the provider's webhook payload, as received.
//! - [`platform`]: events the platform re-publishes to tenant subscribers.

pub mod inbound;
pub mod platform;
pub mod tenant;

pub use inbound::{Change, ChangeValue, Entry, InboundMessage, StatusNotice, WebhookPayload};
pub use platform::{MessageReceived, MessageStatusUpdated, PlatformEvent};
pub use tenant::TenantScoped;
