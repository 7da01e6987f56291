//! Messaging-provider capability.
//!
//! The delivery worker talks to the provider only through [`MessagingProvider`].
//! [`CloudApiProvider`] is the HTTP implementation; tests substitute their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_messaging::{
    Account, DeliveryError, InteractiveContent, LocationContent, MediaContent, MediaRef,
    MessageContent, TemplateContent,
};

pub mod cloud_api;

pub use cloud_api::CloudApiProvider;

/// Provider acknowledgement of an accepted send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error{}: {message}", code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct ProviderError {
    pub code: Option<String>,
    pub message: String,
    /// Whether another attempt may succeed (network, throttling, 5xx, timeout).
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout() -> Self {
        Self::retryable(Some("TIMEOUT".to_string()), "provider call timed out")
    }

    pub fn to_delivery_error(&self) -> DeliveryError {
        DeliveryError::new(self.code.clone(), self.message.clone())
    }
}

/// Send capability of the messaging provider, one call per content type.
#[async_trait]
pub trait MessagingProvider: Send + Sync + 'static {
    async fn send_text(
        &self,
        account: &Account,
        to: &str,
        body: &str,
        preview_url: bool,
    ) -> Result<SendReceipt, ProviderError>;

    async fn send_media(
        &self,
        account: &Account,
        to: &str,
        media: &MediaContent,
    ) -> Result<SendReceipt, ProviderError>;

    async fn send_document(
        &self,
        account: &Account,
        to: &str,
        media: &MediaRef,
        filename: Option<&str>,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ProviderError>;

    async fn send_template(
        &self,
        account: &Account,
        to: &str,
        template: &TemplateContent,
    ) -> Result<SendReceipt, ProviderError>;

    async fn send_location(
        &self,
        account: &Account,
        to: &str,
        location: &LocationContent,
    ) -> Result<SendReceipt, ProviderError>;

    async fn send_interactive(
        &self,
        account: &Account,
        to: &str,
        interactive: &InteractiveContent,
    ) -> Result<SendReceipt, ProviderError>;
}

/// Route content to the matching provider call.
pub async fn dispatch<P>(
    provider: &P,
    account: &Account,
    to: &str,
    content: &MessageContent,
) -> Result<SendReceipt, ProviderError>
where
    P: MessagingProvider + ?Sized,
{
    match content {
        MessageContent::Text { body, preview_url } => {
            provider.send_text(account, to, body, *preview_url).await
        }
        MessageContent::Media(media) => provider.send_media(account, to, media).await,
        MessageContent::Document {
            media,
            filename,
            caption,
        } => {
            provider
                .send_document(account, to, media, filename.as_deref(), caption.as_deref())
                .await
        }
        MessageContent::Template(template) => provider.send_template(account, to, template).await,
        MessageContent::Location(location) => provider.send_location(account, to, location).await,
        MessageContent::Interactive(
            InteractiveContent::ButtonReply { .. } | InteractiveContent::ListReply { .. },
        ) => Err(ProviderError::permanent(
            Some("UNSUPPORTED".to_string()),
            "interactive replies cannot be sent",
        )),
        MessageContent::Interactive(interactive) => {
            provider.send_interactive(account, to, interactive).await
        }
    }
}

#[async_trait]
impl<P: MessagingProvider + ?Sized> MessagingProvider for std::sync::Arc<P> {
    async fn send_text(
        &self,
        account: &Account,
        to: &str,
        body: &str,
        preview_url: bool,
    ) -> Result<SendReceipt, ProviderError> {
        (**self).send_text(account, to, body, preview_url).await
    }

    async fn send_media(
        &self,
        account: &Account,
        to: &str,
        media: &MediaContent,
    ) -> Result<SendReceipt, ProviderError> {
        (**self).send_media(account, to, media).await
    }

    async fn send_document(
        &self,
        account: &Account,
        to: &str,
        media: &MediaRef,
        filename: Option<&str>,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ProviderError> {
        (**self)
            .send_document(account, to, media, filename, caption)
            .await
    }

    async fn send_template(
        &self,
        account: &Account,
        to: &str,
        template: &TemplateContent,
    ) -> Result<SendReceipt, ProviderError> {
        (**self).send_template(account, to, template).await
    }

    async fn send_location(
        &self,
        account: &Account,
        to: &str,
        location: &LocationContent,
    ) -> Result<SendReceipt, ProviderError> {
        (**self).send_location(account, to, location).await
    }

    async fn send_interactive(
        &self,
        account: &Account,
        to: &str,
        interactive: &InteractiveContent,
    ) -> Result<SendReceipt, ProviderError> {
        (**self).send_interactive(account, to, interactive).await
    }
}
