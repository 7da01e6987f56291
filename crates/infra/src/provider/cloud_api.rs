//! WhatsApp Cloud API client.
//!
//! Every send is a `POST {base_url}/{phone_number_id}/messages` with a bearer token:
//! the account's own token when set, otherwise the process-wide fallback.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use courier_messaging::{
    Account, InteractiveContent, LocationContent, MediaContent, MediaKind, MediaRef,
    TemplateContent,
};

use super::{MessagingProvider, ProviderError, SendReceipt};

pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com/v18.0";

#[derive(Debug, Clone)]
pub struct CloudApiProvider {
    client: reqwest::Client,
    base_url: String,
    fallback_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

impl CloudApiProvider {
    pub fn new(timeout: Duration, fallback_token: Option<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::permanent(None, format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            fallback_token,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn token<'a>(&'a self, account: &'a Account) -> Result<&'a str, ProviderError> {
        account
            .access_token
            .as_deref()
            .or(self.fallback_token.as_deref())
            .ok_or_else(|| {
                ProviderError::permanent(
                    Some("NO_ACCESS_TOKEN".to_string()),
                    format!("no access token for account {}", account.id),
                )
            })
    }

    async fn post(
        &self,
        account: &Account,
        to: &str,
        kind: &str,
        body: Value,
    ) -> Result<SendReceipt, ProviderError> {
        let token = self.token(account)?;
        let url = format!("{}/{}/messages", self.base_url, account.phone_number_id);
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": kind,
        });
        payload[kind] = body;

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout()
                } else {
                    ProviderError::retryable(Some("NETWORK".to_string()), e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::retryable(Some("NETWORK".to_string()), e.to_string()))?;

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&text) {
                Ok(envelope) => (
                    envelope.error.code.map(|c| c.to_string()),
                    envelope.error.message,
                ),
                Err(_) => (None, text),
            };
            let code = code.or_else(|| Some(status.as_u16().to_string()));
            warn!(account_id = %account.id, status = %status, code = ?code, "provider rejected send");
            let retryable = status.is_server_error() || status.as_u16() == 429;
            return Err(ProviderError {
                code,
                message,
                retryable,
            });
        }

        let parsed: SendResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::permanent(Some("BAD_RESPONSE".to_string()), e.to_string())
        })?;
        let id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| {
                ProviderError::permanent(
                    Some("BAD_RESPONSE".to_string()),
                    "response carried no message id",
                )
            })?;
        debug!(account_id = %account.id, provider_message_id = %id, "provider accepted send");
        Ok(SendReceipt {
            provider_message_id: id,
        })
    }
}

fn media_object(media: &MediaRef) -> Value {
    let mut object = json!({});
    if let Some(id) = &media.id {
        object["id"] = json!(id);
    }
    if let Some(link) = &media.link {
        object["link"] = json!(link);
    }
    object
}

fn option_rows(options: &[courier_messaging::InteractiveOption]) -> Vec<Value> {
    options
        .iter()
        .map(|o| {
            let mut row = json!({ "id": o.id, "title": o.title });
            if let Some(description) = &o.description {
                row["description"] = json!(description);
            }
            row
        })
        .collect()
}

#[async_trait]
impl MessagingProvider for CloudApiProvider {
    async fn send_text(
        &self,
        account: &Account,
        to: &str,
        body: &str,
        preview_url: bool,
    ) -> Result<SendReceipt, ProviderError> {
        self.post(
            account,
            to,
            "text",
            json!({ "body": body, "preview_url": preview_url }),
        )
        .await
    }

    async fn send_media(
        &self,
        account: &Account,
        to: &str,
        media: &MediaContent,
    ) -> Result<SendReceipt, ProviderError> {
        let kind = match media.kind {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Sticker => "sticker",
        };
        let mut body = media_object(&media.media);
        // Audio and stickers carry no caption
        if let Some(caption) = &media.caption {
            if matches!(media.kind, MediaKind::Image | MediaKind::Video) {
                body["caption"] = json!(caption);
            }
        }
        self.post(account, to, kind, body).await
    }

    async fn send_document(
        &self,
        account: &Account,
        to: &str,
        media: &MediaRef,
        filename: Option<&str>,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ProviderError> {
        let mut body = media_object(media);
        if let Some(filename) = filename {
            body["filename"] = json!(filename);
        }
        if let Some(caption) = caption {
            body["caption"] = json!(caption);
        }
        self.post(account, to, "document", body).await
    }

    async fn send_template(
        &self,
        account: &Account,
        to: &str,
        template: &TemplateContent,
    ) -> Result<SendReceipt, ProviderError> {
        let mut body = json!({
            "name": template.name,
            "language": { "code": template.language },
        });
        if !template.parameters.is_empty() {
            let parameters: Vec<Value> = template
                .parameters
                .iter()
                .map(|p| json!({ "type": "text", "text": p }))
                .collect();
            body["components"] = json!([{ "type": "body", "parameters": parameters }]);
        }
        self.post(account, to, "template", body).await
    }

    async fn send_location(
        &self,
        account: &Account,
        to: &str,
        location: &LocationContent,
    ) -> Result<SendReceipt, ProviderError> {
        let mut body = json!({
            "latitude": location.latitude,
            "longitude": location.longitude,
        });
        if let Some(name) = &location.name {
            body["name"] = json!(name);
        }
        if let Some(address) = &location.address {
            body["address"] = json!(address);
        }
        self.post(account, to, "location", body).await
    }

    async fn send_interactive(
        &self,
        account: &Account,
        to: &str,
        interactive: &InteractiveContent,
    ) -> Result<SendReceipt, ProviderError> {
        let body = match interactive {
            InteractiveContent::Buttons { body, buttons } => {
                let buttons: Vec<Value> = buttons
                    .iter()
                    .map(|b| json!({ "type": "reply", "reply": { "id": b.id, "title": b.title } }))
                    .collect();
                json!({
                    "type": "button",
                    "body": { "text": body },
                    "action": { "buttons": buttons },
                })
            }
            InteractiveContent::List {
                body,
                button,
                options,
            } => json!({
                "type": "list",
                "body": { "text": body },
                "action": {
                    "button": button,
                    "sections": [{ "title": button, "rows": option_rows(options) }],
                },
            }),
            InteractiveContent::ButtonReply { .. } | InteractiveContent::ListReply { .. } => {
                return Err(ProviderError::permanent(
                    Some("UNSUPPORTED".to_string()),
                    "interactive replies cannot be sent",
                ));
            }
        };
        self.post(account, to, "interactive", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_core::TenantId;

    #[test]
    fn account_token_wins_over_fallback() {
        let provider =
            CloudApiProvider::new(Duration::from_secs(1), Some("global".into())).unwrap();
        let mut account = Account::new(TenantId::new(), "PNID", "+1555", Utc::now());
        assert_eq!(provider.token(&account).unwrap(), "global");

        account.access_token = Some("own".into());
        assert_eq!(provider.token(&account).unwrap(), "own");
    }

    #[test]
    fn missing_token_is_permanent() {
        let provider = CloudApiProvider::new(Duration::from_secs(1), None).unwrap();
        let account = Account::new(TenantId::new(), "PNID", "+1555", Utc::now());
        let err = provider.token(&account).unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn media_object_prefers_present_fields() {
        let value = media_object(&MediaRef {
            id: None,
            link: Some("https://cdn.example/a.png".into()),
            mime_type: None,
            sha256: None,
        });
        assert_eq!(value, json!({ "link": "https://cdn.example/a.png" }));
    }

    #[test]
    fn base_url_is_normalised() {
        let provider = CloudApiProvider::new(Duration::from_secs(1), None)
            .unwrap()
            .with_base_url("http://localhost:9000/");
        assert_eq!(provider.base_url, "http://localhost:9000");
    }
}
