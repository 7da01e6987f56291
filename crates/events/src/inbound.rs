//! Provider webhook payload (`{ object, entry: [{ id, changes: [...] }] }`).
//!
//! Fields the platform does not use are ignored on deserialization; unknown
//! message types deserialize fine and are rejected later by [`InboundMessage::to_content`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use courier_messaging::{
    DeliveryError, InteractiveContent, LocationContent, MediaContent, MediaKind, MediaRef,
    MessageContent,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

impl WebhookPayload {
    /// Every change in the payload, in order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.entry.iter().flat_map(|e| e.changes.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub field: String,
    pub value: ChangeValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messaging_product: Option<String>,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<ProfileContact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<InboundMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<StatusNotice>,
}

impl ChangeValue {
    /// Profile name the provider attached for a sender, if any.
    pub fn profile_name(&self, wa_id: &str) -> Option<&str> {
        self.contacts
            .iter()
            .find(|c| c.wa_id == wa_id)
            .or_else(|| self.contacts.first())
            .and_then(|c| c.profile.as_ref())
            .and_then(|p| p.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_phone_number: Option<String>,
    pub phone_number_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileContact {
    pub wa_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaBody {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MediaBody {
    fn media_ref(&self) -> MediaRef {
        MediaRef {
            id: Some(self.id.clone()),
            link: None,
            mime_type: self.mime_type.clone(),
            sha256: self.sha256.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationBody {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyBody {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_reply: Option<ReplyBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_reply: Option<ReplyBody>,
}

/// Quick-reply button pressed on a template message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonBody {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: String,
    pub id: String,
    /// Epoch seconds, as a string.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<MediaBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker: Option<MediaBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<MediaBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<InteractiveBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<ButtonBody>,
}

impl InboundMessage {
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        parse_epoch_seconds(&self.timestamp)
    }

    /// Map the provider's type-specific body onto canonical content.
    ///
    /// `None` for unsupported types or a body missing for the declared type.
    pub fn to_content(&self) -> Option<MessageContent> {
        let media = |kind: MediaKind, body: &Option<MediaBody>| {
            body.as_ref().map(|b| {
                MessageContent::Media(MediaContent {
                    kind,
                    media: b.media_ref(),
                    caption: b.caption.clone(),
                })
            })
        };

        match self.kind.as_str() {
            "text" => self.text.as_ref().map(|t| MessageContent::text(t.body.clone())),
            "image" => media(MediaKind::Image, &self.image),
            "video" => media(MediaKind::Video, &self.video),
            "audio" => media(MediaKind::Audio, &self.audio),
            "voice" => media(MediaKind::Audio, &self.voice),
            "sticker" => media(MediaKind::Sticker, &self.sticker),
            "document" => self.document.as_ref().map(|d| MessageContent::Document {
                media: d.media_ref(),
                filename: d.filename.clone(),
                caption: d.caption.clone(),
            }),
            "location" => self.location.as_ref().map(|l| {
                MessageContent::Location(LocationContent {
                    latitude: l.latitude,
                    longitude: l.longitude,
                    name: l.name.clone(),
                    address: l.address.clone(),
                })
            }),
            "interactive" => {
                let body = self.interactive.as_ref()?;
                match body.kind.as_str() {
                    "button_reply" => body.button_reply.as_ref().map(|r| {
                        MessageContent::Interactive(InteractiveContent::ButtonReply {
                            id: r.id.clone(),
                            title: r.title.clone(),
                        })
                    }),
                    "list_reply" => body.list_reply.as_ref().map(|r| {
                        MessageContent::Interactive(InteractiveContent::ListReply {
                            id: r.id.clone(),
                            title: r.title.clone(),
                            description: r.description.clone(),
                        })
                    }),
                    _ => None,
                }
            }
            "button" => self.button.as_ref().map(|b| {
                MessageContent::Interactive(InteractiveContent::ButtonReply {
                    id: b.payload.clone().unwrap_or_else(|| b.text.clone()),
                    title: b.text.clone(),
                })
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Delivery-status notification for a message we sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    /// Provider message id.
    pub id: String,
    pub status: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDetail>,
}

impl StatusNotice {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        parse_epoch_seconds(&self.timestamp)
    }

    /// The first reported error, if any.
    pub fn error(&self) -> Option<DeliveryError> {
        self.errors.first().map(|e| {
            DeliveryError::new(
                Some(e.code.to_string()),
                e.title
                    .clone()
                    .or_else(|| e.message.clone())
                    .unwrap_or_else(|| "unknown provider error".to_string()),
            )
        })
    }
}

fn parse_epoch_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_messaging::MessageType;
    use serde_json::json;

    fn sample() -> WebhookPayload {
        serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": { "display_phone_number": "15550000000", "phone_number_id": "PNID" },
                        "contacts": [{ "wa_id": "15551234567", "profile": { "name": "Ada Lovelace" } }],
                        "messages": [
                            { "from": "15551234567", "id": "wamid.1", "timestamp": "1714557600", "type": "text", "text": { "body": "hello" } },
                            { "from": "15551234567", "id": "wamid.2", "timestamp": "1714557601", "type": "voice", "voice": { "id": "m1", "mime_type": "audio/ogg" } },
                            { "from": "15551234567", "id": "wamid.3", "timestamp": "1714557602", "type": "interactive",
                              "interactive": { "type": "list_reply", "list_reply": { "id": "opt-2", "title": "Tuesday" } } },
                            { "from": "15551234567", "id": "wamid.4", "timestamp": "1714557603", "type": "reaction" }
                        ],
                        "statuses": [{
                            "id": "wamid.out", "status": "failed", "timestamp": "1714557604", "recipient_id": "15551234567",
                            "errors": [{ "code": 131026, "title": "Message undeliverable" }]
                        }]
                    }
                }]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn parses_messages_and_maps_content() {
        let payload = sample();
        let change = payload.changes().next().unwrap();
        assert_eq!(change.value.metadata.phone_number_id, "PNID");
        assert_eq!(change.value.profile_name("15551234567"), Some("Ada Lovelace"));

        let types: Vec<Option<MessageType>> = change
            .value
            .messages
            .iter()
            .map(|m| m.to_content().map(|c| c.message_type()))
            .collect();
        assert_eq!(
            types,
            vec![
                Some(MessageType::Text),
                Some(MessageType::Audio),
                Some(MessageType::Interactive),
                None
            ]
        );
        assert_eq!(
            change.value.messages[0].received_at().map(|t| t.timestamp()),
            Some(1_714_557_600)
        );
    }

    #[test]
    fn status_error_uses_first_entry() {
        let payload = sample();
        let status = &payload.changes().next().unwrap().value.statuses[0];
        let err = status.error().unwrap();
        assert_eq!(err.code.as_deref(), Some("131026"));
        assert_eq!(err.message, "Message undeliverable");
    }

    #[test]
    fn bad_timestamp_is_none() {
        assert!(parse_epoch_seconds("soon").is_none());
    }
}
