//! Message content: one tagged variant per payload shape.

use serde::{Deserialize, Serialize};

/// Maximum characters kept in a conversation preview.
pub const PREVIEW_LEN: usize = 100;

/// Coarse message type (what the provider calls `type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Sticker,
    Document,
    Location,
    Interactive,
    Template,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::Sticker => "sticker",
            MessageType::Document => "document",
            MessageType::Location => "location",
            MessageType::Interactive => "interactive",
            MessageType::Template => "template",
        }
    }
}

impl core::fmt::Display for MessageType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media flavours sharing the same payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Sticker,
}

/// Reference to provider-hosted media (uploaded id) or a public link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaContent {
    pub kind: MediaKind,
    pub media: MediaRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationContent {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// One selectable option of an interactive message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveOption {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Interactive payloads: outbound prompts and the replies they produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractiveContent {
    /// Quick-reply buttons (outbound).
    Buttons {
        body: String,
        buttons: Vec<InteractiveOption>,
    },
    /// Sectionless option list (outbound).
    List {
        body: String,
        button: String,
        options: Vec<InteractiveOption>,
    },
    /// A contact tapped a reply button (inbound).
    ButtonReply { id: String, title: String },
    /// A contact picked a list row (inbound).
    ListReply {
        id: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

/// Pre-approved template send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateContent {
    pub name: String,
    pub language: String,
    /// Body parameters, in placeholder order.
    #[serde(default)]
    pub parameters: Vec<String>,
}

/// Canonical message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
        #[serde(default)]
        preview_url: bool,
    },
    Media(MediaContent),
    Document {
        media: MediaRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Location(LocationContent),
    Interactive(InteractiveContent),
    Template(TemplateContent),
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text {
            body: body.into(),
            preview_url: false,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageContent::Text { .. } => MessageType::Text,
            MessageContent::Media(m) => match m.kind {
                MediaKind::Image => MessageType::Image,
                MediaKind::Video => MessageType::Video,
                MediaKind::Audio => MessageType::Audio,
                MediaKind::Sticker => MessageType::Sticker,
            },
            MessageContent::Document { .. } => MessageType::Document,
            MessageContent::Location(_) => MessageType::Location,
            MessageContent::Interactive(_) => MessageType::Interactive,
            MessageContent::Template(_) => MessageType::Template,
        }
    }

    /// Plain text body, if this is a text message.
    pub fn plain_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Short human-readable summary used as the conversation preview.
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { body, .. } => body.chars().take(PREVIEW_LEN).collect(),
            MessageContent::Media(m) => match m.kind {
                MediaKind::Image => "[Image]".to_string(),
                MediaKind::Video => "[Video]".to_string(),
                MediaKind::Audio => "[Audio]".to_string(),
                MediaKind::Sticker => "[Sticker]".to_string(),
            },
            MessageContent::Document { filename, .. } => match filename {
                Some(name) => format!("[Document] {}", name),
                None => "[Document]".to_string(),
            },
            MessageContent::Location(_) => "[Location]".to_string(),
            MessageContent::Interactive(i) => match i {
                InteractiveContent::ButtonReply { title, .. }
                | InteractiveContent::ListReply { title, .. } => {
                    title.chars().take(PREVIEW_LEN).collect()
                }
                InteractiveContent::Buttons { body, .. } | InteractiveContent::List { body, .. } => {
                    body.chars().take(PREVIEW_LEN).collect()
                }
            },
            MessageContent::Template(t) => format!("[Template] {}", t.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_preview_is_truncated_on_char_boundary() {
        let body = "é".repeat(150);
        let preview = MessageContent::text(body).preview();
        assert_eq!(preview.chars().count(), PREVIEW_LEN);
    }

    #[test]
    fn media_preview_names_the_kind() {
        let content = MessageContent::Media(MediaContent {
            kind: MediaKind::Video,
            media: MediaRef::default(),
            caption: Some("look".into()),
        });
        assert_eq!(content.preview(), "[Video]");
        assert_eq!(content.message_type(), MessageType::Video);
        assert!(content.plain_text().is_none());
    }

    #[test]
    fn content_is_tagged_by_type() {
        let json = serde_json::to_value(MessageContent::text("hi")).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["body"], "hi");

        let reply = MessageContent::Interactive(InteractiveContent::ButtonReply {
            id: "yes".into(),
            title: "Yes".into(),
        });
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "interactive");
        assert_eq!(json["kind"], "button_reply");
        let back: MessageContent = serde_json::from_value(json).unwrap();
        assert_eq!(back, reply);
    }
}
