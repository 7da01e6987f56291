//! Campaign templates and per-recipient variable substitution.
//!
//! A variable resolves, in order, from: the contact's named field, the contact's
//! custom field of the same name, the campaign-level override, the template's
//! example value, and finally the empty string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::content::TemplateContent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    #[default]
    Text,
    Currency,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub kind: VariableKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// Template a campaign sends, with its body variables in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignTemplate {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

impl CampaignTemplate {
    pub fn render(&self, contact: &Contact, overrides: &BTreeMap<String, String>) -> TemplateContent {
        TemplateContent {
            name: self.name.clone(),
            language: self.language.clone(),
            parameters: self
                .variables
                .iter()
                .map(|v| resolve_variable(&v.name, v.example.as_deref(), contact, overrides))
                .collect(),
        }
    }
}

pub fn resolve_variable(
    name: &str,
    example: Option<&str>,
    contact: &Contact,
    overrides: &BTreeMap<String, String>,
) -> String {
    contact
        .named_field(name)
        .or_else(|| contact.custom_fields.get(name).cloned())
        .or_else(|| overrides.get(name).cloned())
        .or_else(|| example.map(str::to_string))
        .unwrap_or_default()
}

/// Substitute `{{name}}` placeholders in free text. Unclosed braces are kept verbatim.
pub fn render_text(text: &str, contact: &Contact, overrides: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                out.push_str(&resolve_variable(name, None, contact, overrides));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
