//! Typed content blocks carried by agent chat events.
//!
//! Upstream messages hold either a plain string or an array of blocks. Known
//! block kinds decode into typed variants; anything else is preserved
//! verbatim in `ContentBlock::Unknown`. Fields a known kind does not model are
//! kept in its `extra` map.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Separator used when joining text blocks into an event's full text.
pub const TEXT_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(
        default,
        alias = "mimeType",
        alias = "media_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub mime_type: Option<String>,
    /// Anthropic-style `{type: "base64", media_type, data}` source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageBlock {
    /// Displayable reference: a URL, or a `data:` URL built from inline data.
    pub fn to_data_url(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        if let Some(data) = &self.data {
            let mime = self.mime_type.as_deref().unwrap_or("image/png");
            return Some(format!("data:{mime};base64,{data}"));
        }
        let source = self.source.as_ref()?;
        if let Some(url) = source.get("url").and_then(Value::as_str) {
            return Some(url.to_string());
        }
        let data = source.get("data").and_then(Value::as_str)?;
        let mime = source
            .get("media_type")
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        Some(format!("data:{mime};base64,{data}"))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolUseBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "arguments")]
    pub input: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One unit of message content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
    ToolUse(ToolUseBlock),
    /// A block kind this relay does not interpret, kept as received.
    Unknown(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextBlock {
            text: text.into(),
            extra: Map::new(),
        })
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::ToolUse(_) => "tool_use",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let typed = |value: &mut Value| {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("type");
            }
        };
        match kind.as_str() {
            "text" | "output_text" => {
                typed(&mut value);
                serde_json::from_value(value)
                    .map(Self::Text)
                    .map_err(D::Error::custom)
            }
            "image" | "image_url" => {
                typed(&mut value);
                serde_json::from_value(value)
                    .map(Self::Image)
                    .map_err(D::Error::custom)
            }
            "tool_use" | "toolCall" | "tool_call" => {
                typed(&mut value);
                serde_json::from_value(value)
                    .map(Self::ToolUse)
                    .map_err(D::Error::custom)
            }
            _ => Ok(Self::Unknown(value)),
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error as _;
        let body = match self {
            Self::Text(block) => serde_json::to_value(block),
            Self::Image(block) => serde_json::to_value(block),
            Self::ToolUse(block) => serde_json::to_value(block),
            Self::Unknown(value) => return value.serialize(serializer),
        }
        .map_err(S::Error::custom)?;
        let mut obj = match body {
            Value::Object(obj) => obj,
            _ => Map::new(),
        };
        obj.insert("type".into(), Value::String(self.kind().into()));
        obj.serialize(serializer)
    }
}

/// Message content: either a bare string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

impl MessageContent {
    /// All text-bearing units joined with a blank line.
    pub fn full_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text(t) => Some(t.text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(TEXT_SEPARATOR),
        }
    }

    pub fn images(&self) -> Vec<String> {
        match self {
            Self::Text(_) => Vec::new(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Image(img) => img.to_data_url(),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn has_tool_use(&self) -> bool {
        matches!(self, Self::Blocks(blocks) if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse(_))))
    }
}
