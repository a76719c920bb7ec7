pub mod twitch;
pub mod youtube;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedRecord;

/// Platform a chat record originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Twitch,
    YouTube,
}

impl Platform {
    /// Twitch records carry a `colour`; YouTube records never do.
    pub fn detect(raw: &RawMessage) -> Self {
        if raw.colour.is_some() {
            Platform::Twitch
        } else {
            Platform::YouTube
        }
    }
}

/// A chat record as delivered by the source.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub id: String,
    #[serde(default, alias = "message")]
    pub text: String,
    pub author: RawAuthor,
    #[serde(default)]
    pub colour: Option<String>,
    #[serde(default)]
    pub emotes: Option<Vec<Value>>,
    #[serde(default)]
    pub message_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAuthor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Kept as raw JSON so they can be relayed untouched.
    #[serde(default)]
    pub badges: Option<Vec<Value>>,
}

impl RawAuthor {
    /// Badge titles in delivery order; badges without a string title are skipped.
    pub fn badge_titles(&self) -> impl Iterator<Item = &str> {
        self.badges
            .iter()
            .flatten()
            .filter_map(|badge| badge.get("title").and_then(Value::as_str))
    }
}

impl RawMessage {
    pub fn from_value(value: Value) -> Result<Self, MalformedRecord> {
        serde_json::from_value(value).map_err(MalformedRecord::Shape)
    }
}

/// The platform-agnostic record written to the output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub message: String,
    pub author: String,
    pub emotes: Vec<Value>,
    pub badges: Vec<Value>,
    pub colour: String,
}
