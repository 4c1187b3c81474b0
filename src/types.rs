//! Shared domain types used across the matching core.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Chat modality. Each modality has its own waiting queue and rooms never
/// mix modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Text,
    Video,
}

impl ChatType {
    pub const ALL: [ChatType; 2] = [ChatType::Text, ChatType::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Text => "text",
            ChatType::Video => "video",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chat type: {0}")]
pub struct UnknownChatType(pub String);

impl FromStr for ChatType {
    type Err = UnknownChatType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ChatType::Text),
            "video" => Ok(ChatType::Video),
            other => Err(UnknownChatType(other.to_string())),
        }
    }
}

/// Per-modality counter pair, serialized as `{"text": .., "video": ..}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerModality<T> {
    pub text: T,
    pub video: T,
}

impl<T> PerModality<T> {
    pub fn get(&self, chat_type: ChatType) -> &T {
        match chat_type {
            ChatType::Text => &self.text,
            ChatType::Video => &self.video,
        }
    }

    pub fn get_mut(&mut self, chat_type: ChatType) -> &mut T {
        match chat_type {
            ChatType::Text => &mut self.text,
            ChatType::Video => &mut self.video,
        }
    }
}
