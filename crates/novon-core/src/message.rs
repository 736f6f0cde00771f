//! JSON message schema for the chat side channel and channel metadata.
//!
//! Everything a viewer sends that is not a control word arrives as an
//! `Envelope { type, content }`. Chat ids travel as JSON strings so that
//! JavaScript viewers do not lose precision.

use serde::{Deserialize, Serialize};

use crate::config::TranscodeProfile;

pub const CHAT_MESSAGE: &str = "chat-message";
pub const DELETE_CHAT_MESSAGE: &str = "delete-chat-message";

/// Role string attached to messages from the stream owner.
pub const OWNER_ROLE: &str = "owner";

/// Outer frame of every JSON message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Envelope {
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn chat(text: impl Into<String>, hash: impl Into<String>) -> Result<Self, serde_json::Error> {
        let content = serde_json::to_value(ChatMessage {
            text: text.into(),
            hash: hash.into(),
            ..ChatMessage::default()
        })?;
        Ok(Self {
            kind: CHAT_MESSAGE.to_string(),
            content,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A chat line. `id`, `src` and `role` are assigned by the broadcaster;
/// whatever the sender put there is discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(with = "u64_string", default)]
    pub id: u64,
    #[serde(default)]
    pub text: String,
    /// Transaction hash backing any `donate<N>` tokens in `text`.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub role: String,
}

impl ChatMessage {
    pub fn from_content(content: &serde_json::Value) -> Result<Self, serde_json::Error> {
        ChatMessage::deserialize(content)
    }
}

/// Owner-only retraction of a chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteChatMessage {
    #[serde(rename = "msgId", with = "u64_string")]
    pub msg_id: u64,
}

/// Reply to `channelinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub panels: String,
    pub viewers: usize,
    /// `"owner"` when the asking address is the stream owner, else empty.
    pub role: String,
    /// Source quality first, then every active transcode profile.
    #[serde(rename = "qualityLevels")]
    pub quality_levels: Vec<TranscodeProfile>,
}

mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
