//! Message payloads as delivered by the protocol client.
//!
//! `MessageContent` mirrors the protobuf `Message`: every kind of content is
//! an optional field and at most one of them is normally set. Fields the
//! gateway does not model are kept verbatim in `other` so they survive a
//! round trip through the message store.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::types::{MessageID, JID};

/// Key identifying a message within a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Chat the message belongs to
    pub remote_jid: JID,
    /// Whether this message was sent by us
    #[serde(default)]
    pub from_me: bool,
    /// Unique message ID
    pub id: MessageID,
    /// Sender inside a group chat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<JID>,
}

/// Extended text (text with link preview, quote or mentions).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedTextMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_info: Option<Value>,
}

/// Common shape of image/video/audio/document/sticker messages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Reaction to another message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub text: String,
}

/// Envelope that nests a complete message one level down.
///
/// Used for disappearing (`ephemeralMessage`) and view-once messages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FutureProofMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<MessageContent>>,
}

/// Content of a message
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_text_message: Option<ExtendedTextMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker_message: Option<MediaMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_message: Option<ReactionMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_message: Option<FutureProofMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_once_message: Option<FutureProofMessage>,
    /// Content kinds that are not modelled explicitly.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl MessageContent {
    /// Plain text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation: Some(text.into()),
            ..Default::default()
        }
    }

    /// Wrap a message into a disappearing-message envelope.
    pub fn ephemeral(inner: MessageContent) -> Self {
        Self {
            ephemeral_message: Some(FutureProofMessage {
                message: Some(Box::new(inner)),
            }),
            ..Default::default()
        }
    }

    /// Whether this message is an ephemeral envelope.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_message.is_some()
    }

    /// Strip exactly one ephemeral envelope.
    ///
    /// Non-ephemeral content is returned unchanged. An envelope whose inner
    /// message is missing yields `None`. Nested envelopes are not unwrapped
    /// further.
    pub fn unwrap_ephemeral(self) -> Option<MessageContent> {
        match self.ephemeral_message {
            Some(envelope) => envelope.message.map(|inner| *inner),
            None => Some(self),
        }
    }

    /// Best-effort text body: conversation, extended text or media caption.
    pub fn body(&self) -> Option<&str> {
        if let Some(text) = &self.conversation {
            return Some(text);
        }
        if let Some(ext) = &self.extended_text_message {
            return Some(&ext.text);
        }
        [
            &self.image_message,
            &self.video_message,
            &self.document_message,
        ]
        .into_iter()
        .flatten()
        .find_map(|media| media.caption.as_deref())
    }
}

/// A message as stored and forwarded by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebMessage {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    /// Unix timestamp in seconds
    #[serde(
        default,
        rename = "messageTimestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: i64,
}

/// Timestamps arrive as numbers, numeric strings or `{low, high}` longs.
/// Anything else reads as 0 rather than failing the whole message.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(timestamp_from_value(&value).unwrap_or(0))
}

fn timestamp_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(long) => {
            let low = long.get("low")?.as_i64()?;
            let high = long.get("high").and_then(Value::as_i64).unwrap_or(0);
            Some((high << 32) | (low & 0xFFFF_FFFF))
        }
        _ => None,
    }
}

/// Whether an upsert carries new messages or history being appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertKind {
    Notify,
    Append,
}

/// Batch of messages from a `messages.upsert` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesUpsert {
    pub messages: Vec<WebMessage>,
    #[serde(rename = "type")]
    pub kind: UpsertKind,
}

/// Contact entry tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: JID,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
}

/// Chat entry tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: JID,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(
        default,
        rename = "conversationTimestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: i64,
}
