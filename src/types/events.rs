//! Event types emitted by the protocol client.
//!
//! Events arrive as JSON objects of the form `{"event": "<name>", "data": ...}`
//! using the event names of the multi-device web client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Chat, Contact, MessageKey, MessagesUpsert, JID};

/// Phase carried by a `connection.update` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

/// Details about why a connection was closed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectInfo {
    /// Protocol status code, see [`DisconnectReason`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DisconnectInfo {
    pub fn with_code(code: u16) -> Self {
        Self {
            status_code: Some(code),
            message: None,
        }
    }

    pub fn reason(&self) -> Option<DisconnectReason> {
        self.status_code.map(DisconnectReason::from_code)
    }
}

/// `connection.update` payload. Every field is optional; one update may carry
/// a QR payload, a phase change, or both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DisconnectInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_new_login: Option<bool>,
}

impl ConnectionUpdate {
    pub fn phase(phase: ConnectionPhase) -> Self {
        Self {
            connection: Some(phase),
            ..Default::default()
        }
    }

    pub fn closed(code: Option<u16>) -> Self {
        Self {
            connection: Some(ConnectionPhase::Close),
            last_disconnect: code.map(DisconnectInfo::with_code),
            ..Default::default()
        }
    }

    pub fn qr(code: impl Into<String>) -> Self {
        Self {
            qr: Some(code.into()),
            ..Default::default()
        }
    }
}

/// Reason for disconnection, decoded from the close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Session was logged out from the phone; credentials are no longer valid
    LoggedOut,
    Forbidden,
    /// Connection lost or timed out (both use 408)
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    /// Another client opened the same session
    ConnectionReplaced,
    BadSession,
    UnavailableService,
    /// Server asks for a fresh connection, usually right after pairing
    RestartRequired,
    Unknown(u16),
}

impl DisconnectReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            403 => DisconnectReason::Forbidden,
            408 => DisconnectReason::ConnectionLost,
            411 => DisconnectReason::MultideviceMismatch,
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::ConnectionReplaced,
            500 => DisconnectReason::BadSession,
            503 => DisconnectReason::UnavailableService,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::Forbidden => 403,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::MultideviceMismatch => 411,
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::BadSession => 500,
            DisconnectReason::UnavailableService => 503,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::Unknown(code) => code,
        }
    }
}

/// Authentication credentials.
///
/// The blob is opaque to the gateway; only the `registered` flag is read to
/// decide whether a pairing code must be requested.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// One signal key written or removed by the protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub category: String,
    pub id: String,
    /// `None` deletes the key
    #[serde(default)]
    pub value: Option<Value>,
}

/// Batch of key-store mutations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeysUpdate {
    pub keys: Vec<KeyEntry>,
}

/// Group membership action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
    /// Actions added after this list was written, e.g. `modify`
    #[serde(other)]
    Other,
}

/// `group-participants.update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupParticipantsUpdate {
    pub id: JID,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<JID>,
    pub participants: Vec<JID>,
    pub action: ParticipantAction,
}

/// `status.update` payload (about/presence status changes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub jid: JID,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// All events that the gateway reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "creds.update")]
    CredsUpdate(Credentials),
    #[serde(rename = "keys.update")]
    KeysUpdate(KeysUpdate),
    #[serde(rename = "connection.update")]
    ConnectionUpdate(ConnectionUpdate),
    #[serde(rename = "messages.upsert")]
    MessagesUpsert(MessagesUpsert),
    #[serde(rename = "group-participants.update")]
    GroupParticipantsUpdate(GroupParticipantsUpdate),
    #[serde(rename = "status.update")]
    StatusUpdate(StatusUpdate),
    #[serde(rename = "contacts.upsert")]
    ContactsUpsert(Vec<Contact>),
    #[serde(rename = "chats.upsert")]
    ChatsUpsert(Vec<Chat>),
    /// The protocol client needs the original payload of a sent message to
    /// answer a retry receipt.
    #[serde(rename = "messages.retry-request")]
    RetryRequest(MessageKey),
}

impl Event {
    /// Every event name the gateway decodes.
    pub const NAMES: [&'static str; 9] = [
        "creds.update",
        "keys.update",
        "connection.update",
        "messages.upsert",
        "group-participants.update",
        "status.update",
        "contacts.upsert",
        "chats.upsert",
        "messages.retry-request",
    ];

    pub fn is_modelled(name: &str) -> bool {
        Self::NAMES.contains(&name)
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Event::CredsUpdate(_) => "creds.update",
            Event::KeysUpdate(_) => "keys.update",
            Event::ConnectionUpdate(_) => "connection.update",
            Event::MessagesUpsert(_) => "messages.upsert",
            Event::GroupParticipantsUpdate(_) => "group-participants.update",
            Event::StatusUpdate(_) => "status.update",
            Event::ContactsUpsert(_) => "contacts.upsert",
            Event::ChatsUpsert(_) => "chats.upsert",
            Event::RetryRequest(_) => "messages.retry-request",
        }
    }
}
