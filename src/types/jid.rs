//! WhatsApp JID (Jabber ID) types.
//!
//! JIDs identify users, groups and broadcast lists. The gateway only needs to
//! parse them, compare them and normalise device-qualified JIDs into the
//! user JID that the message store is keyed by.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Known JID servers on WhatsApp
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const LEGACY_USER: &str = "c.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
    pub const NEWSLETTER: &str = "newsletter";
}

/// User part of the status broadcast JID.
pub const STATUS_USER: &str = "status";

/// MessageID is the internal ID of a WhatsApp message.
pub type MessageID = String;

/// JID represents a WhatsApp identifier.
///
/// Device-qualified JIDs (`user:device@server`) are produced for linked
/// devices; `to_non_ad` strips the device part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JID {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            device: 0,
        }
    }

    /// Creates a user JID on the default server from a phone number.
    pub fn from_phone(number: &str) -> Self {
        Self::new(number, servers::DEFAULT_USER)
    }

    /// Returns a version of the JID without the device part.
    ///
    /// Legacy `c.us` user JIDs are mapped onto `s.whatsapp.net`.
    pub fn to_non_ad(&self) -> Self {
        let server = if self.server == servers::LEGACY_USER {
            servers::DEFAULT_USER.to_string()
        } else {
            self.server.clone()
        };
        Self::new(self.user.clone(), server)
    }

    /// Returns true for `status@broadcast`.
    pub fn is_status_broadcast(&self) -> bool {
        self.server == servers::BROADCAST && self.user == STATUS_USER
    }

    /// Returns true if this is a broadcast list (not status broadcast).
    pub fn is_broadcast_list(&self) -> bool {
        self.server == servers::BROADCAST && self.user != STATUS_USER
    }

    /// Returns true for group chats.
    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to parse JID: {0}")]
pub struct ParseJIDError(pub String);

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((user_part, server)) = s.split_once('@') else {
            return Ok(JID::new("", s));
        };

        if server.contains('@') {
            return Err(ParseJIDError("unexpected number of @ in JID".to_string()));
        }

        let (user_ad, device) = match user_part.split_once(':') {
            Some((user, device)) => (user, Some(device)),
            None => (user_part, None),
        };

        // Agent-qualified users (user.agent:device) keep only the user part.
        let user = user_ad.split_once('.').map_or(user_ad, |(user, _agent)| user);

        let mut jid = JID::new(user, server);
        if let Some(device) = device {
            jid.device = device
                .parse()
                .map_err(|_| ParseJIDError("failed to parse device from JID".to_string()))?;
        }

        Ok(jid)
    }
}

impl Serialize for JID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// Common JIDs
lazy_static::lazy_static! {
    pub static ref EMPTY_JID: JID = JID::default();
    pub static ref STATUS_BROADCAST_JID: JID = JID::new(STATUS_USER, servers::BROADCAST);
}
