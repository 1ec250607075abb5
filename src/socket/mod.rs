//! Transport to the protocol client.
//!
//! The gateway never speaks the WhatsApp wire protocol itself. A [`Connector`]
//! produces a [`Connection`]: a command handle plus the ordered stream of
//! events emitted by the protocol client. [`BridgeConnector`] is the
//! production implementation; tests plug in their own.

mod bridge;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::WaVersion;
use crate::types::{Credentials, Event, MessageContent, MessageID, MessageKey, JID};

pub use bridge::{BridgeConnector, InboundFrame, OutboundFrame};

/// Connection options handed to the protocol client.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketOptions {
    pub version: WaVersion,
    /// Advertised browser: platform, browser name, browser version
    pub browser: [String; 3],
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub mark_online_on_connect: bool,
    pub sync_full_history: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            version: WaVersion::default(),
            browser: ["Ubuntu".into(), "Chrome".into(), "20.0.0".into()],
            connect_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(10),
            mark_online_on_connect: true,
            sync_full_history: false,
        }
    }
}

/// Socket errors.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol client rejected request: {0}")]
    Rejected(String),
}

/// Commands the gateway can issue on a live connection.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Ask for a numeric pairing code linked to `phone_number` (digits only).
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, SocketError>;

    /// Send a message and return its ID.
    async fn send_message(
        &self,
        to: &JID,
        message: MessageContent,
    ) -> Result<MessageID, SocketError>;

    /// Answer a `messages.retry-request` with the stored payload, if any.
    async fn respond_to_retry(
        &self,
        key: &MessageKey,
        message: Option<MessageContent>,
    ) -> Result<(), SocketError>;

    /// Close the connection. Events stop after a final close update.
    async fn close(&self) -> Result<(), SocketError>;
}

/// A live connection: a command handle and its event stream.
pub struct Connection {
    pub client: Arc<dyn ClientHandle>,
    pub events: mpsc::Receiver<Event>,
}

/// Factory for connections to the protocol client.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &SocketOptions,
        creds: &Credentials,
    ) -> Result<Connection, SocketError>;
}

/// Generate a unique message ID.
pub fn generate_message_id() -> MessageID {
    format!("3EB0{:016X}", rand::random::<u64>())
}
