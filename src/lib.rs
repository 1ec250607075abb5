//! wa-gateway: a supervised WhatsApp bot gateway
//!
//! Keeps one connection to a protocol client alive, reconnecting on every
//! close except a logout, and routes the client's events to the bot.
//!
//! ## Modules
//!
//! - `types` - JIDs, message payloads and protocol client events
//! - `socket` - Connector trait and the WebSocket bridge to the protocol client
//! - `protocol` - Client version lookup and pairing helpers
//! - `store` - Session credentials and the lightweight message store
//! - `config` - Settings file and runtime configuration
//! - `state` - Connection state shared with the pairing endpoint
//! - `handler` - Message routing and the bot handler trait
//! - `supervisor` - Connection lifecycle and retry policy
//! - `monitor` - Resident memory watchdog
//! - `http` - `/qr` and `/paircode` endpoint

pub mod config;
pub mod handler;
pub mod http;
pub mod monitor;
pub mod protocol;
pub mod socket;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod types;

pub use config::{GatewayConfig, Settings};
pub use handler::{BotContext, EventHandler, HandlerError, LoggingHandler, StatusEvent};
pub use socket::{BridgeConnector, ClientHandle, Connection, Connector, SocketError, SocketOptions};
pub use state::{ConnectionState, GatewayState, StatusSnapshot};
pub use store::{LightweightStore, MultiFileAuthState};
pub use supervisor::{RetryPolicy, Supervisor, SupervisorExit};
pub use types::{Event, MessageID, JID};
