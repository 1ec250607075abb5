//! Types module for WhatsApp protocol types.
//!
//! Contains JIDs, message payloads and the events emitted by the protocol
//! client.

mod events;
mod jid;
mod message;

pub use events::*;
pub use jid::*;
pub use message::*;
