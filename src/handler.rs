//! Routing of inbound events to the bot's handlers.
//!
//! Handlers run one at a time in event order. A failing or panicking handler
//! is logged and the event is dropped; it is never retried.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::socket::{ClientHandle, SocketError};
use crate::types::{
    GroupParticipantsUpdate, MessageContent, MessageID, MessagesUpsert, StatusUpdate, UpsertKind,
    WebMessage, JID,
};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("{0}")]
    Failed(String),
}

/// What the status handler receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A message posted to `status@broadcast`
    Broadcast(MessagesUpsert),
    /// A `status.update` event
    Update(StatusUpdate),
}

/// Where a single inbound message goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Drop,
    Status(MessagesUpsert),
    Messages(MessagesUpsert),
}

/// Route one message.
///
/// Order matters: the ephemeral envelope is stripped first, then status
/// broadcasts are diverted regardless of any other field, then empty
/// messages are dropped, then the private-mode filter applies.
pub fn route_message(mut message: WebMessage, kind: UpsertKind, public: bool) -> Route {
    message.message = message.message.and_then(MessageContent::unwrap_ephemeral);

    if message.key.remote_jid.is_status_broadcast() {
        return Route::Status(single(message, kind));
    }
    if message.message.is_none() {
        return Route::Drop;
    }
    let private_chat = !message.key.remote_jid.is_group();
    if !public && !message.key.from_me && kind == UpsertKind::Notify && private_chat {
        return Route::Drop;
    }
    Route::Messages(single(message, kind))
}

/// Route every message of an upsert batch, preserving order.
pub fn route_upsert(upsert: MessagesUpsert, public: bool) -> Vec<Route> {
    let kind = upsert.kind;
    upsert
        .messages
        .into_iter()
        .map(|message| route_message(message, kind, public))
        .collect()
}

fn single(message: WebMessage, kind: UpsertKind) -> MessagesUpsert {
    MessagesUpsert {
        messages: vec![message],
        kind,
    }
}

/// Everything a handler needs to act on an event.
#[derive(Clone)]
pub struct BotContext {
    pub client: Arc<dyn ClientHandle>,
    pub bot_name: String,
    pub owner: JID,
    pub public: bool,
}

impl BotContext {
    pub async fn send_text(
        &self,
        to: &JID,
        text: impl Into<String>,
    ) -> Result<MessageID, SocketError> {
        self.client.send_message(to, MessageContent::text(text)).await
    }

    pub fn is_owner(&self, jid: &JID) -> bool {
        jid.to_non_ad() == self.owner.to_non_ad()
    }
}

/// The bot's behaviour.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_messages(
        &self,
        ctx: &BotContext,
        upsert: MessagesUpsert,
    ) -> Result<(), HandlerError>;

    async fn handle_group_participants(
        &self,
        ctx: &BotContext,
        update: GroupParticipantsUpdate,
    ) -> Result<(), HandlerError>;

    async fn handle_status(
        &self,
        ctx: &BotContext,
        status: StatusEvent,
    ) -> Result<(), HandlerError>;
}

/// Run a handler call in its own task and swallow its failure.
///
/// The call is awaited before returning, so ordering between events holds.
pub async fn dispatch<F, Fut>(
    kind: &'static str,
    handler: &Arc<dyn EventHandler>,
    ctx: &BotContext,
    call: F,
) where
    F: FnOnce(Arc<dyn EventHandler>, BotContext) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    match tokio::spawn(call(handler.clone(), ctx.clone())).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("{kind} handler failed: {err}"),
        Err(err) => log::error!("{kind} handler panicked: {err}"),
    }
}

/// Default handler: logs what arrives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle_messages(
        &self,
        _ctx: &BotContext,
        upsert: MessagesUpsert,
    ) -> Result<(), HandlerError> {
        for message in &upsert.messages {
            let body = message
                .message
                .as_ref()
                .and_then(MessageContent::body)
                .unwrap_or("<non-text message>");
            log::info!(
                "[{}] {}: {}",
                message.key.remote_jid,
                message.push_name.as_deref().unwrap_or("unknown"),
                body
            );
        }
        Ok(())
    }

    async fn handle_group_participants(
        &self,
        _ctx: &BotContext,
        update: GroupParticipantsUpdate,
    ) -> Result<(), HandlerError> {
        log::info!(
            "group {} {:?}: {} participant(s)",
            update.id,
            update.action,
            update.participants.len()
        );
        Ok(())
    }

    async fn handle_status(
        &self,
        _ctx: &BotContext,
        status: StatusEvent,
    ) -> Result<(), HandlerError> {
        match status {
            StatusEvent::Broadcast(upsert) => {
                for message in &upsert.messages {
                    let key = &message.key;
                    let poster = key.participant.as_ref().unwrap_or(&key.remote_jid);
                    log::info!("status posted by {poster}");
                }
            }
            StatusEvent::Update(update) => log::info!("status update from {}", update.jid),
        }
        Ok(())
    }
}
