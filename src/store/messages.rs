//! Lightweight message/chat store.
//!
//! Keeps the most recent messages per chat plus contacts and chats in memory,
//! and mirrors them to a single JSON file on a fixed interval. The protocol
//! client asks for stored messages when a recipient requests a resend.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::write_atomic;
use crate::types::{Chat, Contact, Event, MessagesUpsert, WebMessage, JID};

/// Messages kept per chat unless configured otherwise.
pub const DEFAULT_MAX_MESSAGES_PER_CHAT: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,
    #[error("failed to access store file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize store: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    messages: HashMap<String, Vec<WebMessage>>,
    #[serde(default)]
    contacts: HashMap<String, Contact>,
    #[serde(default)]
    chats: HashMap<String, Chat>,
}

/// In-memory store with JSON file persistence.
#[derive(Debug)]
pub struct LightweightStore {
    path: PathBuf,
    max_messages_per_chat: usize,
    data: RwLock<StoreData>,
}

impl LightweightStore {
    pub fn new(path: impl Into<PathBuf>, max_messages_per_chat: usize) -> Self {
        Self {
            path: path.into(),
            max_messages_per_chat: max_messages_per_chat.max(1),
            data: RwLock::new(StoreData::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory contents with the file contents.
    ///
    /// A missing file leaves the store empty. A corrupt file is logged and
    /// ignored so a bad write never keeps the bot from starting.
    pub fn read_from_file(&self) -> StoreResult<()> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let loaded: StoreData = match serde_json::from_str(&contents) {
            Ok(loaded) => loaded,
            Err(err) => {
                log::warn!(
                    "ignoring unreadable store file {}: {err}",
                    self.path.display()
                );
                return Ok(());
            }
        };

        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        *data = loaded;
        log::debug!(
            "loaded {} chats with stored messages from {}",
            data.messages.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Write the current contents to the store file.
    pub fn write_to_file(&self) -> StoreResult<()> {
        let serialized = {
            let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
            serde_json::to_vec(&*data)?
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        write_atomic(&self.path, &serialized)?;
        Ok(())
    }

    /// Apply an event from the protocol client to the store.
    ///
    /// Events the store does not track are ignored.
    pub fn bind(&self, event: &Event) -> StoreResult<()> {
        match event {
            Event::MessagesUpsert(upsert) => self.upsert_messages(upsert),
            Event::ContactsUpsert(contacts) => self.upsert_contacts(contacts),
            Event::ChatsUpsert(chats) => self.upsert_chats(chats),
            _ => Ok(()),
        }
    }

    /// Look up a stored message; the chat JID is normalised first.
    pub fn load_message(&self, chat: &JID, id: &str) -> StoreResult<Option<WebMessage>> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data
            .messages
            .get(&chat_key(chat))
            .and_then(|messages| messages.iter().find(|m| m.key.id == id))
            .cloned())
    }

    pub fn contact(&self, jid: &JID) -> StoreResult<Option<Contact>> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data.contacts.get(&chat_key(jid)).cloned())
    }

    pub fn chat(&self, jid: &JID) -> StoreResult<Option<Chat>> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data.chats.get(&chat_key(jid)).cloned())
    }

    /// Number of messages kept for a chat.
    pub fn message_count(&self, chat: &JID) -> StoreResult<usize> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data.messages.get(&chat_key(chat)).map_or(0, Vec::len))
    }

    fn upsert_messages(&self, upsert: &MessagesUpsert) -> StoreResult<()> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        for message in &upsert.messages {
            let chat = data
                .messages
                .entry(chat_key(&message.key.remote_jid))
                .or_default();
            match chat.iter_mut().find(|m| m.key.id == message.key.id) {
                Some(existing) => *existing = message.clone(),
                None => chat.push(message.clone()),
            }
            if chat.len() > self.max_messages_per_chat {
                let excess = chat.len() - self.max_messages_per_chat;
                chat.drain(..excess);
            }
        }
        Ok(())
    }

    fn upsert_contacts(&self, contacts: &[Contact]) -> StoreResult<()> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        for contact in contacts {
            data.contacts.insert(chat_key(&contact.id), contact.clone());
        }
        Ok(())
    }

    fn upsert_chats(&self, chats: &[Chat]) -> StoreResult<()> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        for chat in chats {
            data.chats.insert(chat_key(&chat.id), chat.clone());
        }
        Ok(())
    }

    /// Spawn the periodic writer. A final write happens on cancellation.
    pub fn spawn_writer(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.write_to_file() {
                            log::error!("periodic store write failed: {err}");
                        }
                    }
                }
            }
            if let Err(err) = self.write_to_file() {
                log::error!("final store write failed: {err}");
            }
        })
    }
}

fn chat_key(jid: &JID) -> String {
    jid.to_non_ad().to_string()
}
