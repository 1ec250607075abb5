//! WebSocket bridge to an out-of-process protocol client.
//!
//! Frames are JSON text messages tagged by `type`, with the body under
//! `payload`. After connecting the gateway sends a `hello` carrying the socket
//! options and stored credentials; the bridge then streams `event` frames and
//! answers `pairing_code` requests with `pairing_code_result`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::socket::{
    generate_message_id, ClientHandle, Connection, Connector, SocketError, SocketOptions,
};
use crate::types::{
    ConnectionPhase, ConnectionUpdate, Credentials, DisconnectInfo, DisconnectReason, Event,
    MessageContent, MessageID, MessageKey, JID,
};

const EVENT_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 64;

/// Frames sent to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundFrame {
    Hello {
        version: [u32; 3],
        browser: [String; 3],
        connect_timeout_ms: u64,
        query_timeout_ms: u64,
        keep_alive_interval_ms: u64,
        mark_online_on_connect: bool,
        sync_full_history: bool,
        creds: Credentials,
    },
    PairingCode {
        request_id: String,
        phone_number: String,
    },
    Send {
        message_id: MessageID,
        to: JID,
        message: MessageContent,
    },
    RetryResponse {
        key: MessageKey,
        message: Option<MessageContent>,
    },
    Close,
}

impl OutboundFrame {
    fn hello(options: &SocketOptions, creds: &Credentials) -> Self {
        OutboundFrame::Hello {
            version: options.version.version,
            browser: options.browser.clone(),
            connect_timeout_ms: duration_ms(options.connect_timeout),
            query_timeout_ms: duration_ms(options.query_timeout),
            keep_alive_interval_ms: duration_ms(options.keep_alive_interval),
            mark_online_on_connect: options.mark_online_on_connect,
            sync_full_history: options.sync_full_history,
            creds: creds.clone(),
        }
    }
}

/// Frames received from the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundFrame {
    Event(Event),
    PairingCodeResult {
        request_id: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Result of decoding one inbound text frame.
#[derive(Debug)]
enum Decoded {
    Frame(InboundFrame),
    /// A well-formed event the gateway has no use for
    Unmodelled(String),
    Malformed(serde_json::Error),
}

fn decode_frame(text: &str) -> Decoded {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Decoded::Malformed(err),
    };
    if value["type"] == "event" {
        if let Some(name) = value["payload"]["event"].as_str() {
            if !Event::is_modelled(name) {
                return Decoded::Unmodelled(name.to_string());
            }
        }
    }
    match serde_json::from_value(value) {
        Ok(frame) => Decoded::Frame(frame),
        Err(err) => Decoded::Malformed(err),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

type PairingReply = Result<String, String>;

/// Outstanding pairing-code requests keyed by request ID.
#[derive(Default)]
struct PendingRequests {
    pending: Mutex<HashMap<String, oneshot::Sender<PairingReply>>>,
    counter: AtomicU64,
}

impl PendingRequests {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:X}.{}", rand::random::<u16>(), n)
    }

    fn register(&self, id: &str) -> oneshot::Receiver<PairingReply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        rx
    }

    fn complete(&self, id: &str, reply: PairingReply) -> bool {
        match self.lock().remove(id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    fn cancel(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<PairingReply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connects to a protocol-client bridge over WebSocket.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    endpoint: String,
}

impl BridgeConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(
        &self,
        options: &SocketOptions,
        creds: &Credentials,
    ) -> Result<Connection, SocketError> {
        let connecting = connect_async(self.endpoint.as_str());
        let (ws, _response) = timeout(options.connect_timeout, connecting)
            .await
            .map_err(|_| SocketError::Timeout(options.connect_timeout))?
            .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let hello = serde_json::to_string(&OutboundFrame::hello(options, creds))
            .map_err(|e| SocketError::SendFailed(e.to_string()))?;
        sink.send(Message::Text(hello))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))?;

        let (command_tx, mut command_rx) = mpsc::channel::<OutboundFrame>(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<Event>(EVENT_BUFFER);
        let pending = Arc::new(PendingRequests::default());

        // Writer: forwards commands and keeps the socket alive.
        let keep_alive = options.keep_alive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keep_alive);
            ticker.tick().await;
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let Some(frame) = command else { break };
                        let closing = frame == OutboundFrame::Close;
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                log::error!("dropping unserializable frame: {err}");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            log::warn!("bridge write failed: {err}");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                            log::warn!("bridge keep-alive failed: {err}");
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Reader: decodes frames into events until the socket ends.
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut saw_close = false;
            let mut end_reason = String::from("bridge connection ended");
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        end_reason = err.to_string();
                        break;
                    }
                };
                let frame = match decode_frame(&text) {
                    Decoded::Frame(frame) => frame,
                    Decoded::Unmodelled(name) => {
                        log::debug!("ignoring {name} event");
                        continue;
                    }
                    Decoded::Malformed(err) => {
                        log::warn!("ignoring malformed bridge frame: {err}");
                        continue;
                    }
                };
                match frame {
                    InboundFrame::PairingCodeResult { request_id, code, error } => {
                        let reply = match (code, error) {
                            (Some(code), _) => Ok(code),
                            (None, Some(error)) => Err(error),
                            (None, None) => Err("empty pairing code result".to_string()),
                        };
                        if !reader_pending.complete(&request_id, reply) {
                            log::debug!("pairing result for unknown request {request_id}");
                        }
                    }
                    InboundFrame::Event(event) => {
                        if let Event::ConnectionUpdate(update) = &event {
                            saw_close |= update.connection == Some(ConnectionPhase::Close);
                        }
                        if event_tx.send(event).await.is_err() {
                            // Receiver dropped: the supervisor moved on.
                            return;
                        }
                        if saw_close {
                            return;
                        }
                    }
                }
            }

            if !saw_close {
                let update = ConnectionUpdate {
                    connection: Some(ConnectionPhase::Close),
                    last_disconnect: Some(DisconnectInfo {
                        status_code: Some(DisconnectReason::ConnectionClosed.code()),
                        message: Some(end_reason),
                    }),
                    ..Default::default()
                };
                let _ = event_tx.send(Event::ConnectionUpdate(update)).await;
            }
        });

        let client = BridgeClient {
            commands: command_tx,
            pending,
            query_timeout: options.query_timeout,
        };

        Ok(Connection {
            client: Arc::new(client),
            events: event_rx,
        })
    }
}

struct BridgeClient {
    commands: mpsc::Sender<OutboundFrame>,
    pending: Arc<PendingRequests>,
    query_timeout: Duration,
}

impl BridgeClient {
    async fn send_frame(&self, frame: OutboundFrame) -> Result<(), SocketError> {
        self.commands
            .send(frame)
            .await
            .map_err(|_| SocketError::ConnectionClosed)
    }
}

#[async_trait]
impl ClientHandle for BridgeClient {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, SocketError> {
        let request_id = self.pending.next_id();
        let reply = self.pending.register(&request_id);
        self.send_frame(OutboundFrame::PairingCode {
            request_id: request_id.clone(),
            phone_number: phone_number.to_string(),
        })
        .await?;

        match timeout(self.query_timeout, reply).await {
            Ok(Ok(Ok(code))) => Ok(code),
            Ok(Ok(Err(error))) => Err(SocketError::Rejected(error)),
            Ok(Err(_)) => Err(SocketError::ConnectionClosed),
            Err(_) => {
                self.pending.cancel(&request_id);
                Err(SocketError::Timeout(self.query_timeout))
            }
        }
    }

    async fn send_message(
        &self,
        to: &JID,
        message: MessageContent,
    ) -> Result<MessageID, SocketError> {
        let message_id = generate_message_id();
        self.send_frame(OutboundFrame::Send {
            message_id: message_id.clone(),
            to: to.clone(),
            message,
        })
        .await?;
        Ok(message_id)
    }

    async fn respond_to_retry(
        &self,
        key: &MessageKey,
        message: Option<MessageContent>,
    ) -> Result<(), SocketError> {
        self.send_frame(OutboundFrame::RetryResponse {
            key: key.clone(),
            message,
        })
        .await
    }

    async fn close(&self) -> Result<(), SocketError> {
        self.send_frame(OutboundFrame::Close).await
    }
}
