//! Connection supervisor.
//!
//! Owns one connection to the protocol client at a time. Each attempt fetches
//! the client version, loads credentials, connects and pumps events until the
//! connection closes. A close is followed by a delayed reconnect unless the
//! session was logged out. Cancellation interrupts both the pump and the
//! delay.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::handler::{dispatch, route_upsert, BotContext, EventHandler, Route, StatusEvent};
use crate::protocol::{
    fetch_latest_version, format_pairing_code, normalize_phone_number, render_qr_terminal,
    WaVersion,
};
use crate::socket::{ClientHandle, Connection, Connector, SocketError, SocketOptions};
use crate::state::{ConnectionState, GatewayState};
use crate::store::{AuthStateError, LightweightStore, MultiFileAuthState};
use crate::types::{
    ConnectionPhase, ConnectionUpdate, Credentials, DisconnectReason, Event, MessageKey, JID,
};

/// Delay schedule between connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    /// Growth per consecutive failure; 1.0 keeps the delay fixed
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Give up after this many consecutive failed attempts; `None` never does
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            max_attempts: None,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier: 2.0,
            max_delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay.max(self.initial_delay);
        }
        Duration::from_secs_f64(scaled)
    }

    /// Whether retry number `attempt` may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Outcome of applying a `connection.update` to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Connecting,
    Opened,
    /// Closed for a reason other than logout; reconnect after the delay
    Reconnect(Option<DisconnectReason>),
    /// Closed because the session was logged out; stay closed
    LoggedOut,
}

impl ConnectionState {
    /// Advance on a lifecycle event. QR-only updates do not transition.
    pub fn apply(&mut self, update: &ConnectionUpdate) -> Transition {
        let Some(phase) = update.connection else {
            return Transition::Unchanged;
        };
        match phase {
            ConnectionPhase::Connecting => {
                *self = ConnectionState::Connecting;
                Transition::Connecting
            }
            ConnectionPhase::Open => {
                *self = ConnectionState::Open;
                Transition::Opened
            }
            ConnectionPhase::Close => {
                *self = ConnectionState::Closed;
                let reason = update.last_disconnect.as_ref().and_then(|info| info.reason());
                if reason == Some(DisconnectReason::LoggedOut) {
                    Transition::LoggedOut
                } else {
                    Transition::Reconnect(reason)
                }
            }
        }
    }
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    LoggedOut,
    RetriesExhausted,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to load auth state: {0}")]
    Auth(#[from] AuthStateError),
    #[error("failed to connect: {0}")]
    Socket(#[from] SocketError),
}

enum SessionEnd {
    Cancelled,
    LoggedOut,
    Closed { was_open: bool },
}

/// Supervises the connection and routes its events.
pub struct Supervisor {
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    auth: MultiFileAuthState,
    store: Arc<LightweightStore>,
    handler: Arc<dyn EventHandler>,
    state: GatewayState,
}

impl Supervisor {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        auth: MultiFileAuthState,
        store: Arc<LightweightStore>,
        handler: Arc<dyn EventHandler>,
        state: GatewayState,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            auth,
            store,
            handler,
            state,
        }
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Keep a connection alive until logout, cancellation or retry exhaustion.
    pub async fn run(&self, cancel: CancellationToken) -> SupervisorExit {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return SupervisorExit::Cancelled;
            }

            self.state.set_connection(ConnectionState::Connecting);
            match self.start().await {
                Ok((connection, creds)) => match self.pump(connection, creds, &cancel).await {
                    SessionEnd::Cancelled => return SupervisorExit::Cancelled,
                    SessionEnd::LoggedOut => {
                        log::warn!("session logged out, not reconnecting");
                        return SupervisorExit::LoggedOut;
                    }
                    SessionEnd::Closed { was_open } => {
                        if was_open {
                            attempt = 0;
                        }
                    }
                },
                Err(err) => {
                    self.state.set_connection(ConnectionState::Closed);
                    log::error!("failed to start connection: {err}");
                }
            }

            attempt = attempt.saturating_add(1);
            if !self.config.retry.allows(attempt) {
                log::error!("giving up after {attempt} consecutive failed attempts");
                return SupervisorExit::RetriesExhausted;
            }
            let delay = self.config.retry.delay_for(attempt);
            log::info!("reconnecting in {}s (attempt {attempt})", delay.as_secs_f32());
            tokio::select! {
                _ = cancel.cancelled() => return SupervisorExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn start(&self) -> Result<(Connection, Credentials), StartError> {
        let version = match &self.config.version_url {
            Some(url) => fetch_latest_version(url, self.config.version_timeout).await,
            None => WaVersion::default(),
        };
        log::info!("using WA v{version}, isLatest: {}", version.is_latest);

        let creds = self.auth.load()?;
        self.state.set_registered(creds.registered);

        let options = SocketOptions {
            version,
            ..self.config.socket.clone()
        };
        let connection = self.connector.connect(&options, &creds).await?;
        Ok((connection, creds))
    }

    async fn pump(
        &self,
        connection: Connection,
        creds: Credentials,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let Connection { client, mut events } = connection;
        let ctx = BotContext {
            client: client.clone(),
            bot_name: self.config.bot_name.clone(),
            owner: JID::from_phone(&self.config.owner_number),
            public: self.config.public,
        };

        let mut pairing = (!creds.registered).then(|| self.spawn_pairing_request(client.clone()));
        let mut connection_state = ConnectionState::Idle;
        let mut was_open = false;

        let end = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = client.close().await {
                        log::debug!("close on shutdown failed: {err}");
                    }
                    break SessionEnd::Cancelled;
                }
                event = events.recv() => event,
            };
            let Some(event) = event else {
                log::warn!("event stream ended without a close update");
                break SessionEnd::Closed { was_open };
            };

            if let Err(err) = self.store.bind(&event) {
                log::error!("store failed to apply {}: {err}", event.name());
            }

            match event {
                Event::CredsUpdate(creds) => {
                    self.state.set_registered(creds.registered);
                    if creds.registered {
                        if let Some(task) = pairing.take() {
                            task.abort();
                        }
                    }
                    if let Err(err) = self.auth.save_creds(&creds) {
                        log::error!("failed to save credentials: {err}");
                    }
                }
                Event::KeysUpdate(keys) => {
                    if let Err(err) = self.auth.apply_keys(&keys) {
                        log::error!("failed to save signal keys: {err}");
                    }
                }
                Event::ConnectionUpdate(update) => {
                    if let Some(qr) = &update.qr {
                        self.on_qr(qr);
                    }
                    let transition = connection_state.apply(&update);
                    self.state.set_connection(connection_state);
                    match transition {
                        Transition::Unchanged => {}
                        Transition::Connecting => log::info!("connecting..."),
                        Transition::Opened => {
                            was_open = true;
                            let user = self.auth_user().unwrap_or_else(|| "UNKNOWN".into());
                            log::info!("connected as {user}");
                        }
                        Transition::Reconnect(reason) => {
                            log::warn!("connection closed ({reason:?}), will reconnect");
                            break SessionEnd::Closed { was_open };
                        }
                        Transition::LoggedOut => break SessionEnd::LoggedOut,
                    }
                }
                Event::MessagesUpsert(upsert) => {
                    for route in route_upsert(upsert, ctx.public) {
                        self.forward(route, &ctx).await;
                    }
                }
                Event::GroupParticipantsUpdate(update) => {
                    dispatch("group participants", &self.handler, &ctx, |handler, ctx| async move {
                        handler.handle_group_participants(&ctx, update).await
                    })
                    .await
                }
                Event::StatusUpdate(update) => {
                    dispatch("status", &self.handler, &ctx, |handler, ctx| async move {
                        handler.handle_status(&ctx, StatusEvent::Update(update)).await
                    })
                    .await
                }
                Event::RetryRequest(key) => self.answer_retry(client.as_ref(), &key).await,
                Event::ContactsUpsert(_) | Event::ChatsUpsert(_) => {}
            }
        };

        if let Some(task) = pairing.take() {
            task.abort();
        }
        end
    }

    async fn forward(&self, route: Route, ctx: &BotContext) {
        match route {
            Route::Drop => {}
            Route::Status(upsert) => {
                dispatch("status", &self.handler, ctx, |handler, ctx| async move {
                    handler.handle_status(&ctx, StatusEvent::Broadcast(upsert)).await
                })
                .await
            }
            Route::Messages(upsert) => {
                dispatch("message", &self.handler, ctx, |handler, ctx| async move {
                    handler.handle_messages(&ctx, upsert).await
                })
                .await
            }
        }
    }

    fn on_qr(&self, qr: &str) {
        self.state.set_qr(qr);
        log::info!("QR code generated, scan it with WhatsApp");
        if self.config.print_qr_in_terminal {
            match render_qr_terminal(qr) {
                Ok(rendered) => println!("{rendered}"),
                Err(err) => log::warn!("could not render QR code: {err}"),
            }
        }
    }

    fn auth_user(&self) -> Option<String> {
        let creds = self.auth.load().ok()?;
        creds.me?.get("id")?.as_str().map(str::to_string)
    }

    async fn answer_retry(&self, client: &dyn ClientHandle, key: &MessageKey) {
        let stored = match self.store.load_message(&key.remote_jid, &key.id) {
            Ok(stored) => stored,
            Err(err) => {
                log::error!("store lookup for resend of {} failed: {err}", key.id);
                None
            }
        };
        let message = stored.and_then(|m| m.message);
        if message.is_none() {
            log::debug!("no stored payload for resend of {}", key.id);
        }
        if let Err(err) = client.respond_to_retry(key, message).await {
            log::warn!("failed to answer resend request for {}: {err}", key.id);
        }
    }

    fn spawn_pairing_request(&self, client: Arc<dyn ClientHandle>) -> JoinHandle<()> {
        let delay = self.config.pairing_delay;
        let phone = normalize_phone_number(&self.config.owner_number);
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match client.request_pairing_code(&phone.digits).await {
                Ok(code) => {
                    let code = format_pairing_code(&code);
                    log::info!("your pairing code: {code}");
                    log::info!("enter it in WhatsApp > Settings > Linked Devices > Link a Device");
                    state.set_pairing_code(code);
                }
                Err(err) => log::error!("failed to request pairing code: {err}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use crate::types::{
        GroupParticipantsUpdate, MessageContent, MessageID, MessagesUpsert, UpsertKind, WebMessage,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(50), Duration::from_secs(5));
        assert!(policy.allows(u32::MAX));
    }

    #[test]
    fn test_exponential_policy() {
        let policy = RetryPolicy::exponential(Duration::from_secs(5), Duration::from_secs(60))
            .with_max_attempts(3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(400), Duration::from_secs(60));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }

    #[test]
    fn test_state_machine() {
        let mut state = ConnectionState::Idle;
        assert_eq!(state.apply(&ConnectionUpdate::qr("qr")), Transition::Unchanged);
        assert_eq!(state, ConnectionState::Idle);

        assert_eq!(
            state.apply(&ConnectionUpdate::phase(ConnectionPhase::Connecting)),
            Transition::Connecting
        );
        assert_eq!(
            state.apply(&ConnectionUpdate::phase(ConnectionPhase::Open)),
            Transition::Opened
        );
        assert_eq!(state, ConnectionState::Open);

        assert_eq!(
            state.apply(&ConnectionUpdate::closed(Some(515))),
            Transition::Reconnect(Some(DisconnectReason::RestartRequired))
        );
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(state.apply(&ConnectionUpdate::closed(None)), Transition::Reconnect(None));
        assert_eq!(state.apply(&ConnectionUpdate::closed(Some(401))), Transition::LoggedOut);
    }

    /// Client handle that records what the supervisor asks of it.
    #[derive(Default)]
    struct RecordingClient {
        pairing_requests: Mutex<Vec<String>>,
        retries: Mutex<Vec<(MessageKey, Option<MessageContent>)>>,
    }

    #[async_trait]
    impl ClientHandle for RecordingClient {
        async fn request_pairing_code(&self, phone_number: &str) -> Result<String, SocketError> {
            self.pairing_requests.lock().unwrap().push(phone_number.to_string());
            Ok("ABCD1234".into())
        }

        async fn send_message(
            &self,
            _to: &JID,
            _message: MessageContent,
        ) -> Result<MessageID, SocketError> {
            Ok("ID".into())
        }

        async fn respond_to_retry(
            &self,
            key: &MessageKey,
            message: Option<MessageContent>,
        ) -> Result<(), SocketError> {
            self.retries.lock().unwrap().push((key.clone(), message));
            Ok(())
        }

        async fn close(&self) -> Result<(), SocketError> {
            Ok(())
        }
    }

    /// Connector that replays one scripted event list per connection attempt.
    /// A `None` script makes the attempt fail.
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Option<Vec<Event>>>>,
        attempts: Mutex<Vec<tokio::time::Instant>>,
        client: Arc<RecordingClient>,
        keep_open: Mutex<Vec<mpsc::Sender<Event>>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Option<Vec<Event>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                attempts: Mutex::new(Vec::new()),
                client: Arc::new(RecordingClient::default()),
                keep_open: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<tokio::time::Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            _options: &SocketOptions,
            _creds: &Credentials,
        ) -> Result<Connection, SocketError> {
            self.attempts.lock().unwrap().push(tokio::time::Instant::now());
            let script = self.scripts.lock().unwrap().pop_front();
            let events = match script {
                Some(Some(events)) => events,
                Some(None) => return Err(SocketError::ConnectionFailed("scripted failure".into())),
                // Out of script: connect and stay silent.
                None => Vec::new(),
            };
            let (tx, rx) = mpsc::channel(events.len() + 1);
            for event in events {
                tx.try_send(event).unwrap();
            }
            self.keep_open.lock().unwrap().push(tx);
            Ok(Connection {
                client: self.client.clone(),
                events: rx,
            })
        }
    }

    /// Handler that records calls and fails on messages containing "boom".
    #[derive(Default)]
    struct RecordingHandler {
        messages: Mutex<Vec<String>>,
        statuses: Mutex<usize>,
        groups: Mutex<usize>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_messages(
            &self,
            _ctx: &BotContext,
            upsert: MessagesUpsert,
        ) -> Result<(), HandlerError> {
            let body = upsert.messages[0]
                .message
                .as_ref()
                .and_then(|m| m.body())
                .unwrap_or_default()
                .to_string();
            if body == "panic" {
                panic!("handler blew up");
            }
            self.messages.lock().unwrap().push(body.clone());
            if body == "boom" {
                return Err(HandlerError::Failed("boom".into()));
            }
            Ok(())
        }

        async fn handle_group_participants(
            &self,
            _ctx: &BotContext,
            _update: GroupParticipantsUpdate,
        ) -> Result<(), HandlerError> {
            *self.groups.lock().unwrap() += 1;
            Ok(())
        }

        async fn handle_status(
            &self,
            _ctx: &BotContext,
            _status: StatusEvent,
        ) -> Result<(), HandlerError> {
            *self.statuses.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Harness {
        supervisor: Arc<Supervisor>,
        connector: Arc<ScriptedConnector>,
        handler: Arc<RecordingHandler>,
        store: Arc<LightweightStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(scripts: Vec<Option<Vec<Event>>>, retry: RetryPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::default()
            .with_session_dir(dir.path().join("session"))
            .with_store_path(dir.path().join("store.json"))
            .with_version_url(None)
            .with_retry(retry)
            .with_terminal_qr(false);
        let auth = MultiFileAuthState::open(&config.session_dir).unwrap();
        let store = Arc::new(LightweightStore::new(&config.store_path, 20));
        let connector = ScriptedConnector::new(scripts);
        let handler = Arc::new(RecordingHandler::default());
        let supervisor = Arc::new(Supervisor::new(
            config,
            connector.clone(),
            auth,
            store.clone(),
            handler.clone(),
            GatewayState::new(),
        ));
        Harness {
            supervisor,
            connector,
            handler,
            store,
            _dir: dir,
        }
    }

    fn connection(update: ConnectionUpdate) -> Event {
        Event::ConnectionUpdate(update)
    }

    fn text_upsert(chat: &str, id: &str, content: MessageContent) -> Event {
        Event::MessagesUpsert(MessagesUpsert {
            messages: vec![WebMessage {
                key: MessageKey {
                    remote_jid: chat.parse().unwrap(),
                    from_me: false,
                    id: id.into(),
                    participant: None,
                },
                message: Some(content),
                push_name: None,
                timestamp: 0,
            }],
            kind: UpsertKind::Notify,
        })
    }

    fn registered() -> Event {
        Event::CredsUpdate(Credentials {
            registered: true,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_schedules_one_reconnect_after_delay() {
        let h = harness(
            vec![
                Some(vec![
                    registered(),
                    connection(ConnectionUpdate::phase(ConnectionPhase::Open)),
                    connection(ConnectionUpdate::closed(Some(428))),
                ]),
                Some(vec![
                    registered(),
                    connection(ConnectionUpdate::phase(ConnectionPhase::Open)),
                ]),
            ],
            RetryPolicy::default(),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let supervisor = h.supervisor.clone();
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 2, "exactly one reconnect");
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(5));
        assert_eq!(h.supervisor.state().snapshot().connection, ConnectionState::Open);

        cancel.cancel();
        assert_eq!(run.await.unwrap(), SupervisorExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_close_does_not_reconnect() {
        let h = harness(
            vec![Some(vec![
                registered(),
                connection(ConnectionUpdate::phase(ConnectionPhase::Open)),
                connection(ConnectionUpdate::closed(Some(401))),
            ])],
            RetryPolicy::default(),
        );
        let exit = h.supervisor.run(CancellationToken::new()).await;
        assert_eq!(exit, SupervisorExit::LoggedOut);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.attempts().len(), 1);
        assert_eq!(h.supervisor.state().snapshot().connection, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_retries_until_exhausted() {
        let retry = RetryPolicy::fixed(Duration::from_secs(5)).with_max_attempts(2);
        let h = harness(vec![None, None, None], retry);
        let exit = h.supervisor.run(CancellationToken::new()).await;
        assert_eq!(exit, SupervisorExit::RetriesExhausted);
        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2] - attempts[1], Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_reconnect_delay() {
        let h = harness(vec![None], RetryPolicy::fixed(Duration::from_secs(3600)));
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let supervisor = h.supervisor.clone();
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(run.await.unwrap(), SupervisorExit::Cancelled);
        assert_eq!(h.connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_does_not_stop_later_events() {
        let h = harness(
            vec![Some(vec![
                registered(),
                connection(ConnectionUpdate::phase(ConnectionPhase::Open)),
                text_upsert("111@s.whatsapp.net", "A", MessageContent::text("boom")),
                text_upsert("111@s.whatsapp.net", "B", MessageContent::text("panic")),
                text_upsert(
                    "111@s.whatsapp.net",
                    "C",
                    MessageContent::ephemeral(MessageContent::text("after")),
                ),
                text_upsert("status@broadcast", "D", MessageContent::text("story")),
                connection(ConnectionUpdate::closed(Some(401))),
            ])],
            RetryPolicy::default(),
        );
        let exit = h.supervisor.run(CancellationToken::new()).await;
        assert_eq!(exit, SupervisorExit::LoggedOut);
        assert_eq!(
            *h.handler.messages.lock().unwrap(),
            vec!["boom".to_string(), "after".to_string()]
        );
        assert_eq!(*h.handler.statuses.lock().unwrap(), 1);

        // Every message reached the store, including the failed ones.
        let chat: JID = "111@s.whatsapp.net".parse().unwrap();
        assert_eq!(h.store.message_count(&chat).unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_qr_pairing_code_and_retry_requests() {
        let key = MessageKey {
            remote_jid: "111@s.whatsapp.net".parse().unwrap(),
            from_me: true,
            id: "SENT1".into(),
            participant: None,
        };
        let h = harness(
            vec![Some(vec![
                connection(ConnectionUpdate::qr("2@first")),
                connection(ConnectionUpdate::qr("2@second")),
                text_upsert("111@s.whatsapp.net", "SENT1", MessageContent::text("original")),
                Event::RetryRequest(key.clone()),
            ])],
            RetryPolicy::default(),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let supervisor = h.supervisor.clone();
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = h.supervisor.state().snapshot();
        assert_eq!(snapshot.qr.as_deref(), Some("2@second"));
        assert_eq!(snapshot.pairing_code.as_deref(), Some("ABCD-1234"));
        assert_eq!(
            *h.connector.client.pairing_requests.lock().unwrap(),
            vec!["911234567890".to_string()]
        );

        let retries = h.connector.client.retries.lock().unwrap().clone();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].0, key);
        assert_eq!(retries[0].1.as_ref().and_then(|m| m.body()), Some("original"));

        cancel.cancel();
        assert_eq!(run.await.unwrap(), SupervisorExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creds_update_is_persisted() {
        let h = harness(
            vec![Some(vec![
                registered(),
                connection(ConnectionUpdate::closed(Some(401))),
            ])],
            RetryPolicy::default(),
        );
        h.supervisor.run(CancellationToken::new()).await;
        let auth = h.supervisor.auth.clone();
        assert!(auth.load().unwrap().registered);
        assert!(h.supervisor.state().snapshot().registered);
        assert!(h.connector.client.pairing_requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_session_still_connects() {
        let h = harness(
            vec![Some(vec![connection(ConnectionUpdate::closed(Some(401)))])],
            RetryPolicy::default().with_max_attempts(3),
        );
        std::fs::write(h.supervisor.auth.dir().join("creds.json"), "{truncated").unwrap();

        let exit = h.supervisor.run(CancellationToken::new()).await;
        assert_eq!(exit, SupervisorExit::LoggedOut);
        assert_eq!(h.connector.attempts().len(), 1);
        assert!(!h.supervisor.state().snapshot().registered);
    }
}
