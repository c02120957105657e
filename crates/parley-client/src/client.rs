use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::identity::Role;
use parley_core::ids::{MessageId, VisitorId};
use parley_core::message::MessageKind;
use parley_core::wire::{ClientFrame, ServerFrame};

use crate::backoff::ReconnectPolicy;

/// Client configuration. Credentials are re-sent on every reconnect;
/// there is no session-resumption shortcut.
#[derive(Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9090/ws`.
    pub url: String,
    pub role: Role,
    pub credential: SecretString,
    pub identity_hint: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, role: Role, credential: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            role,
            credential: SecretString::from(credential.into()),
            identity_hint: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection lifecycle as observed by the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
    Closed,
}

/// Events surfaced to the application.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Connected {
        identity_id: String,
        visitors: Option<Vec<VisitorId>>,
    },
    MessageSent {
        id: MessageId,
        timestamp: DateTime<Utc>,
    },
    MessageReceived {
        id: MessageId,
        content: String,
        kind: MessageKind,
        sender_id: String,
        timestamp: DateTime<Utc>,
    },
    PresenceChanged {
        identity_id: String,
        online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    },
    /// A message-scoped error from the server; the connection stays up.
    ServerError {
        message: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Retry budget exhausted or credential rejected — terminal.
    Failed {
        message: String,
    },
    /// Explicit close — terminal, never retried.
    Closed,
}

/// How one connection attempt ended.
enum ConnectionEnd {
    /// User asked to close; skip reconnection entirely.
    Manual,
    /// Transport dropped after the session was open.
    Dropped,
    /// Could not establish or authenticate within the attempt.
    ConnectFailed(String),
    /// Server rejected the credential — retrying won't help.
    AuthRejected(String),
}

/// Relay client handle. Spawns a background task that owns the socket
/// and the reconnection state machine.
pub struct RelayClient {
    command_tx: mpsc::Sender<ClientFrame>,
    shutdown: CancellationToken,
    state: Arc<RwLock<ClientState>>,
    _task: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Start the client. Events arrive on the returned receiver.
    pub fn start(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        let state = Arc::new(RwLock::new(ClientState::Idle));

        let task = tokio::spawn(run(
            config,
            command_rx,
            event_tx,
            shutdown.clone(),
            state.clone(),
        ));

        (
            Self {
                command_tx,
                shutdown,
                state,
                _task: task,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Queue a chat message. Fails if the client task has terminated.
    pub async fn send_chat(
        &self,
        content: impl Into<String>,
        kind: MessageKind,
        recipient_id: Option<VisitorId>,
    ) -> Result<(), mpsc::error::SendError<ClientFrame>> {
        self.command_tx
            .send(ClientFrame::ChatMessage {
                id: Some(MessageId::new()),
                content: content.into(),
                kind,
                recipient_id,
            })
            .await
    }

    /// Explicit close: terminal, bypasses reconnection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

fn set_state(state: &RwLock<ClientState>, to: ClientState) {
    let mut s = state.write();
    if *s != to {
        debug!(from = ?*s, to = ?to, "client state");
        *s = to;
    }
}

/// Reconnection controller: `Idle → Connecting → Open → Reconnecting →
/// (Open | Failed)`; explicit close is terminal from any state.
async fn run(
    config: ClientConfig,
    mut command_rx: mpsc::Receiver<ClientFrame>,
    event_tx: mpsc::Sender<ClientEvent>,
    shutdown: CancellationToken,
    state: Arc<RwLock<ClientState>>,
) {
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            set_state(&state, ClientState::Closed);
            let _ = event_tx.send(ClientEvent::Closed).await;
            return;
        }

        set_state(&state, ClientState::Connecting);
        let end = connect_and_run(&config, &mut command_rx, &event_tx, &shutdown, &state).await;

        match end {
            ConnectionEnd::Manual => {
                set_state(&state, ClientState::Closed);
                let _ = event_tx.send(ClientEvent::Closed).await;
                return;
            }
            ConnectionEnd::AuthRejected(message) => {
                warn!(message, "credential rejected");
                set_state(&state, ClientState::Failed);
                let _ = event_tx.send(ClientEvent::Failed { message }).await;
                return;
            }
            ConnectionEnd::Dropped => {
                // A session was open; its drop starts a fresh attempt series.
                attempt = 0;
            }
            ConnectionEnd::ConnectFailed(reason) => {
                debug!(reason, attempt, "connection attempt failed");
            }
        }

        if config.reconnect.is_exhausted(attempt) {
            set_state(&state, ClientState::Failed);
            let _ = event_tx
                .send(ClientEvent::Failed {
                    message: format!(
                        "gave up after {} reconnection attempts",
                        config.reconnect.max_attempts
                    ),
                })
                .await;
            return;
        }

        let delay = config.reconnect.delay_for(attempt);
        set_state(&state, ClientState::Reconnecting);
        let _ = event_tx
            .send(ClientEvent::Reconnecting { attempt, delay })
            .await;
        attempt += 1;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                set_state(&state, ClientState::Closed);
                let _ = event_tx.send(ClientEvent::Closed).await;
                return;
            }
        }
    }
}

/// One full connection attempt: transport connect, fresh handshake,
/// then the open-session loop. Heartbeats run only while the session is
/// open and stop the moment this function returns.
async fn connect_and_run(
    config: &ClientConfig,
    command_rx: &mut mpsc::Receiver<ClientFrame>,
    event_tx: &mpsc::Sender<ClientEvent>,
    shutdown: &CancellationToken,
    state: &Arc<RwLock<ClientState>>,
) -> ConnectionEnd {
    let connect = tokio::time::timeout(config.handshake_timeout, connect_async(config.url.as_str()));
    let ws = tokio::select! {
        res = connect => match res {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return ConnectionEnd::ConnectFailed(e.to_string()),
            Err(_) => return ConnectionEnd::ConnectFailed("connect timed out".into()),
        },
        _ = shutdown.cancelled() => return ConnectionEnd::Manual,
    };

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Every connection re-runs the full handshake.
    let auth = ClientFrame::Auth {
        role: config.role,
        credential: config.credential.expose_secret().to_string(),
        identity_hint: config.identity_hint.clone(),
    };
    let Ok(json) = serde_json::to_string(&auth) else {
        return ConnectionEnd::ConnectFailed("failed to encode auth frame".into());
    };
    if ws_tx.send(Message::Text(json.into())).await.is_err() {
        return ConnectionEnd::ConnectFailed("socket closed during handshake".into());
    }

    // Await auth_success before considering the session open.
    let greeting = tokio::time::timeout(config.handshake_timeout, async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Text(text) = msg {
                return serde_json::from_str::<ServerFrame>(text.as_ref()).ok();
            }
        }
        None
    })
    .await;

    match greeting {
        Ok(Some(ServerFrame::AuthSuccess {
            identity_id,
            visitors,
        })) => {
            info!(identity_id, "authenticated");
            set_state(state, ClientState::Open);
            let _ = event_tx
                .send(ClientEvent::Connected {
                    identity_id,
                    visitors,
                })
                .await;
        }
        Ok(Some(ServerFrame::Error { message })) => {
            return ConnectionEnd::AuthRejected(message);
        }
        Ok(_) => return ConnectionEnd::ConnectFailed("handshake reply missing".into()),
        Err(_) => return ConnectionEnd::ConnectFailed("handshake timed out".into()),
    }

    // Open: heartbeat starts only now.
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return ConnectionEnd::Manual;
            }
            cmd = command_rx.recv() => {
                let Some(frame) = cmd else {
                    // Application dropped the handle
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return ConnectionEnd::Manual;
                };
                let Ok(json) = serde_json::to_string(&frame) else { continue };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    return ConnectionEnd::Dropped;
                }
            }
            _ = heartbeat.tick() => {
                let ping = serde_json::to_string(&ClientFrame::Ping {})
                    .unwrap_or_else(|_| r#"{"type":"ping"}"#.into());
                if ws_tx.send(Message::Text(ping.into())).await.is_err() {
                    return ConnectionEnd::Dropped;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_server_frame(text.as_ref(), event_tx).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return ConnectionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn handle_server_frame(raw: &str, event_tx: &mpsc::Sender<ClientEvent>) {
    let frame = match serde_json::from_str::<ServerFrame>(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "ignoring malformed server frame");
            return;
        }
    };

    let event = match frame {
        ServerFrame::MessageSent { id, timestamp } => ClientEvent::MessageSent { id, timestamp },
        ServerFrame::MessageReceived {
            id,
            content,
            kind,
            sender_id,
            timestamp,
        } => ClientEvent::MessageReceived {
            id,
            content,
            kind,
            sender_id,
            timestamp,
        },
        ServerFrame::PresenceChanged {
            identity_id,
            online,
            last_seen_at,
        } => ClientEvent::PresenceChanged {
            identity_id,
            online,
            last_seen_at,
        },
        ServerFrame::Error { message } => ClientEvent::ServerError { message },
        ServerFrame::Pong {} => return,
        ServerFrame::AuthSuccess { .. } => return, // already handled at handshake
    };

    let _ = event_tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::AgentId;
    use parley_server::{RelayDeps, ServerConfig};
    use parley_store::keys::{KeyRepo, SqliteCredentialValidator};
    use parley_store::last_seen::LastSeenRepo;
    use parley_store::messages::SqliteMessageStore;
    use parley_store::Database;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn boot_server() -> (String, Database) {
        let db = Database::in_memory().unwrap();
        let deps = RelayDeps::new(
            Arc::new(SqliteMessageStore::new(db.clone())),
            Arc::new(SqliteCredentialValidator::new(db.clone())),
            Arc::new(LastSeenRepo::new(db.clone())),
        );
        let handle = parley_server::start(
            ServerConfig {
                port: 0,
                ..Default::default()
            },
            deps,
        )
        .await
        .unwrap();
        (format!("ws://127.0.0.1:{}/ws", handle.port), db)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed")
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn connects_and_acks_a_message() {
        let (url, db) = boot_server().await;
        let agent_id = AgentId::new();
        let key = KeyRepo::new(db).issue(&agent_id, None).unwrap();

        let config = ClientConfig::new(url, Role::Agent, key.key.as_str());
        let (client, mut events) = RelayClient::start(config);

        match next_event(&mut events).await {
            ClientEvent::Connected { identity_id, visitors } => {
                assert_eq!(identity_id, agent_id.as_str());
                assert_eq!(visitors, Some(vec![]));
            }
            other => panic!("expected Connected, got {other:?}"),
        }
        assert_eq!(client.state(), ClientState::Open);

        // Agent without recipient gets a message-scoped error, not a drop
        client
            .send_chat("hello?", MessageKind::Text, None)
            .await
            .unwrap();
        match next_event(&mut events).await {
            ClientEvent::ServerError { message } => {
                assert!(message.contains("recipient"), "got: {message}");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
        assert_eq!(client.state(), ClientState::Open);

        client.close();
        loop {
            if matches!(next_event(&mut events).await, ClientEvent::Closed) {
                break;
            }
        }
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn invalid_credential_is_terminal() {
        let (url, _db) = boot_server().await;

        let mut config = ClientConfig::new(url, Role::Agent, "key_bogus");
        config.reconnect = fast_policy(5);
        let (client, mut events) = RelayClient::start(config);

        match next_event(&mut events).await {
            ClientEvent::Failed { message } => {
                assert_eq!(message, "invalid or expired credential");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[tokio::test]
    async fn exhausts_budget_against_dead_endpoint() {
        // Nothing listens here
        let mut config = ClientConfig::new("ws://127.0.0.1:1/ws", Role::Agent, "key_x");
        config.reconnect = fast_policy(3);
        let (client, mut events) = RelayClient::start(config);

        let mut reconnects = 0;
        loop {
            match next_event(&mut events).await {
                ClientEvent::Reconnecting { attempt, delay } => {
                    assert_eq!(attempt, reconnects);
                    assert_eq!(delay, config_delay(reconnects));
                    reconnects += 1;
                }
                ClientEvent::Failed { .. } => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(reconnects, 3, "one backoff per budgeted attempt");
        assert_eq!(client.state(), ClientState::Failed);
    }

    fn config_delay(attempt: u32) -> Duration {
        fast_policy(3).delay_for(attempt)
    }

    #[tokio::test]
    async fn manual_close_during_backoff_is_immediate() {
        let mut config = ClientConfig::new("ws://127.0.0.1:1/ws", Role::Agent, "key_x");
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
        };
        let (client, mut events) = RelayClient::start(config);

        // Wait until the controller parks in its first long backoff
        match next_event(&mut events).await {
            ClientEvent::Reconnecting { .. } => {}
            other => panic!("expected Reconnecting, got {other:?}"),
        }

        client.close();
        match next_event(&mut events).await {
            ClientEvent::Closed => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        assert_eq!(client.state(), ClientState::Closed);
    }
}
