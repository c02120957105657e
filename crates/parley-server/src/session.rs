use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use parley_core::errors::RelayError;
use parley_core::identity::{Identity, Role};
use parley_core::wire::{ClientFrame, ServerFrame};

use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::relay::InboundChat;
use crate::server::{RelayDeps, ServerConfig};

/// Lifecycle of one connection. `Connecting` ends when the upgrade
/// completes (before this module sees the socket); terminal is `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    AwaitingAuth,
    Authenticated,
    Closing,
    Closed,
}

fn transition(conn: &str, from: SessionState, to: SessionState) -> SessionState {
    tracing::debug!(conn, ?from, ?to, "session transition");
    to
}

/// Decoded handshake request.
struct AuthRequest {
    role: Role,
    credential: String,
    identity_hint: Option<String>,
}

enum HandshakeError {
    /// Socket went away before authenticating; nothing to report.
    Gone,
    /// Protocol violation or timeout, reported back before closing.
    Rejected(String),
}

/// Drive one WebSocket connection end to end: handshake, authenticated
/// message loop, teardown. Owns the socket.
pub async fn run(socket: WebSocket, deps: Arc<RelayDeps>, config: Arc<ServerConfig>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut state = SessionState::AwaitingAuth;

    // AwaitingAuth: first frame must be `auth`, within the window.
    let auth = match await_auth(&mut ws_rx, &config).await {
        Ok(auth) => auth,
        Err(HandshakeError::Gone) => return,
        Err(HandshakeError::Rejected(message)) => {
            reject(&mut ws_tx, &message).await;
            return;
        }
    };

    let identity = match deps
        .validator
        .validate(auth.role, &auth.credential, auth.identity_hint.as_deref())
        .await
    {
        Ok(identity) => identity,
        Err(e) => {
            tracing::info!(kind = e.error_kind(), "handshake rejected");
            reject(&mut ws_tx, &e.to_string()).await;
            return;
        }
    };

    // Authenticated: register, supersede any prior handle, greet.
    let (outbound_tx, outbound_rx) = mpsc::channel(config.max_send_queue);
    let handle = Arc::new(ConnectionHandle::new(identity.clone(), outbound_tx));

    if let Some(prior) = deps.presence.register(handle.clone()) {
        tracing::info!(
            identity = %identity,
            old_conn = %prior.conn_id,
            new_conn = %handle.conn_id,
            "connection superseded by re-handshake"
        );
        prior.cancel();
    }
    state = transition(handle.conn_id.as_str(), state, SessionState::Authenticated);
    tracing::info!(identity = %identity, conn_id = %handle.conn_id, "client authenticated");

    let visitors = match &identity {
        Identity::Agent { id } => Some(
            deps.presence
                .visitors_of(id)
                .into_iter()
                .filter_map(|v| match v {
                    Identity::Visitor { id, .. } => Some(id),
                    Identity::Agent { .. } => None,
                })
                .collect(),
        ),
        Identity::Visitor { .. } => None,
    };
    handle.send(ServerFrame::AuthSuccess {
        identity_id: identity.id_str().to_string(),
        visitors,
    });
    notify_counterpart(&deps.presence, &identity, true, None);

    let writer = spawn_writer(ws_tx, outbound_rx, handle.clone(), config.clone());

    // Inbound loop. Every frame, well-formed or not, counts as traffic.
    loop {
        tokio::select! {
            _ = handle.cancelled() => break,
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                handle.touch();
                match msg {
                    WsMessage::Text(text) => handle_frame(&deps, &handle, text.as_ref()).await,
                    // axum replies to pings automatically; pongs are traffic only
                    WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Closing: guarded removal, then presence bookkeeping only if this
    // handle was still the canonical one.
    state = transition(handle.conn_id.as_str(), state, SessionState::Closing);
    handle.cancel();

    if deps.presence.unregister(&identity, &handle.conn_id) {
        let now = Utc::now();
        if let Err(e) = deps.last_seen.record(&identity, now).await {
            tracing::warn!(identity = %identity, error = %e, "failed to persist last seen");
        }
        notify_counterpart(&deps.presence, &identity, false, Some(now));
    } else {
        tracing::debug!(
            identity = %identity,
            conn_id = %handle.conn_id,
            "teardown after supersession, registry untouched"
        );
    }

    let _ = writer.await;
    let state = transition(handle.conn_id.as_str(), state, SessionState::Closed);
    debug_assert_eq!(state, SessionState::Closed);
    tracing::info!(identity = %identity, conn_id = %handle.conn_id, "session closed");
}

/// Wait for the handshake frame. Anything other than a timely, well-formed
/// `auth` frame rejects the attempt; a failed handshake is terminal for
/// the connection and is never retried server-side.
async fn await_auth(
    ws_rx: &mut SplitStream<WebSocket>,
    config: &ServerConfig,
) -> Result<AuthRequest, HandshakeError> {
    let first = tokio::time::timeout(config.handshake_timeout, async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => return Some(text),
                WsMessage::Close(_) => return None,
                // control frames before auth are tolerated
                _ => {}
            }
        }
        None
    })
    .await;

    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => return Err(HandshakeError::Gone),
        Err(_) => {
            return Err(HandshakeError::Rejected(
                "handshake not completed in time".into(),
            ))
        }
    };

    match serde_json::from_str::<ClientFrame>(text.as_ref()) {
        Ok(ClientFrame::Auth {
            role,
            credential,
            identity_hint,
        }) => Ok(AuthRequest {
            role,
            credential,
            identity_hint,
        }),
        Ok(_) => Err(HandshakeError::Rejected(
            "first frame must be auth".into(),
        )),
        Err(e) => {
            tracing::warn!(error = %e, "malformed handshake frame");
            Err(HandshakeError::Rejected("malformed handshake".into()))
        }
    }
}

/// Send an error frame and close — used before a handle exists.
async fn reject(ws_tx: &mut SplitSink<WebSocket, WsMessage>, message: &str) {
    let frame = ServerFrame::Error {
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = ws_tx.send(WsMessage::Text(json.into())).await;
    }
    let _ = ws_tx.close().await;
}

/// Writer task: drains the outbound queue onto the socket and sends the
/// periodic server ping. Exits on cancellation or socket death.
fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
    handle: Arc<ConnectionHandle>,
    config: Arc<ServerConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(config.heartbeat_interval);
        ping.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                _ = handle.cancelled() => break,
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(json) = serde_json::to_string(&frame) else { continue };
                    if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = ws_tx.close().await;
    })
}

/// Dispatch one inbound text frame from an authenticated client.
/// Malformed payloads are logged and answered with an error frame — one
/// bad message must not kill the connection.
async fn handle_frame(deps: &RelayDeps, handle: &Arc<ConnectionHandle>, raw: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                identity = %handle.identity,
                error = %e,
                "ignoring malformed payload"
            );
            handle.send(ServerFrame::Error {
                message: "malformed payload".into(),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Ping {} => {
            handle.send(ServerFrame::Pong {});
        }
        ClientFrame::Auth { .. } => {
            handle.send(ServerFrame::Error {
                message: "already authenticated".into(),
            });
        }
        ClientFrame::ChatMessage {
            id,
            content,
            kind,
            recipient_id,
        } => {
            let inbound = InboundChat {
                id,
                content,
                kind,
                recipient_id,
            };
            match deps.router.relay(&handle.identity, inbound).await {
                Ok(outcome) => {
                    let message = outcome.message();
                    handle.send(ServerFrame::MessageSent {
                        id: message.id.clone(),
                        timestamp: message.created_at,
                    });
                }
                Err(e) => {
                    // Relay errors are message-scoped; report and move on
                    tracing::warn!(
                        identity = %handle.identity,
                        kind = e.error_kind(),
                        "relay failed"
                    );
                    handle.send(ServerFrame::Error {
                        message: e.to_string(),
                    });
                    debug_assert!(!matches!(e, RelayError::Transport(_)));
                }
            }
        }
    }
}

/// Tell the counterpart about a presence change: an agent's visitors hear
/// about the agent, a visitor's agent hears about the visitor. Exactly
/// one notification per presence-changing transition.
pub(crate) fn notify_counterpart(
    presence: &PresenceRegistry,
    identity: &Identity,
    online: bool,
    last_seen_at: Option<DateTime<Utc>>,
) {
    let frame = ServerFrame::PresenceChanged {
        identity_id: identity.id_str().to_string(),
        online,
        last_seen_at,
    };

    match identity {
        Identity::Agent { id } => {
            for visitor in presence.visitors_of(id) {
                if let Some(handle) = presence.lookup(&visitor) {
                    handle.send(frame.clone());
                }
            }
        }
        Identity::Visitor { agent_id, .. } => {
            if let Some(handle) = presence.lookup(&Identity::agent(agent_id.clone())) {
                handle.send(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::{AgentId, VisitorId};

    fn register(
        presence: &PresenceRegistry,
        identity: Identity,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = Arc::new(ConnectionHandle::new(identity, tx));
        presence.register(handle.clone());
        (handle, rx)
    }

    #[test]
    fn visitor_offline_notifies_its_agent_only() {
        let presence = PresenceRegistry::new();
        let agent_id = AgentId::new();
        let other_agent_id = AgentId::new();

        let (_agent, mut agent_rx) = register(&presence, Identity::agent(agent_id.clone()));
        let (_other, mut other_rx) = register(&presence, Identity::agent(other_agent_id));

        let visitor = Identity::visitor(VisitorId::new(), agent_id);
        let seen = Utc::now();
        notify_counterpart(&presence, &visitor, false, Some(seen));

        match agent_rx.try_recv().unwrap() {
            ServerFrame::PresenceChanged {
                identity_id,
                online,
                last_seen_at,
            } => {
                assert_eq!(identity_id, visitor.id_str());
                assert!(!online);
                assert_eq!(last_seen_at, Some(seen));
            }
            other => panic!("expected presence_changed, got {other:?}"),
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn agent_online_notifies_each_online_visitor_once() {
        let presence = PresenceRegistry::new();
        let agent_id = AgentId::new();

        let v1 = Identity::visitor(VisitorId::new(), agent_id.clone());
        let v2 = Identity::visitor(VisitorId::new(), agent_id.clone());
        let (_h1, mut rx1) = register(&presence, v1);
        let (_h2, mut rx2) = register(&presence, v2);

        notify_counterpart(&presence, &Identity::agent(agent_id), true, None);

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                ServerFrame::PresenceChanged { online, .. } => assert!(online),
                other => panic!("expected presence_changed, got {other:?}"),
            }
            assert!(rx.try_recv().is_err(), "exactly one notification");
        }
    }

    #[test]
    fn offline_counterpart_notification_is_a_noop() {
        let presence = PresenceRegistry::new();
        let visitor = Identity::visitor(VisitorId::new(), AgentId::new());
        // Agent not online — must not panic or queue anything
        notify_counterpart(&presence, &visitor, true, None);
    }
}
