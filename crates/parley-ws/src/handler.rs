use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parley_core::auth::Identity;
use parley_core::presence::ConnectOutcome;
use parley_core::rooms::{ConnectionId, RoomId, ServerEvent};
use parley_core::AppState;
use parley_models::gateway::*;
use parley_models::message::{MessageContent, MessageStatus};
use parley_models::presence::Presence;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::session::Session;

const AUTH_ERROR_MESSAGE: &str = "Authentication error";
const CLOSE_GOING_AWAY: u16 = 1001;

async fn send_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &str,
    data: Value,
) -> Result<(), ()> {
    let frame = GatewayFrame::new(event, data);
    let text = serde_json::to_string(&frame).map_err(|_| ())?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

async fn reject(sender: &mut (impl SinkExt<Message> + Unpin), message: &str) {
    let _ = send_frame(sender, EVENT_ERROR, json!({ "message": message })).await;
    let _ = send_close(sender, CLOSE_AUTH_FAILED, message).await;
}

/// Reads frames until the client sends `authenticate`. Anything else before
/// that is ignored.
async fn wait_for_authenticate(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<GatewayFrame>(text.as_str()) else {
                    continue;
                };
                if frame.event == EVENT_AUTHENTICATE {
                    return frame
                        .data
                        .get("token")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                }
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

pub async fn handle_connection(socket: WebSocket, state: AppState, credential: Option<String>) {
    let limits = state.config.gateway.clone();
    let mut session = Session::new(ConnectionId::next());
    let conn = session.connection_id();
    let (mut sender, mut receiver) = socket.split();

    let token = match credential {
        Some(token) => Some(token),
        None => tokio::time::timeout(limits.auth_timeout, wait_for_authenticate(&mut receiver))
            .await
            .ok()
            .flatten(),
    };
    let identity = match token.as_deref().map(|t| state.identity.verify(t)) {
        Some(Ok(identity)) => identity,
        Some(Err(err)) => {
            tracing::info!(connection_id = %conn, error = %err, "gateway: authentication failed");
            reject(&mut sender, AUTH_ERROR_MESSAGE).await;
            return;
        }
        None => {
            tracing::info!(connection_id = %conn, "gateway: no credential presented");
            reject(&mut sender, AUTH_ERROR_MESSAGE).await;
            return;
        }
    };
    if session.authenticate(identity.clone()).is_err() {
        return;
    }

    let (mailbox, mut outbound) = mpsc::channel(limits.outbound_buffer.max(1));
    let arrival = state
        .presence
        .connect_with(&identity, conn, |outcome| {
            state.rooms.attach(conn, mailbox);
            state.rooms.join(conn, RoomId::User(identity.user_id));
            if outcome == ConnectOutcome::BecameOnline {
                let online = ServerEvent::new(EVENT_USER_ONLINE, presence_payload(&identity));
                state.rooms.broadcast(&online, Some(conn));
            }
        })
        .await;
    if arrival.outcome == ConnectOutcome::LimitReached {
        tracing::warn!(
            user_id = identity.user_id,
            connection_id = %conn,
            "gateway: too many concurrent connections"
        );
        reject(&mut sender, "Too many concurrent connections").await;
        return;
    }

    tracing::info!(
        user_id = identity.user_id,
        connection_id = %conn,
        first_connection = arrival.outcome == ConnectOutcome::BecameOnline,
        "gateway: client connected"
    );

    let greeted = greet(&mut sender, &identity, &arrival.online).await;
    let reason = if greeted.is_ok() {
        run_session(
            &mut sender,
            &mut receiver,
            &mut outbound,
            &mut session,
            &state,
            limits.heartbeat_interval,
        )
        .await
    } else {
        "websocket send error".to_string()
    };

    session.close();
    state.rooms.detach(conn);
    state
        .presence
        .disconnect_with(identity.user_id, conn, |last_seen| {
            let offline = ServerEvent::new(
                EVENT_USER_OFFLINE,
                json!({
                    "userId": identity.user_id.to_string(),
                    "username": &identity.username,
                    "lastSeen": last_seen,
                }),
            );
            state.rooms.broadcast(&offline, None);
        })
        .await;
    tracing::info!(
        user_id = identity.user_id,
        connection_id = %conn,
        reason = %reason,
        "gateway: client disconnected"
    );
}

/// `ready` followed by one `userOnline` per other user in the snapshot taken
/// when this connection joined. Later changes arrive through the mailbox.
async fn greet(
    sender: &mut (impl SinkExt<Message> + Unpin),
    identity: &Identity,
    online: &[Presence],
) -> Result<(), ()> {
    send_frame(sender, EVENT_READY, presence_payload(identity)).await?;
    for presence in online {
        if presence.user_id == identity.user_id {
            continue;
        }
        send_frame(
            sender,
            EVENT_USER_ONLINE,
            json!({
                "userId": presence.user_id.to_string(),
                "username": &presence.username,
            }),
        )
        .await?;
    }
    Ok(())
}

async fn run_session(
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    outbound: &mut mpsc::Receiver<ServerEvent>,
    session: &mut Session,
    state: &AppState,
    heartbeat_interval: Duration,
) -> String {
    let mut ping_interval = tokio::time::interval(heartbeat_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await;
    let shutdown = state.shutdown.clone();
    let shutdown_signal = shutdown.notified();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                            Ok(frame) => handle_client_event(frame, session, state).await,
                            Err(err) => {
                                tracing::debug!(
                                    connection_id = %session.connection_id(),
                                    error = %err,
                                    "gateway: dropping malformed frame"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => format!(
                                "client close frame (code={}, reason={})",
                                frame.code, frame.reason
                            ),
                            None => "client close frame (no code/reason)".to_string(),
                        };
                    }
                    Some(Err(err)) => return format!("websocket receive error: {err}"),
                    None => return "websocket stream ended".to_string(),
                    _ => {}
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    return "outbound mailbox closed".to_string();
                };
                if send_frame(sender, event.event_type, event.payload).await.is_err() {
                    return "websocket send error".to_string();
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return "websocket ping send error".to_string();
                }
            }
            () = &mut shutdown_signal => {
                let _ = send_close(sender, CLOSE_GOING_AWAY, "Server shutting down").await;
                return "server shutdown".to_string();
            }
        }
    }
}

async fn handle_client_event(frame: GatewayFrame, session: &mut Session, state: &AppState) {
    let Some(identity) = session.identity().cloned() else {
        return;
    };
    let conn = session.connection_id();
    let data = frame.data;

    match frame.event.as_str() {
        EVENT_AUTHENTICATE => {
            tracing::debug!(connection_id = %conn, "gateway: ignoring repeated authenticate");
        }
        EVENT_JOIN_CHAT => {
            let Some(thread_id) = id_field(&data, "threadId") else {
                return;
            };
            match state.threads.is_participant(thread_id, identity.user_id).await {
                Ok(true) => {
                    state.rooms.join(conn, RoomId::Thread(thread_id));
                    let _ = session.join_thread(thread_id);
                }
                Ok(false) => {
                    tracing::warn!(
                        user_id = identity.user_id,
                        thread_id,
                        "gateway: unauthorized joinChat dropped"
                    );
                }
                Err(err) => {
                    tracing::error!(thread_id, error = %err, "gateway: joinChat lookup failed");
                }
            }
        }
        EVENT_LEAVE_CHAT => {
            let Some(thread_id) = id_field(&data, "threadId") else {
                return;
            };
            state.rooms.leave(conn, RoomId::Thread(thread_id));
            let _ = session.leave_thread(thread_id);
        }
        EVENT_TYPING => {
            relay_to_thread(session, state, &identity, EVENT_USER_TYPING, data);
        }
        EVENT_MESSAGE_DELIVERED | EVENT_MESSAGE_SEEN => {
            let status = if frame.event == EVENT_MESSAGE_SEEN {
                MessageStatus::Seen
            } else {
                MessageStatus::Delivered
            };
            let (Some(thread_id), Some(message_id)) =
                (id_field(&data, "threadId"), id_field(&data, "messageId"))
            else {
                return;
            };
            if let Err(err) = state
                .router
                .update_status(thread_id, message_id, status, identity.user_id, Some(conn))
                .await
            {
                tracing::debug!(
                    user_id = identity.user_id,
                    thread_id,
                    message_id,
                    error = %err,
                    "gateway: status update rejected"
                );
            }
        }
        EVENT_SEND_MESSAGE => {
            let Some(thread_id) = id_field(&data, "threadId") else {
                return;
            };
            let content: MessageContent = match serde_json::from_value(data) {
                Ok(content) => content,
                Err(err) => {
                    reply_error(state, conn, EVENT_SEND_MESSAGE, &err.to_string());
                    return;
                }
            };
            match state.router.send_message(thread_id, &identity, &content).await {
                Ok(message) => {
                    let ack = ServerEvent::new(
                        EVENT_MESSAGE_SENT,
                        json!({ "threadId": thread_id.to_string(), "message": message }),
                    );
                    state.rooms.send_to(conn, &ack);
                }
                Err(err) => {
                    tracing::warn!(
                        user_id = identity.user_id,
                        thread_id,
                        error = %err,
                        "gateway: sendMessage failed"
                    );
                    reply_error(state, conn, EVENT_SEND_MESSAGE, &err.to_string());
                }
            }
        }
        other => {
            if let Some(relayed) = call_relay_event(other) {
                relay_to_thread(session, state, &identity, relayed, data);
            } else {
                tracing::debug!(connection_id = %conn, event = other, "gateway: unknown event");
            }
        }
    }
}

/// Forward a client payload to the rest of a joined thread room, tagged with
/// the sender.
fn relay_to_thread(
    session: &Session,
    state: &AppState,
    identity: &Identity,
    event: &'static str,
    data: Value,
) {
    let Some(thread_id) = id_field(&data, "threadId") else {
        return;
    };
    if !session.has_joined(thread_id) {
        tracing::debug!(
            user_id = identity.user_id,
            thread_id,
            event,
            "gateway: relay from a thread that was not joined"
        );
        return;
    }
    let mut payload = match data {
        Value::Object(map) => map,
        _ => return,
    };
    payload.insert("userId".into(), json!(identity.user_id.to_string()));
    payload.insert("username".into(), json!(identity.username));
    state.rooms.publish(
        RoomId::Thread(thread_id),
        &ServerEvent::new(event, Value::Object(payload)),
        Some(session.connection_id()),
    );
}

fn reply_error(state: &AppState, conn: ConnectionId, event: &str, message: &str) {
    let error = ServerEvent::new(EVENT_ERROR, json!({ "event": event, "message": message }));
    state.rooms.send_to(conn, &error);
}

fn presence_payload(identity: &Identity) -> Value {
    json!({
        "userId": identity.user_id.to_string(),
        "username": &identity.username,
    })
}

/// Ids arrive as decimal strings, but plain numbers are accepted too.
fn id_field(data: &Value, key: &str) -> Option<i64> {
    match data.get(key)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}
