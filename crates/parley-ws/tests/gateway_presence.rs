use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::{SinkExt, StreamExt};
use parley_core::auth::create_token;
use parley_core::{AppConfig, AppState, GatewayLimits};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "gateway-test-secret";

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    _media_dir: TempDir,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        Self::start_with(GatewayLimits {
            auth_timeout: Duration::from_millis(500),
            ..GatewayLimits::default()
        })
        .await
    }

    async fn start_with(gateway: GatewayLimits) -> anyhow::Result<Self> {
        let db = parley_db::create_pool("sqlite::memory:", 1).await?;
        parley_db::run_migrations(&db).await?;
        let media_dir = tempfile::tempdir()?;

        let state = AppState::new(
            db,
            AppConfig {
                jwt_secret: SECRET.to_string(),
                media_storage_path: media_dir.path().to_string_lossy().into_owned(),
                max_upload_size: 1024 * 1024,
                worker_id: 1,
                gateway,
            },
        );

        let app = parley_ws::gateway_router().with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            state,
            _media_dir: media_dir,
        })
    }

    fn token(&self, user_id: i64, username: &str) -> anyhow::Result<String> {
        Ok(create_token(user_id, username, SECRET, 3600)?)
    }

    async fn connect_raw(&self, query: &str) -> anyhow::Result<Client> {
        let url = format!("ws://{}/gateway{}", self.addr, query);
        let (client, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(client)
    }

    /// Connect with a query token and wait for `ready`.
    async fn connect(&self, user_id: i64, username: &str) -> anyhow::Result<Client> {
        let token = self.token(user_id, username)?;
        let mut client = self.connect_raw(&format!("?token={token}")).await?;
        let ready = next_event(&mut client).await?;
        if ready["event"] != "ready" {
            bail!("expected ready, got {ready}");
        }
        Ok(client)
    }
}

async fn next_event(client: &mut Client) -> anyhow::Result<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .context("timed out waiting for a frame")?
            .context("connection ended")??;
        match msg {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(0);
                return Ok(json!({ "event": "__close", "data": { "code": code } }));
            }
            _ => continue,
        }
    }
}

async fn expect_silence(client: &mut Client) {
    let next = tokio::time::timeout(Duration::from_millis(150), client.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

/// Frames received until the client has been quiet for a while.
async fn drain(client: &mut Client) -> anyhow::Result<Vec<Value>> {
    let mut events = Vec::new();
    while let Ok(next) = tokio::time::timeout(Duration::from_millis(300), client.next()).await {
        match next.context("connection ended")?? {
            Message::Text(text) => events.push(serde_json::from_str(text.as_str())?),
            Message::Close(_) => bail!("connection closed"),
            _ => {}
        }
    }
    Ok(events)
}

async fn join(client: &mut Client, thread_id: &str) -> anyhow::Result<()> {
    send(client, "joinChat", json!({ "threadId": thread_id })).await
}

async fn send(client: &mut Client, event: &str, data: Value) -> anyhow::Result<()> {
    let frame = json!({ "event": event, "data": data });
    client.send(Message::Text(frame.to_string().into())).await?;
    Ok(())
}

#[tokio::test]
async fn each_user_sees_the_other_come_online_once_and_go_offline() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut alice = server.connect(1, "alice").await?;
    let connected_at = chrono::Utc::now();
    expect_silence(&mut alice).await;

    let mut bob = server.connect(2, "bob").await?;
    let seen_by_bob = next_event(&mut bob).await?;
    assert_eq!(seen_by_bob["event"], "userOnline");
    assert_eq!(seen_by_bob["data"]["userId"], "1");
    assert_eq!(seen_by_bob["data"]["username"], "alice");

    let seen_by_alice = next_event(&mut alice).await?;
    assert_eq!(seen_by_alice["event"], "userOnline");
    assert_eq!(seen_by_alice["data"]["userId"], "2");

    expect_silence(&mut alice).await;
    expect_silence(&mut bob).await;

    alice.close(None).await?;
    let offline = next_event(&mut bob).await?;
    assert_eq!(offline["event"], "userOffline");
    assert_eq!(offline["data"]["userId"], "1");
    let last_seen: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(offline["data"]["lastSeen"].clone())?;
    assert!(last_seen >= connected_at - chrono::Duration::seconds(1));
    assert!(!server.state.presence.is_online(1).await);

    Ok(())
}

#[tokio::test]
async fn second_connection_of_same_user_does_not_rebroadcast() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut bob = server.connect(2, "bob").await?;
    let _alice_one = server.connect(1, "alice").await?;
    assert_eq!(next_event(&mut bob).await?["event"], "userOnline");

    let alice_two = server.connect(1, "alice").await?;
    expect_silence(&mut bob).await;

    drop(alice_two);
    expect_silence(&mut bob).await;
    assert!(server.state.presence.is_online(1).await);
    Ok(())
}

#[tokio::test]
async fn invalid_token_gets_error_then_policy_close() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.connect_raw("?token=not-a-jwt").await?;

    let error = next_event(&mut client).await?;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["message"], "Authentication error");

    let close = next_event(&mut client).await?;
    assert_eq!(close["event"], "__close");
    assert_eq!(close["data"]["code"], 1008);
    Ok(())
}

#[tokio::test]
async fn authenticate_frame_is_accepted_without_query_token() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.connect_raw("").await?;
    let token = server.token(3, "carol")?;
    send(&mut client, "authenticate", json!({ "token": token })).await?;

    let ready = next_event(&mut client).await?;
    assert_eq!(ready["event"], "ready");
    assert_eq!(ready["data"]["userId"], "3");
    Ok(())
}

#[tokio::test]
async fn silent_client_is_dropped_after_auth_timeout() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.connect_raw("").await?;
    let error = next_event(&mut client).await?;
    assert_eq!(error["event"], "error");
    Ok(())
}

#[tokio::test]
async fn typing_reaches_joined_peer_only() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let (thread, _) = server.state.threads.start_or_get_thread(1, 2).await?;
    let thread_id = thread.id.to_string();

    let mut alice = server.connect(1, "alice").await?;
    let mut bob = server.connect(2, "bob").await?;
    let mut eve = server.connect(9, "eve").await?;
    next_event(&mut alice).await?; // bob online
    next_event(&mut alice).await?; // eve online
    next_event(&mut bob).await?; // alice snapshot
    next_event(&mut bob).await?; // eve online

    send(&mut bob, "joinChat", json!({ "threadId": thread_id })).await?;
    send(&mut eve, "joinChat", json!({ "threadId": thread_id })).await?;
    send(&mut alice, "joinChat", json!({ "threadId": thread_id })).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send(&mut alice, "typing", json!({ "threadId": thread_id, "isTyping": true })).await?;
    let typing = next_event(&mut bob).await?;
    assert_eq!(typing["event"], "userTyping");
    assert_eq!(typing["data"]["userId"], "1");
    assert_eq!(typing["data"]["username"], "alice");
    assert_eq!(typing["data"]["isTyping"], true);

    // eve's join was refused; she only saw the online broadcasts
    next_event(&mut eve).await?;
    next_event(&mut eve).await?;
    expect_silence(&mut eve).await;
    expect_silence(&mut alice).await;
    Ok(())
}

#[tokio::test]
async fn send_message_acks_sender_and_notifies_recipient() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let (thread, _) = server.state.threads.start_or_get_thread(1, 2).await?;

    let mut bob = server.connect(2, "bob").await?;
    let mut alice = server.connect(1, "alice").await?;
    next_event(&mut bob).await?; // alice online
    next_event(&mut alice).await?; // bob snapshot

    send(
        &mut alice,
        "sendMessage",
        json!({ "threadId": thread.id.to_string(), "text": "hi bob" }),
    )
    .await?;

    let ack = next_event(&mut alice).await?;
    assert_eq!(ack["event"], "messageSent");
    assert_eq!(ack["data"]["message"]["text"], "hi bob");

    let incoming = next_event(&mut bob).await?;
    assert_eq!(incoming["event"], "newMessage");
    assert_eq!(incoming["data"]["threadId"], thread.id.to_string());
    assert_eq!(incoming["data"]["sender"]["userId"], "1");

    let message_id = incoming["data"]["message"]["id"].clone();
    send(&mut alice, "joinChat", json!({ "threadId": thread.id.to_string() })).await?;
    send(&mut bob, "joinChat", json!({ "threadId": thread.id.to_string() })).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(
        &mut bob,
        "messageSeen",
        json!({ "threadId": thread.id.to_string(), "messageId": message_id }),
    )
    .await?;

    let status = next_event(&mut alice).await?;
    assert_eq!(status["event"], "messageStatusUpdate");
    assert_eq!(status["data"]["status"], "seen");
    expect_silence(&mut bob).await;
    Ok(())
}

#[tokio::test]
async fn call_signalling_is_relayed_to_the_other_participant() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let (thread, _) = server.state.threads.start_or_get_thread(1, 2).await?;
    let thread_id = thread.id.to_string();

    let mut alice = server.connect(1, "alice").await?;
    let mut bob = server.connect(2, "bob").await?;
    next_event(&mut alice).await?; // bob online
    next_event(&mut bob).await?; // alice snapshot
    join(&mut alice, &thread_id).await?;
    join(&mut bob, &thread_id).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send(
        &mut alice,
        "callUser",
        json!({ "threadId": thread_id, "callType": "video", "offer": "sdp-offer" }),
    )
    .await?;
    let incoming = next_event(&mut bob).await?;
    assert_eq!(incoming["event"], "incomingCall");
    assert_eq!(incoming["data"]["userId"], "1");
    assert_eq!(incoming["data"]["username"], "alice");
    assert_eq!(incoming["data"]["offer"], "sdp-offer");
    assert_eq!(incoming["data"]["callType"], "video");

    send(&mut bob, "answerCall", json!({ "threadId": thread_id, "answer": "sdp-answer" })).await?;
    let accepted = next_event(&mut alice).await?;
    assert_eq!(accepted["event"], "callAccepted");
    assert_eq!(accepted["data"]["userId"], "2");
    assert_eq!(accepted["data"]["answer"], "sdp-answer");

    send(&mut bob, "rejectCall", json!({ "threadId": thread_id })).await?;
    assert_eq!(next_event(&mut alice).await?["event"], "callRejected");

    send(&mut alice, "endCall", json!({ "threadId": thread_id })).await?;
    let ended = next_event(&mut bob).await?;
    assert_eq!(ended["event"], "callEnded");
    assert_eq!(ended["data"]["userId"], "1");

    expect_silence(&mut alice).await;
    expect_silence(&mut bob).await;
    Ok(())
}

#[tokio::test]
async fn leave_chat_stops_relays_to_that_connection() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let (thread, _) = server.state.threads.start_or_get_thread(1, 2).await?;
    let thread_id = thread.id.to_string();

    let mut alice = server.connect(1, "alice").await?;
    let mut bob = server.connect(2, "bob").await?;
    next_event(&mut alice).await?;
    next_event(&mut bob).await?;
    join(&mut alice, &thread_id).await?;
    join(&mut bob, &thread_id).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send(&mut alice, "typing", json!({ "threadId": thread_id, "isTyping": true })).await?;
    assert_eq!(next_event(&mut bob).await?["event"], "userTyping");

    send(&mut bob, "leaveChat", json!({ "threadId": thread_id })).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(&mut alice, "typing", json!({ "threadId": thread_id, "isTyping": false })).await?;
    send(&mut alice, "endCall", json!({ "threadId": thread_id })).await?;
    expect_silence(&mut bob).await;

    // relays from a room bob left are dropped as well
    send(&mut bob, "typing", json!({ "threadId": thread_id, "isTyping": true })).await?;
    expect_silence(&mut alice).await;
    Ok(())
}

#[tokio::test]
async fn malformed_frame_is_dropped_without_closing() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let (thread, _) = server.state.threads.start_or_get_thread(1, 2).await?;
    let thread_id = thread.id.to_string();

    let mut alice = server.connect(1, "alice").await?;
    let mut bob = server.connect(2, "bob").await?;
    next_event(&mut alice).await?;
    next_event(&mut bob).await?;
    join(&mut bob, &thread_id).await?;

    alice.send(Message::Text("{not json".into())).await?;
    alice
        .send(Message::Text(json!({ "data": { "threadId": thread_id } }).to_string().into()))
        .await?;
    send(&mut alice, "joinChat", json!({ "threadId": [] })).await?;
    expect_silence(&mut alice).await;

    join(&mut alice, &thread_id).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(&mut alice, "typing", json!({ "threadId": thread_id, "isTyping": true })).await?;
    let typing = next_event(&mut bob).await?;
    assert_eq!(typing["event"], "userTyping");
    assert_eq!(typing["data"]["userId"], "1");
    assert!(server.state.presence.is_online(1).await);
    Ok(())
}

#[tokio::test]
async fn connection_over_the_cap_gets_error_and_policy_close() -> anyhow::Result<()> {
    let server = TestServer::start_with(GatewayLimits {
        max_connections_per_user: 2,
        auth_timeout: Duration::from_millis(500),
        ..GatewayLimits::default()
    })
    .await?;
    let mut bob = server.connect(2, "bob").await?;
    let _first = server.connect(1, "alice").await?;
    let _second = server.connect(1, "alice").await?;
    assert_eq!(next_event(&mut bob).await?["event"], "userOnline");

    let token = server.token(1, "alice")?;
    let mut third = server.connect_raw(&format!("?token={token}")).await?;
    let error = next_event(&mut third).await?;
    assert_eq!(error["event"], "error");
    assert_eq!(error["data"]["message"], "Too many concurrent connections");
    let close = next_event(&mut third).await?;
    assert_eq!(close["event"], "__close");
    assert_eq!(close["data"]["code"], 1008);

    expect_silence(&mut bob).await;
    assert!(server.state.presence.is_online(1).await);
    Ok(())
}

#[tokio::test]
async fn quick_reconnects_leave_peers_seeing_the_user_online() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut bob = server.connect(2, "bob").await?;
    let mut alice = server.connect(1, "alice").await?;
    assert_eq!(next_event(&mut bob).await?["event"], "userOnline");

    for _ in 0..5 {
        alice.close(None).await?;
        alice = server.connect(1, "alice").await?;
    }

    let events = drain(&mut bob).await?;
    let mut online = true;
    for event in &events {
        assert_eq!(event["data"]["userId"], "1", "{event}");
        match event["event"].as_str() {
            Some("userOffline") => {
                assert!(online, "userOffline twice in a row: {events:?}");
                online = false;
            }
            Some("userOnline") => {
                assert!(!online, "userOnline twice in a row: {events:?}");
                online = true;
            }
            _ => panic!("unexpected event {event}"),
        }
    }
    assert!(online, "peer last saw alice offline: {events:?}");
    assert!(server.state.presence.is_online(1).await);
    Ok(())
}
