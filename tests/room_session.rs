//! End-to-end room tests against an in-process signaling server speaking the
//! real JSON websocket protocol. Peer links negotiate over loopback with host
//! candidates only, so media actually flows between the two sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;
use uuid::Uuid;

use meshcall::{
    ClientMessage, ParticipantInfo, RoomCommand, RoomConfig, RoomHandle, RoomSession, RoomView,
    ServerMessage, SessionState, SyntheticSource,
};

const SETUP: Duration = Duration::from_secs(10);
const MEDIA: Duration = Duration::from_secs(30);

struct Member {
    name: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

type Rooms = Arc<Mutex<HashMap<String, HashMap<String, Member>>>>;

async fn spawn_signaling_server() -> SocketAddr {
    let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
    let app = Router::new()
        .route("/rooms/:code", get(ws_handler))
        .with_state(rooms);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn ws_handler(
    Path(code): Path<String>,
    State(rooms): State<Rooms>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_member(socket, code, rooms))
}

async fn serve_member(socket: WebSocket, code: String, rooms: Rooms) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = serde_json::to_string(&message).unwrap();
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut my_id: Option<String> = None;
    while let Some(Ok(frame)) = ws_rx.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };
        match message {
            ClientMessage::Join { room: _, name } => {
                let id = Uuid::new_v4().to_string();
                let mut rooms = rooms.lock().await;
                let members = rooms.entry(code.clone()).or_default();
                let roster: Vec<ParticipantInfo> = members
                    .iter()
                    .map(|(id, member)| ParticipantInfo {
                        id: id.clone(),
                        name: member.name.clone(),
                    })
                    .collect();
                let _ = tx.send(ServerMessage::Roster {
                    you: id.clone(),
                    participants: roster,
                });
                // Existing members initiate offers toward the newcomer.
                for member in members.values() {
                    let _ = member.tx.send(ServerMessage::NeedOffer {
                        target_id: id.clone(),
                        name: name.clone(),
                    });
                }
                members.insert(id.clone(), Member { name, tx: tx.clone() });
                my_id = Some(id);
            }
            ClientMessage::Offer { to, sdp } => {
                let from = my_id.clone().unwrap_or_default();
                relay(&rooms, &code, &to, ServerMessage::Offer { from, sdp }).await;
            }
            ClientMessage::Answer { to, sdp } => {
                let from = my_id.clone().unwrap_or_default();
                relay(&rooms, &code, &to, ServerMessage::Answer { from, sdp }).await;
            }
            ClientMessage::IceCandidate {
                to,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let from = my_id.clone().unwrap_or_default();
                relay(
                    &rooms,
                    &code,
                    &to,
                    ServerMessage::IceCandidate {
                        from,
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                    },
                )
                .await;
            }
            ClientMessage::Chat { room: _, text } => {
                let Some(id) = my_id.as_deref() else {
                    continue;
                };
                let rooms = rooms.lock().await;
                let Some(members) = rooms.get(&code) else {
                    continue;
                };
                let Some(name) = members.get(id).map(|m| m.name.clone()) else {
                    continue;
                };
                // Broadcast to everyone else; the sender echoes locally.
                for (other_id, member) in members.iter() {
                    if other_id != id {
                        let _ = member.tx.send(ServerMessage::Chat {
                            name: name.clone(),
                            text: text.clone(),
                        });
                    }
                }
            }
        }
    }

    if let Some(id) = my_id {
        let mut rooms = rooms.lock().await;
        if let Some(members) = rooms.get_mut(&code) {
            members.remove(&id);
            for member in members.values() {
                let _ = member.tx.send(ServerMessage::UserLeft { id: id.clone() });
            }
        }
    }
    writer.abort();
}

async fn relay(rooms: &Rooms, code: &str, to: &str, message: ServerMessage) {
    let rooms = rooms.lock().await;
    if let Some(member) = rooms.get(code).and_then(|members| members.get(to)) {
        let _ = member.tx.send(message);
    }
}

async fn join(addr: SocketAddr, room: &str, name: &str) -> RoomHandle {
    let config = RoomConfig::default()
        .with_signaling_url(format!("ws://{addr}"))
        .without_ice_servers();
    RoomSession::join(config, room, name, Arc::new(SyntheticSource))
        .await
        .unwrap()
}

async fn wait_for(
    rx: &mut watch::Receiver<RoomView>,
    wait: Duration,
    predicate: impl Fn(&RoomView) -> bool,
) -> RoomView {
    timeout(wait, async {
        loop {
            {
                let view = rx.borrow();
                if predicate(&view) {
                    return view.clone();
                }
            }
            rx.changed().await.expect("view channel open");
        }
    })
    .await
    .expect("condition within deadline")
}

#[tokio::test]
async fn lone_participant_waits_on_placeholder() {
    let addr = spawn_signaling_server().await;
    let handle = join(addr, "SOLO", "Alice").await;
    let mut view_rx = handle.view();

    let view = wait_for(&mut view_rx, SETUP, |v| v.state == SessionState::Active).await;
    assert!(view.local_id.is_some());
    assert!(view.participants.is_empty());
    assert_eq!(view.stage, None);

    handle.leave().unwrap();
    wait_for(&mut view_rx, SETUP, |v| v.state == SessionState::Terminated).await;
    handle.wait().await;
}

#[tokio::test]
async fn unreachable_signaling_server_fails_join() {
    let config = RoomConfig::default()
        .with_signaling_url("ws://127.0.0.1:1")
        .without_ice_servers();
    let result = RoomSession::join(config, "ROOM", "Alice", Arc::new(SyntheticSource)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn two_participants_full_call() {
    let addr = spawn_signaling_server().await;

    let alice = join(addr, "PAIR", "Alice").await;
    let mut alice_view = alice.view();
    wait_for(&mut alice_view, SETUP, |v| v.state == SessionState::Active).await;

    let bob = join(addr, "PAIR", "Bob").await;
    let mut bob_view = bob.view();
    let view = wait_for(&mut bob_view, SETUP, |v| v.state == SessionState::Active).await;
    assert_eq!(view.participants.len(), 1);
    assert_eq!(view.participants[0].name, "Alice");

    // Alice is told to offer toward the newcomer; the link negotiates over
    // loopback and synthetic media starts flowing both ways.
    let view = wait_for(&mut alice_view, MEDIA, |v| {
        v.participants.iter().any(|p| p.has_media)
    })
    .await;
    assert_eq!(view.participants[0].name, "Bob");
    wait_for(&mut bob_view, MEDIA, |v| {
        v.participants.iter().any(|p| p.has_media)
    })
    .await;

    // The first remote stream takes the stage on both sides.
    let view = wait_for(&mut alice_view, MEDIA, |v| v.stage.is_some()).await;
    assert_eq!(view.stage.as_deref(), Some(view.participants[0].id.as_str()));
    wait_for(&mut bob_view, MEDIA, |v| v.stage.is_some()).await;

    // Mute only flips the local flag.
    alice.send(RoomCommand::ToggleMute).unwrap();
    let view = wait_for(&mut alice_view, SETUP, |v| !v.media.audio_enabled).await;
    assert!(view.media.video_enabled);

    // Chat relays through the server and echoes locally for the sender.
    alice.send(RoomCommand::SendChat("hi bob".into())).unwrap();
    let view = wait_for(&mut bob_view, SETUP, |v| !v.chat.is_empty()).await;
    assert_eq!(view.chat[0].sender_name, "Alice");
    assert_eq!(view.chat[0].text, "hi bob");
    let view = wait_for(&mut alice_view, SETUP, |v| !v.chat.is_empty()).await;
    assert_eq!(view.chat[0].sender_name, "Alice");

    // Bob leaves; Alice's roster and stage clear back to the placeholder.
    bob.leave().unwrap();
    bob.wait().await;
    let view = wait_for(&mut alice_view, SETUP, |v| v.participants.is_empty()).await;
    assert_eq!(view.stage, None);

    alice.leave().unwrap();
    alice.wait().await;
}
