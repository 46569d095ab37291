use std::sync::Mutex;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};

use crate::config::RoomConfig;
use crate::error::RoomError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
}

/// Messages sent from client to signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        room: String,
        name: String,
    },
    Offer {
        to: String,
        sdp: String,
    },
    Answer {
        to: String,
        sdp: String,
    },
    IceCandidate {
        to: String,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    },
    Chat {
        room: String,
        text: String,
    },
}

/// Messages sent from signaling server to client.
///
/// `NeedOffer` is delivered to the participants already in the room when a
/// newcomer joins; the existing side initiates the offer. That fixed
/// direction is the only glare-avoidance mechanism in this protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Roster {
        you: String,
        participants: Vec<ParticipantInfo>,
    },
    NeedOffer {
        target_id: String,
        name: String,
    },
    Offer {
        from: String,
        sdp: String,
    },
    Answer {
        from: String,
        sdp: String,
    },
    IceCandidate {
        from: String,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    },
    Chat {
        name: String,
        text: String,
    },
    UserLeft {
        id: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug)]
pub enum SignalingEvent {
    Message(ServerMessage),
    Closed,
}

/// Cheap clonable handle for outbound signaling traffic. Held by the peer
/// registry so ICE callbacks can relay candidates without touching the
/// channel itself.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingSender {
    pub fn send(&self, message: ClientMessage) -> Result<(), RoomError> {
        self.tx.send(message).map_err(|_| RoomError::ChannelClosed)
    }
}

/// Websocket connection to the signaling server, scoped to one room code.
///
/// A writer task drains an unbounded queue into the socket and a reader task
/// parses inbound frames into [`SignalingEvent`]s. Both are aborted on
/// `close` (and in `Drop`), so no event is delivered after teardown begins.
/// A dropped connection surfaces as a terminal `Closed` event; there is no
/// mid-call reconnect.
pub struct SignalingChannel {
    room: String,
    sender: SignalingSender,
    events_rx: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Connect to the signaling server and announce presence in `room_code`.
    /// The roster reply arrives later as an event; the caller owns that wait.
    pub async fn connect(
        config: &RoomConfig,
        room_code: &str,
        display_name: &str,
    ) -> Result<Self, RoomError> {
        let url = config.websocket_url(room_code)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RoomError::Signaling(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalingEvent>();

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        forward_server_message(&events_tx, text.as_bytes());
                    }
                    Ok(Message::Binary(data)) => {
                        forward_server_message(&events_tx, &data);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
            let _ = events_tx.send(SignalingEvent::Closed);
        });

        let channel = Self {
            room: room_code.to_string(),
            sender: SignalingSender { tx: send_tx },
            events_rx: Some(events_rx),
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        };

        channel.sender.send(ClientMessage::Join {
            room: room_code.to_string(),
            name: display_name.to_string(),
        })?;
        tracing::debug!(target = "signaling", room = room_code, "sent join message");
        Ok(channel)
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// Take the inbound event stream. Can only be taken once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.take()
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), RoomError> {
        self.sender.send(ClientMessage::Chat {
            room: self.room.clone(),
            text: text.into(),
        })
    }

    /// Stop both socket tasks. Nothing is delivered or sent afterwards.
    pub fn close(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward_server_message(events_tx: &mpsc::UnboundedSender<SignalingEvent>, raw: &[u8]) {
    match serde_json::from_slice::<ServerMessage>(raw) {
        Ok(message) => {
            let _ = events_tx.send(SignalingEvent::Message(message));
        }
        Err(err) => {
            tracing::warn!(target = "signaling", error = %err, "unrecognized signaling frame");
        }
    }
}

#[cfg(test)]
pub(crate) struct TestRemote {
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub events: mpsc::UnboundedSender<SignalingEvent>,
}

#[cfg(test)]
impl SignalingChannel {
    /// Build a channel wired to in-memory endpoints instead of a socket.
    pub(crate) fn test_pair(room: &str) -> (Self, TestRemote) {
        let (send_tx, outbound) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            room: room.to_string(),
            sender: SignalingSender { tx: send_tx },
            events_rx: Some(events_rx),
            tasks: Mutex::new(Vec::new()),
        };
        (channel, TestRemote { outbound, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_join_wire_shape() {
        let message = ClientMessage::Join {
            room: "ABC123".into(),
            name: "Alice".into(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "join", "room": "ABC123", "name": "Alice"})
        );
    }

    #[test]
    fn server_need_offer_parses() {
        let raw = r#"{"type":"need_offer","target_id":"bob-1","name":"Bob"}"#;
        let message: ServerMessage = serde_json::from_str(raw).unwrap();
        match message {
            ServerMessage::NeedOffer { target_id, name } => {
                assert_eq!(target_id, "bob-1");
                assert_eq!(name, "Bob");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ice_candidate_omits_nothing() {
        let message = ClientMessage::IceCandidate {
            to: "p1".into(),
            candidate: "candidate:0 1 UDP 1 127.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::IceCandidate { to, sdp_mline_index, .. } => {
                assert_eq!(to, "p1");
                assert_eq!(sdp_mline_index, Some(0));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_chat_is_room_scoped() {
        let (channel, mut remote) = SignalingChannel::test_pair("ROOM9");
        channel.send_chat("hello").unwrap();
        match remote.outbound.recv().await.unwrap() {
            ClientMessage::Chat { room, text } => {
                assert_eq!(room, "ROOM9");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
