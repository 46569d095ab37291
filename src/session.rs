use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::config::RoomConfig;
use crate::error::RoomError;
use crate::media::{LocalMediaState, MediaEvent, MediaSource, TrackManager};
use crate::peer::{PeerEvent, PeerRegistry};
use crate::signaling::{ServerMessage, SignalingChannel, SignalingEvent};
use crate::speaker::{ActiveSpeakerDetector, FocusRequest};

/// Room session lifecycle. Signaling messages that do not fit the current
/// state are dropped, not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    Terminated,
}

/// User-initiated actions, delivered through the [`RoomHandle`].
#[derive(Debug, Clone)]
pub enum RoomCommand {
    ToggleMute,
    ToggleCamera,
    StartScreenShare,
    StopScreenShare,
    Pin(Option<String>),
    SendChat(String),
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    /// Set once any remote track has arrived from this participant.
    pub has_media: bool,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender_name: String,
    pub text: String,
    pub received_at: SystemTime,
}

/// Stage focus resolution: an explicit pin always beats auto-focus, which is
/// fed by the active-speaker detector and the first-peer fallback.
#[derive(Debug, Clone, Default)]
pub struct StageSelection {
    pinned: Option<String>,
    auto_focus: Option<String>,
}

impl StageSelection {
    pub fn effective(&self) -> Option<&str> {
        self.pinned.as_deref().or(self.auto_focus.as_deref())
    }

    pub fn pinned(&self) -> Option<&str> {
        self.pinned.as_deref()
    }

    pub fn pin(&mut self, id: Option<String>) {
        self.pinned = id;
    }

    /// Apply a focus request; ignored while a participant is pinned.
    pub fn request_focus(&mut self, id: String) {
        if self.pinned.is_none() {
            self.auto_focus = Some(id);
        }
    }

    /// Drop every reference to a departed participant.
    pub fn forget(&mut self, id: &str) {
        if self.pinned.as_deref() == Some(id) {
            self.pinned = None;
        }
        if self.auto_focus.as_deref() == Some(id) {
            self.auto_focus = None;
        }
    }
}

/// Derived model consumed by the UI layer. Published on a watch channel;
/// observers never mutate session state.
#[derive(Debug, Clone)]
pub struct RoomView {
    pub state: SessionState,
    pub local_id: Option<String>,
    /// Remote participants in join order; these are the filmstrip tiles.
    pub participants: Vec<Participant>,
    /// Participant shown large. `None` renders the waiting placeholder.
    pub stage: Option<String>,
    pub pinned: Option<String>,
    pub chat: Vec<ChatMessage>,
    pub media: LocalMediaState,
}

impl RoomView {
    fn joining() -> Self {
        Self {
            state: SessionState::Joining,
            local_id: None,
            participants: Vec::new(),
            stage: None,
            pinned: None,
            chat: Vec::new(),
            media: LocalMediaState {
                audio_enabled: true,
                video_enabled: true,
                screen_sharing: false,
            },
        }
    }
}

/// Caller-facing handle for a running session.
pub struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
    view: watch::Receiver<RoomView>,
    task: JoinHandle<()>,
    #[cfg(test)]
    focus_tx: mpsc::UnboundedSender<FocusRequest>,
}

impl RoomHandle {
    pub fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.commands
            .send(command)
            .map_err(|_| RoomError::ChannelClosed)
    }

    pub fn leave(&self) -> Result<(), RoomError> {
        self.send(RoomCommand::Leave)
    }

    pub fn view(&self) -> watch::Receiver<RoomView> {
        self.view.clone()
    }

    /// Wait for the session task to finish (after leave or disconnect).
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

/// The orchestrating state machine binding signaling, peer registry, track
/// manager and speaker detector. All mutation happens on the single run-loop
/// task; every collaborator reports in via channels.
pub struct RoomSession {
    state: SessionState,
    room_code: String,
    display_name: String,
    local_id: Option<String>,
    signaling: SignalingChannel,
    registry: PeerRegistry,
    media: TrackManager,
    detector: ActiveSpeakerDetector,
    roster: Vec<Participant>,
    stage: StageSelection,
    chat: Vec<ChatMessage>,
    view_tx: watch::Sender<RoomView>,
}

impl RoomSession {
    /// Join a room: acquire local media, then connect signaling, then spawn
    /// the run loop. Media comes first so a capture failure aborts before
    /// any network activity.
    pub async fn join(
        config: RoomConfig,
        room_code: &str,
        display_name: &str,
        source: Arc<dyn MediaSource>,
    ) -> Result<RoomHandle, RoomError> {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let media = TrackManager::initialize(source, media_tx).await?;
        let signaling = SignalingChannel::connect(&config, room_code, display_name).await?;
        Self::start(&config, room_code, display_name, media, media_rx, signaling)
    }

    pub(crate) fn start(
        config: &RoomConfig,
        room_code: &str,
        display_name: &str,
        media: TrackManager,
        media_rx: mpsc::UnboundedReceiver<MediaEvent>,
        mut signaling: SignalingChannel,
    ) -> Result<RoomHandle, RoomError> {
        let signaling_rx = signaling
            .events()
            .ok_or_else(|| RoomError::Signaling("signaling event stream already taken".into()))?;
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (focus_tx, focus_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(config.ice_servers.clone(), signaling.sender(), peer_tx)?;
        #[cfg(test)]
        let focus_feed = focus_tx.clone();
        let detector = ActiveSpeakerDetector::new(config.speaker, focus_tx);
        let (view_tx, view_rx) = watch::channel(RoomView::joining());

        let session = RoomSession {
            state: SessionState::Joining,
            room_code: room_code.to_string(),
            display_name: display_name.to_string(),
            local_id: None,
            signaling,
            registry,
            media,
            detector,
            roster: Vec::new(),
            stage: StageSelection::default(),
            chat: Vec::new(),
            view_tx,
        };
        let task = tokio::spawn(session.run(
            signaling_rx,
            peer_rx,
            media_rx,
            focus_rx,
            command_rx,
            config.join_timeout,
        ));
        Ok(RoomHandle {
            commands: command_tx,
            view: view_rx,
            task,
            #[cfg(test)]
            focus_tx: focus_feed,
        })
    }

    async fn run(
        mut self,
        mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut media_rx: mpsc::UnboundedReceiver<MediaEvent>,
        mut focus_rx: mpsc::UnboundedReceiver<FocusRequest>,
        mut command_rx: mpsc::UnboundedReceiver<RoomCommand>,
        join_timeout: Duration,
    ) {
        self.publish();
        let join_deadline = tokio::time::sleep(join_timeout);
        tokio::pin!(join_deadline);
        loop {
            tokio::select! {
                event = signaling_rx.recv() => match event {
                    Some(SignalingEvent::Message(message)) => self.on_server_message(message).await,
                    Some(SignalingEvent::Closed) | None => {
                        warn!(target = "session", room = %self.room_code, "signaling disconnected");
                        self.terminate().await;
                    }
                },
                Some(event) = peer_rx.recv() => self.on_peer_event(event),
                Some(event) = media_rx.recv() => self.on_media_event(event).await,
                Some(request) = focus_rx.recv() => self.on_focus_request(request),
                command = command_rx.recv() => match command {
                    Some(RoomCommand::Leave) | None => self.terminate().await,
                    Some(command) => self.on_command(command).await,
                },
                _ = &mut join_deadline, if self.state == SessionState::Joining => {
                    warn!(target = "session", room = %self.room_code, "roster never arrived");
                    self.terminate().await;
                }
            }
            self.publish();
            if self.state == SessionState::Terminated {
                break;
            }
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match (self.state, message) {
            (SessionState::Joining, ServerMessage::Roster { you, participants }) => {
                info!(
                    target = "session",
                    room = %self.room_code,
                    local_id = %you,
                    peers = participants.len(),
                    "joined room"
                );
                self.local_id = Some(you);
                for info in participants {
                    self.upsert_participant(&info.id, Some(&info.name));
                }
                self.state = SessionState::Active;
            }
            (SessionState::Joining, ServerMessage::Error { message }) => {
                warn!(target = "session", room = %self.room_code, "join rejected: {message}");
                self.terminate().await;
            }
            (SessionState::Active, ServerMessage::NeedOffer { target_id, name }) => {
                self.upsert_participant(&target_id, Some(&name));
                let audio = self.media.audio_track();
                let video = self.media.video_track();
                if let Err(err) = self
                    .registry
                    .handle_need_offer(&target_id, audio, video)
                    .await
                {
                    warn!(target = "session", peer_id = %target_id, error = %err, "offer failed");
                }
            }
            (SessionState::Active, ServerMessage::Offer { from, sdp }) => {
                self.upsert_participant(&from, None);
                let audio = self.media.audio_track();
                let video = self.media.video_track();
                if let Err(err) = self.registry.handle_offer(&from, sdp, audio, video).await {
                    warn!(target = "session", peer_id = %from, error = %err, "answer failed");
                }
            }
            (SessionState::Active, ServerMessage::Answer { from, sdp }) => {
                if let Err(err) = self.registry.handle_answer(&from, sdp).await {
                    warn!(target = "session", peer_id = %from, error = %err, "answer rejected");
                }
            }
            (
                SessionState::Active,
                ServerMessage::IceCandidate {
                    from,
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
            ) => {
                if let Err(err) = self
                    .registry
                    .handle_ice_candidate(&from, candidate, sdp_mid, sdp_mline_index)
                    .await
                {
                    debug!(target = "session", peer_id = %from, error = %err, "candidate rejected");
                }
            }
            (SessionState::Active, ServerMessage::Chat { name, text }) => {
                self.chat.push(ChatMessage {
                    sender_name: name,
                    text,
                    received_at: SystemTime::now(),
                });
            }
            (SessionState::Active, ServerMessage::UserLeft { id }) => {
                info!(target = "session", peer_id = %id, "participant left");
                self.registry.remove(&id).await;
                self.detector.release(&id);
                self.roster.retain(|p| p.id != id);
                self.stage.forget(&id);
                if self.stage.effective().is_none() {
                    // First-peer fallback keeps the stage occupied when
                    // another participant already has media flowing.
                    if let Some(next) = self.roster.iter().find(|p| p.has_media) {
                        self.stage.request_focus(next.id.clone());
                    }
                }
            }
            (state, message) => {
                debug!(
                    target = "session",
                    state = ?state,
                    message = ?message,
                    "signaling message dropped in current state"
                );
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::RemoteTrack { peer_id, track } => {
                self.upsert_participant(&peer_id, None);
                if let Some(participant) = self.roster.iter_mut().find(|p| p.id == peer_id) {
                    participant.has_media = true;
                }
                if track.kind() == RTPCodecType::Audio {
                    self.detector.watch(&peer_id, track);
                }
                // The first remote stream to arrive takes the stage.
                if self.stage.effective().is_none() {
                    self.stage.request_focus(peer_id);
                }
            }
            PeerEvent::ConnectionState { peer_id, state } => {
                // A failed link stays silent on the UI; that tile simply
                // never receives video. No automatic renegotiation.
                debug!(target = "session", peer_id = %peer_id, state = ?state, "peer connection state");
            }
        }
    }

    async fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::ScreenShareEnded => {
                info!(target = "session", "display capture ended; restoring camera");
                let senders = self.registry.video_senders();
                self.media.stop_screen_share(&senders).await;
            }
        }
    }

    fn on_focus_request(&mut self, request: FocusRequest) {
        if self
            .roster
            .iter()
            .any(|p| p.id == request.participant_id)
        {
            self.stage.request_focus(request.participant_id);
        }
    }

    async fn on_command(&mut self, command: RoomCommand) {
        if self.state != SessionState::Active {
            debug!(target = "session", state = ?self.state, command = ?command, "command ignored");
            return;
        }
        match command {
            RoomCommand::ToggleMute => {
                self.media.toggle_mute();
            }
            RoomCommand::ToggleCamera => {
                self.media.toggle_camera();
            }
            RoomCommand::StartScreenShare => {
                let senders = self.registry.video_senders();
                if let Err(err) = self.media.start_screen_share(&senders).await {
                    // A rejected display-capture prompt cancels the action.
                    warn!(target = "session", error = %err, "screen share not started");
                }
            }
            RoomCommand::StopScreenShare => {
                let senders = self.registry.video_senders();
                self.media.stop_screen_share(&senders).await;
            }
            RoomCommand::Pin(Some(id)) => {
                if self.roster.iter().any(|p| p.id == id) {
                    self.stage.pin(Some(id));
                } else {
                    warn!(target = "session", peer_id = %id, "cannot pin unknown participant");
                }
            }
            RoomCommand::Pin(None) => {
                self.stage.pin(None);
            }
            RoomCommand::SendChat(text) => {
                if let Err(err) = self.signaling.send_chat(text.clone()) {
                    warn!(target = "session", error = %err, "chat send failed");
                } else {
                    self.chat.push(ChatMessage {
                        sender_name: self.display_name.clone(),
                        text,
                        received_at: SystemTime::now(),
                    });
                }
            }
            // Intercepted by the run loop.
            RoomCommand::Leave => {}
        }
    }

    /// Tear the session down in the mandatory order: stop inbound signaling
    /// first, then close every peer link, then release local media, then the
    /// audio monitors. Every step is best-effort so device release always
    /// runs even if an earlier step failed.
    async fn terminate(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        info!(
            target = "session",
            room = %self.room_code,
            peers = self.registry.len(),
            "leaving room"
        );
        self.signaling.close();
        self.registry.remove_all().await;
        self.media.shutdown();
        self.detector.release_all();
        self.state = SessionState::Terminated;
    }

    fn upsert_participant(&mut self, id: &str, name: Option<&str>) {
        if self.local_id.as_deref() == Some(id) {
            return;
        }
        if let Some(existing) = self.roster.iter_mut().find(|p| p.id == id) {
            if let Some(name) = name {
                existing.name = name.to_string();
            }
            return;
        }
        self.roster.push(Participant {
            id: id.to_string(),
            name: name.unwrap_or(id).to_string(),
            has_media: false,
        });
    }

    fn publish(&self) {
        self.view_tx.send_replace(RoomView {
            state: self.state,
            local_id: self.local_id.clone(),
            participants: self.roster.clone(),
            stage: self.stage.effective().map(str::to_string),
            pinned: self.stage.pinned().map(str::to_string),
            chat: self.chat.clone(),
            media: self.media.state(),
        });
    }
}
