use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::RoomError;
use crate::signaling::{ClientMessage, SignalingSender};

/// Callback-side notifications, bridged onto the session loop.
#[derive(Debug)]
pub enum PeerEvent {
    RemoteTrack {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
    ConnectionState {
        peer_id: String,
        state: RTCPeerConnectionState,
    },
}

/// One negotiated connection to a remote participant.
pub struct PeerLink {
    pub connection: Arc<RTCPeerConnection>,
    pub audio_sender: Arc<RTCRtpSender>,
    pub video_sender: Arc<RTCRtpSender>,
}

/// Owns exactly one [`PeerLink`] per remote participant and translates
/// signaling events into negotiation steps.
///
/// Only the side already in the room creates offers (the server delivers
/// `need_offer` to existing members when a newcomer arrives). That fixed
/// direction is the sole glare-avoidance mechanism: there is no perfect
/// negotiation, and an out-of-order offer/answer pair stalls that one link
/// until the user rejoins the room.
pub struct PeerRegistry {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    links: HashMap<String, PeerLink>,
    signaling: SignalingSender,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new(
        ice_servers: Vec<RTCIceServer>,
        signaling: SignalingSender,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, RoomError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = Registry::new();
        let registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            links: HashMap::new(),
            signaling,
            events_tx,
        })
    }

    /// Return the link for `peer_id`, creating and wiring it on first use:
    /// current local tracks attached, gathered ICE candidates forwarded over
    /// signaling, remote tracks surfaced as [`PeerEvent`]s.
    pub async fn ensure(
        &mut self,
        peer_id: &str,
        audio: Arc<TrackLocalStaticSample>,
        video: Arc<TrackLocalStaticSample>,
    ) -> Result<&mut PeerLink, RoomError> {
        match self.links.entry(peer_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let link = create_link(
                    &self.api,
                    &self.ice_servers,
                    &self.signaling,
                    &self.events_tx,
                    peer_id,
                    audio,
                    video,
                )
                .await?;
                debug!(target = "peer", peer_id, "peer link created");
                Ok(entry.insert(link))
            }
        }
    }

    /// A newcomer arrived; we are the existing side and initiate the offer.
    pub async fn handle_need_offer(
        &mut self,
        target_id: &str,
        audio: Arc<TrackLocalStaticSample>,
        video: Arc<TrackLocalStaticSample>,
    ) -> Result<(), RoomError> {
        let link = self.ensure(target_id, audio, video).await?;
        let offer = link.connection.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        link.connection.set_local_description(offer).await?;
        self.signaling.send(ClientMessage::Offer {
            to: target_id.to_string(),
            sdp,
        })?;
        debug!(target = "peer", peer_id = target_id, "offer sent");
        Ok(())
    }

    pub async fn handle_offer(
        &mut self,
        from: &str,
        sdp: String,
        audio: Arc<TrackLocalStaticSample>,
        video: Arc<TrackLocalStaticSample>,
    ) -> Result<(), RoomError> {
        let link = self.ensure(from, audio, video).await?;
        let offer = RTCSessionDescription::offer(sdp)?;
        link.connection.set_remote_description(offer).await?;
        let answer = link.connection.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        link.connection.set_local_description(answer).await?;
        self.signaling.send(ClientMessage::Answer {
            to: from.to_string(),
            sdp,
        })?;
        debug!(target = "peer", peer_id = from, "answer sent");
        Ok(())
    }

    /// Stale answers (link already gone) are logged and dropped.
    pub async fn handle_answer(&mut self, from: &str, sdp: String) -> Result<(), RoomError> {
        let Some(link) = self.links.get(from) else {
            debug!(target = "peer", peer_id = from, "answer for unknown link ignored");
            return Ok(());
        };
        let answer = RTCSessionDescription::answer(sdp)?;
        link.connection.set_remote_description(answer).await?;
        Ok(())
    }

    /// Candidates for unknown links are ignored (late/stale messages).
    pub async fn handle_ice_candidate(
        &mut self,
        from: &str,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    ) -> Result<(), RoomError> {
        let Some(link) = self.links.get(from) else {
            debug!(target = "peer", peer_id = from, "candidate for unknown link ignored");
            return Ok(());
        };
        link.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index: sdp_mline_index.map(|idx| idx as u16),
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    /// Close and discard the link for a departed participant. Idempotent.
    pub async fn remove(&mut self, peer_id: &str) {
        let Some(link) = self.links.remove(peer_id) else {
            return;
        };
        close_link(peer_id, link).await;
        debug!(target = "peer", peer_id, links = self.links.len(), "peer link removed");
    }

    pub async fn remove_all(&mut self) {
        for (peer_id, link) in self.links.drain() {
            close_link(&peer_id, link).await;
        }
    }

    pub fn video_senders(&self) -> Vec<Arc<RTCRtpSender>> {
        self.links
            .values()
            .map(|link| Arc::clone(&link.video_sender))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }
}

async fn create_link(
    api: &API,
    ice_servers: &[RTCIceServer],
    signaling: &SignalingSender,
    events_tx: &mpsc::UnboundedSender<PeerEvent>,
    peer_id: &str,
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
) -> Result<PeerLink, RoomError> {
    let connection = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: ice_servers.to_vec(),
            ..Default::default()
        })
        .await?,
    );
    let audio_sender = connection
        .add_track(audio as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    let video_sender = connection
        .add_track(video as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    let signaling = signaling.clone();
    let target = peer_id.to_string();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let signaling = signaling.clone();
        let target = target.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(json) => {
                    let _ = signaling.send(ClientMessage::IceCandidate {
                        to: target,
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index.map(|idx| idx as u32),
                    });
                }
                Err(err) => {
                    warn!(target = "peer", error = %err, "ice candidate serialization failed");
                }
            }
        })
    }));

    let track_events = events_tx.clone();
    let id = peer_id.to_string();
    connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events_tx = track_events.clone();
        let id = id.clone();
        Box::pin(async move {
            debug!(
                target = "peer",
                peer_id = %id,
                kind = ?track.kind(),
                ssrc = track.ssrc(),
                "remote track received"
            );
            let _ = events_tx.send(PeerEvent::RemoteTrack { peer_id: id, track });
        })
    }));

    let state_events = events_tx.clone();
    let id = peer_id.to_string();
    connection.on_peer_connection_state_change(Box::new(move |state| {
        let events_tx = state_events.clone();
        let id = id.clone();
        Box::pin(async move {
            let _ = events_tx.send(PeerEvent::ConnectionState { peer_id: id, state });
        })
    }));

    Ok(PeerLink {
        connection,
        audio_sender,
        video_sender,
    })
}

async fn close_link(peer_id: &str, link: PeerLink) {
    if let Err(err) = link.audio_sender.stop().await {
        debug!(target = "peer", peer_id, error = %err, "audio sender stop failed");
    }
    if let Err(err) = link.video_sender.stop().await {
        debug!(target = "peer", peer_id, error = %err, "video sender stop failed");
    }
    if let Err(err) = link.connection.close().await {
        debug!(target = "peer", peer_id, error = %err, "peer connection close failed");
    }
}
