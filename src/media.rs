use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::RoomError;

const MEDIA_STREAM_ID: &str = "meshcall";
const AUDIO_TRACK_ID: &str = "audio";
const CAMERA_TRACK_ID: &str = "camera";
const SCREEN_TRACK_ID: &str = "screen";

/// Combined microphone + camera feed. Channel closure means the device
/// stopped producing.
pub struct CaptureFeed {
    pub audio: mpsc::Receiver<Sample>,
    pub video: mpsc::Receiver<Sample>,
}

/// Display-capture feed. Channel closure is the "user stopped sharing"
/// notification (the native browser control analog), not an error.
pub struct DisplayFeed {
    pub video: mpsc::Receiver<Sample>,
}

/// Boundary seam for the host platform's capture devices. Implementations
/// map their own failures onto [`RoomError::MediaUnavailable`].
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Request combined audio+video capture. Failure is fatal for the join.
    async fn open_capture(&self) -> Result<CaptureFeed, RoomError>;

    /// Request display capture. Failure cancels the share action only.
    async fn open_display(&self) -> Result<DisplayFeed, RoomError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    /// The display feed ended outside our control; the camera track must be
    /// restored on every live sender.
    ScreenShareEnded,
}

/// Snapshot of the local media flags, exposed on the room view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// Owns the local outbound tracks and keeps every peer's video sender
/// consistent with camera vs. screen-share mode.
///
/// Mute and camera toggles gate the sample pumps; the negotiated senders are
/// never touched, so no renegotiation happens. Screen share swaps the track
/// on each sender via `replace_track`, which also avoids renegotiation.
/// Invariant: exactly one outbound video track is live per peer at any time,
/// camera or screen, never both.
pub struct TrackManager {
    source: Arc<dyn MediaSource>,
    audio_track: Arc<TrackLocalStaticSample>,
    camera_track: Arc<TrackLocalStaticSample>,
    screen_track: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    capture_pumps: Vec<JoinHandle<()>>,
    screen_pump: Option<JoinHandle<()>>,
}

impl TrackManager {
    /// Acquire camera and microphone and start pumping samples. Runs before
    /// any network activity; a capture failure aborts the whole join.
    pub async fn initialize(
        source: Arc<dyn MediaSource>,
        events_tx: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Self, RoomError> {
        let feed = source.open_capture().await?;
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            AUDIO_TRACK_ID.to_owned(),
            MEDIA_STREAM_ID.to_owned(),
        ));
        let camera_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            CAMERA_TRACK_ID.to_owned(),
            MEDIA_STREAM_ID.to_owned(),
        ));
        let audio_enabled = Arc::new(AtomicBool::new(true));
        let video_enabled = Arc::new(AtomicBool::new(true));
        let capture_pumps = vec![
            spawn_pump(feed.audio, Arc::clone(&audio_track), Arc::clone(&audio_enabled)),
            spawn_pump(feed.video, Arc::clone(&camera_track), Arc::clone(&video_enabled)),
        ];
        info!(target = "media", "local capture initialized");
        Ok(Self {
            source,
            audio_track,
            camera_track,
            screen_track: None,
            audio_enabled,
            video_enabled,
            events_tx,
            capture_pumps,
            screen_pump: None,
        })
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }

    /// The currently active outbound video track: screen while sharing,
    /// camera otherwise. New peer links attach this one.
    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        match &self.screen_track {
            Some(screen) => Arc::clone(screen),
            None => Arc::clone(&self.camera_track),
        }
    }

    /// Returns the new audio-enabled state.
    pub fn toggle_mute(&self) -> bool {
        let was = self.audio_enabled.fetch_xor(true, Ordering::Relaxed);
        debug!(target = "media", enabled = !was, "audio toggled");
        !was
    }

    /// Returns the new video-enabled state.
    pub fn toggle_camera(&self) -> bool {
        let was = self.video_enabled.fetch_xor(true, Ordering::Relaxed);
        debug!(target = "media", enabled = !was, "camera toggled");
        !was
    }

    pub fn state(&self) -> LocalMediaState {
        LocalMediaState {
            audio_enabled: self.audio_enabled.load(Ordering::Relaxed),
            video_enabled: self.video_enabled.load(Ordering::Relaxed),
            screen_sharing: self.screen_track.is_some(),
        }
    }

    /// Start display capture and swap the screen track onto every live video
    /// sender. No-op if already sharing. A capture rejection cancels the
    /// action and leaves camera mode untouched.
    pub async fn start_screen_share(
        &mut self,
        senders: &[Arc<RTCRtpSender>],
    ) -> Result<(), RoomError> {
        if self.screen_track.is_some() {
            return Ok(());
        }
        let feed = self.source.open_display().await?;
        let screen_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            SCREEN_TRACK_ID.to_owned(),
            MEDIA_STREAM_ID.to_owned(),
        ));
        // Best effort per sender, like teardown: one failing sender must not
        // leave the others half-swapped with no pump running.
        for sender in senders {
            if let Err(err) = sender
                .replace_track(Some(
                    Arc::clone(&screen_track) as Arc<dyn TrackLocal + Send + Sync>
                ))
                .await
            {
                warn!(target = "media", error = %err, "screen track swap failed for one sender");
            }
        }
        let events_tx = self.events_tx.clone();
        let pump_track = Arc::clone(&screen_track);
        self.screen_pump = Some(tokio::spawn(async move {
            let mut video = feed.video;
            while let Some(sample) = video.recv().await {
                if let Err(err) = pump_track.write_sample(&sample).await {
                    debug!(target = "media", error = %err, "screen sample write failed");
                    break;
                }
            }
            // Feed ended outside our control; ask the session to restore.
            let _ = events_tx.send(MediaEvent::ScreenShareEnded);
        }));
        self.screen_track = Some(screen_track);
        info!(target = "media", senders = senders.len(), "screen share started");
        Ok(())
    }

    /// Put the camera track back on every live sender. Idempotent; also the
    /// restore path when the display feed ends on its own. Audio is never
    /// touched here, and a failing sender never blocks restoring the rest.
    pub async fn stop_screen_share(&mut self, senders: &[Arc<RTCRtpSender>]) {
        if self.screen_track.take().is_none() {
            return;
        }
        if let Some(pump) = self.screen_pump.take() {
            pump.abort();
        }
        for sender in senders {
            if let Err(err) = sender
                .replace_track(Some(
                    Arc::clone(&self.camera_track) as Arc<dyn TrackLocal + Send + Sync>
                ))
                .await
            {
                warn!(target = "media", error = %err, "camera restore failed for one sender");
            }
        }
        info!(target = "media", senders = senders.len(), "camera restored");
    }

    /// Stop every pump and release the capture feeds. Dropping the feed
    /// receivers is what lets the source release the devices, so this must
    /// run even when earlier teardown steps failed.
    pub fn shutdown(&mut self) {
        for pump in self.capture_pumps.drain(..) {
            pump.abort();
        }
        if let Some(pump) = self.screen_pump.take() {
            pump.abort();
        }
        self.screen_track = None;
        info!(target = "media", "local media released");
    }
}

impl Drop for TrackManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_pump(
    mut feed: mpsc::Receiver<Sample>,
    track: Arc<TrackLocalStaticSample>,
    gate: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = feed.recv().await {
            // Disabled tracks stay attached and negotiated; we just stop
            // feeding them samples.
            if !gate.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(err) = track.write_sample(&sample).await {
                debug!(target = "media", error = %err, "sample write failed; pump stopping");
                break;
            }
        }
    })
}

/// Built-in source producing placeholder media so the CLI and tests can run
/// without camera hardware. Audio alternates speech-sized and DTX-sized
/// payloads; video emits a fixed-size pattern frame. Payloads are not real
/// Opus/VP8 bitstreams, so far ends can observe activity but not decode.
#[derive(Default)]
pub struct SyntheticSource;

const SYNTH_AUDIO_INTERVAL: Duration = Duration::from_millis(20);
const SYNTH_VIDEO_INTERVAL: Duration = Duration::from_millis(33);
const SYNTH_SPEECH_PAYLOAD: usize = 96;
const SYNTH_DTX_PAYLOAD: usize = 4;
const SYNTH_FRAME_PAYLOAD: usize = 1200;

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn open_capture(&self) -> Result<CaptureFeed, RoomError> {
        let (audio_tx, audio) = mpsc::channel(8);
        let (video_tx, video) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNTH_AUDIO_INTERVAL);
            let mut frame: u64 = 0;
            loop {
                ticker.tick().await;
                // 2s talk burst followed by 2s of comfort noise.
                let talking = (frame / 100) % 2 == 0;
                let len = if talking {
                    SYNTH_SPEECH_PAYLOAD
                } else {
                    SYNTH_DTX_PAYLOAD
                };
                let sample = Sample {
                    data: Bytes::from(vec![0u8; len]),
                    duration: SYNTH_AUDIO_INTERVAL,
                    ..Default::default()
                };
                if audio_tx.send(sample).await.is_err() {
                    break;
                }
                frame += 1;
            }
        });
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNTH_VIDEO_INTERVAL);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from(vec![0x42u8; SYNTH_FRAME_PAYLOAD]),
                    duration: SYNTH_VIDEO_INTERVAL,
                    ..Default::default()
                };
                if video_tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        Ok(CaptureFeed { audio, video })
    }

    async fn open_display(&self) -> Result<DisplayFeed, RoomError> {
        let (video_tx, video) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNTH_VIDEO_INTERVAL);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from(vec![0x7fu8; SYNTH_FRAME_PAYLOAD]),
                    duration: SYNTH_VIDEO_INTERVAL,
                    ..Default::default()
                };
                if video_tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        Ok(DisplayFeed { video })
    }
}
