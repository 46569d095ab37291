use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SpeakerConfig;

/// Emitted when a remote participant's recent audio level crosses the
/// speaking threshold. The session applies it to the stage unless a
/// participant is pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusRequest {
    pub participant_id: String,
}

/// Rolling window of per-packet level estimates, 0.0..=1.0 each.
#[derive(Debug)]
pub struct LevelWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl LevelWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, level: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(level.clamp(0.0, 1.0));
    }

    pub fn average(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }
}

/// Opus sends large packets for voiced audio and tiny DTX/comfort-noise
/// packets during silence, so payload size is a usable activity estimate
/// without decoding.
const VOICE_PAYLOAD_CEILING: f32 = 120.0;

pub(crate) fn payload_level(payload: &[u8]) -> f32 {
    (payload.len() as f32 / VOICE_PAYLOAD_CEILING).min(1.0)
}

/// Stream of per-packet level estimates for one remote audio feed. `None`
/// ends the monitor (a track ends when its peer connection closes).
#[async_trait]
trait LevelSource: Send {
    async fn next_level(&mut self) -> Option<f32>;
}

struct RtpLevelSource {
    peer_id: String,
    track: Arc<TrackRemote>,
}

#[async_trait]
impl LevelSource for RtpLevelSource {
    async fn next_level(&mut self) -> Option<f32> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Some(payload_level(&packet.payload)),
            Err(err) => {
                debug!(target = "speaker", peer_id = %self.peer_id, error = %err, "audio track ended");
                None
            }
        }
    }
}

/// Per-remote-audio-stream activity monitor.
///
/// Each watched track gets a task that folds inbound RTP into a
/// [`LevelWindow`] and, on a fixed tick, emits a [`FocusRequest`] when the
/// rolling average crosses the threshold. Monitors keep running while a
/// participant is pinned (the session just ignores the requests), so
/// unpinning resumes live detection with no re-setup. `release` aborts the
/// task; leaking monitor loops after a peer departs is a defect.
pub struct ActiveSpeakerDetector {
    config: SpeakerConfig,
    focus_tx: mpsc::UnboundedSender<FocusRequest>,
    monitors: HashMap<String, JoinHandle<()>>,
}

impl ActiveSpeakerDetector {
    pub fn new(config: SpeakerConfig, focus_tx: mpsc::UnboundedSender<FocusRequest>) -> Self {
        Self {
            config,
            focus_tx,
            monitors: HashMap::new(),
        }
    }

    pub fn watch(&mut self, peer_id: &str, track: Arc<TrackRemote>) {
        self.watch_source(
            peer_id,
            RtpLevelSource {
                peer_id: peer_id.to_string(),
                track,
            },
        );
    }

    fn watch_source(&mut self, peer_id: &str, mut source: impl LevelSource + 'static) {
        if self.monitors.contains_key(peer_id) {
            return;
        }
        let config = self.config;
        let focus_tx = self.focus_tx.clone();
        let id = peer_id.to_string();
        let handle = tokio::spawn(async move {
            let mut window = LevelWindow::new(config.window);
            let mut ticker = tokio::time::interval(config.sample_interval);
            loop {
                tokio::select! {
                    level = source.next_level() => match level {
                        Some(level) => window.push(level),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if window.average() >= config.threshold
                            && focus_tx
                                .send(FocusRequest { participant_id: id.clone() })
                                .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
        self.monitors.insert(peer_id.to_string(), handle);
        debug!(target = "speaker", peer_id, monitors = self.monitors.len(), "audio monitor started");
    }

    pub fn release(&mut self, peer_id: &str) {
        if let Some(handle) = self.monitors.remove(peer_id) {
            handle.abort();
            debug!(target = "speaker", peer_id, "audio monitor released");
        }
    }

    pub fn release_all(&mut self) {
        for (_, handle) in self.monitors.drain() {
            handle.abort();
        }
    }

    pub fn is_watching(&self, peer_id: &str) -> bool {
        self.monitors.contains_key(peer_id)
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}

impl Drop for ActiveSpeakerDetector {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn empty_window_is_silent() {
        let window = LevelWindow::new(8);
        assert_eq!(window.average(), 0.0);
    }

    #[test]
    fn window_drops_oldest_samples() {
        let mut window = LevelWindow::new(2);
        window.push(1.0);
        window.push(1.0);
        window.push(0.0);
        // Only the last two samples remain.
        assert!((window.average() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn speech_payloads_outscore_dtx() {
        let speech = payload_level(&[0u8; 100]);
        let dtx = payload_level(&[0u8; 4]);
        assert!(speech > 0.8);
        assert!(dtx < 0.05);
    }

    #[test]
    fn level_is_clamped_to_unit_range() {
        assert_eq!(payload_level(&[0u8; 10_000]), 1.0);
        let mut window = LevelWindow::new(4);
        window.push(7.5);
        window.push(-3.0);
        assert!(window.average() >= 0.0 && window.average() <= 1.0);
    }

    struct ScriptedLevels {
        levels: mpsc::UnboundedReceiver<f32>,
    }

    #[async_trait]
    impl LevelSource for ScriptedLevels {
        async fn next_level(&mut self) -> Option<f32> {
            self.levels.recv().await
        }
    }

    fn fast_config() -> SpeakerConfig {
        SpeakerConfig {
            threshold: 0.3,
            sample_interval: Duration::from_millis(10),
            window: 4,
        }
    }

    fn scripted_monitor(
        detector: &mut ActiveSpeakerDetector,
        peer_id: &str,
    ) -> mpsc::UnboundedSender<f32> {
        let (level_tx, levels) = mpsc::unbounded_channel();
        detector.watch_source(peer_id, ScriptedLevels { levels });
        level_tx
    }

    #[tokio::test]
    async fn loud_stream_requests_focus() {
        let (focus_tx, mut focus_rx) = mpsc::unbounded_channel();
        let mut detector = ActiveSpeakerDetector::new(fast_config(), focus_tx);
        let level_tx = scripted_monitor(&mut detector, "bob");
        assert!(detector.is_watching("bob"));

        for _ in 0..4 {
            level_tx.send(0.9).unwrap();
        }
        let request = timeout(Duration::from_secs(2), focus_rx.recv())
            .await
            .expect("request within deadline")
            .expect("channel open");
        assert_eq!(request.participant_id, "bob");
    }

    #[tokio::test]
    async fn quiet_stream_never_requests_focus() {
        let (focus_tx, mut focus_rx) = mpsc::unbounded_channel();
        let mut detector = ActiveSpeakerDetector::new(fast_config(), focus_tx);
        let level_tx = scripted_monitor(&mut detector, "bob");

        for _ in 0..8 {
            level_tx.send(0.05).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(focus_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn release_stops_departed_monitors() {
        let (focus_tx, mut focus_rx) = mpsc::unbounded_channel();
        let mut detector = ActiveSpeakerDetector::new(fast_config(), focus_tx);
        let bob_tx = scripted_monitor(&mut detector, "bob");
        let _carol_tx = scripted_monitor(&mut detector, "carol");
        // Watching the same id twice keeps a single monitor.
        let _dup_tx = scripted_monitor(&mut detector, "bob");
        assert_eq!(detector.monitor_count(), 2);

        detector.release("bob");
        assert!(!detector.is_watching("bob"));
        detector.release("bob");
        assert_eq!(detector.monitor_count(), 1);

        // The released monitor is dead: loud input no longer emits.
        for _ in 0..8 {
            let _ = bob_tx.send(0.9);
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(focus_rx.try_recv().is_err());

        detector.release_all();
        assert_eq!(detector.monitor_count(), 0);
    }
}
