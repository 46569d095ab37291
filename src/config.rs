use std::time::Duration;

use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::RoomError;

/// Default STUN endpoint used when no ICE servers are supplied. TURN is
/// deliberately not configured; mesh calls across symmetric NATs may fail.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8443";

/// Configuration for one room session.
#[derive(Clone)]
pub struct RoomConfig {
    /// Base URL of the signaling server; `rooms/<code>` is appended.
    pub signaling_url: String,
    /// ICE servers handed to every peer connection.
    pub ice_servers: Vec<RTCIceServer>,
    /// How long `Joining` may wait for the roster before giving up.
    pub join_timeout: Duration,
    pub speaker: SpeakerConfig,
}

/// Tuning knobs for the active-speaker detector.
#[derive(Debug, Clone, Copy)]
pub struct SpeakerConfig {
    /// Rolling-average level (0.0..=1.0) above which a participant is
    /// considered to be speaking.
    pub threshold: f32,
    /// Cadence at which the rolling average is evaluated.
    pub sample_interval: Duration,
    /// Number of packet-level samples kept in the rolling window.
    pub window: usize,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            sample_interval: Duration::from_millis(250),
            window: 25,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        let signaling_url = std::env::var("MESHCALL_SIGNALING_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let ice_servers = if std::env::var("MESHCALL_DISABLE_STUN").is_ok() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }]
        };
        Self {
            signaling_url,
            ice_servers,
            join_timeout: Duration::from_secs(10),
            speaker: SpeakerConfig::default(),
        }
    }
}

impl RoomConfig {
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    /// Host-candidates-only configuration, for loopback calls and tests.
    pub fn without_ice_servers(mut self) -> Self {
        self.ice_servers = vec![];
        self
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    /// Derive the websocket endpoint for a room code. `http(s)` schemes are
    /// rewritten to `ws(s)` so the base may be given either way.
    pub fn websocket_url(&self, room_code: &str) -> Result<Url, RoomError> {
        let mut url = Url::parse(&self.signaling_url).map_err(|err| {
            RoomError::Signaling(format!("invalid signaling url {}: {err}", self.signaling_url))
        })?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(RoomError::Signaling(format!(
                    "unsupported signaling scheme {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| RoomError::Signaling("invalid websocket scheme".into()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RoomError::Signaling("cannot mutate signaling url path".into()))?;
            segments.pop_if_empty();
            segments.push("rooms");
            segments.push(room_code);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_appends_room_path() {
        let config = RoomConfig::default().with_signaling_url("ws://localhost:9000");
        let url = config.websocket_url("ABC123").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9000/rooms/ABC123");
    }

    #[test]
    fn websocket_url_rewrites_https_to_wss() {
        let config = RoomConfig::default().with_signaling_url("https://signal.example.com/base");
        let url = config.websocket_url("XYZ").unwrap();
        assert_eq!(url.as_str(), "wss://signal.example.com/base/rooms/XYZ");
    }

    #[test]
    fn websocket_url_rejects_unknown_scheme() {
        let config = RoomConfig::default().with_signaling_url("ftp://nope");
        assert!(config.websocket_url("XYZ").is_err());
    }
}
