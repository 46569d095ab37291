use thiserror::Error;

/// Failures surfaced by the room core.
///
/// `MediaUnavailable` is fatal at entry: it aborts the join before any
/// network activity. Peer-local negotiation failures are logged by the
/// session and never escalate past the affected peer link.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("media capture unavailable: {0}")]
    MediaUnavailable(String),
    #[error("signaling setup failed: {0}")]
    Signaling(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("webrtc negotiation failed: {0}")]
    Negotiation(#[from] webrtc::Error),
}
