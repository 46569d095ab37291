//! Mesh video-conferencing client: full-mesh WebRTC calls coordinated over a
//! JSON websocket signaling protocol, with mute/camera toggles, screen
//! sharing via track replacement, text chat, and payload-level active-speaker
//! detection driving the stage.

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod speaker;

pub use config::{RoomConfig, SpeakerConfig};
pub use error::RoomError;
pub use media::{CaptureFeed, DisplayFeed, MediaSource, SyntheticSource};
pub use session::{
    ChatMessage, Participant, RoomCommand, RoomHandle, RoomSession, RoomView, SessionState,
    StageSelection,
};
pub use signaling::{ClientMessage, ParticipantInfo, ServerMessage};
pub use speaker::FocusRequest;
