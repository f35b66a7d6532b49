use signal_bus::RelayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("malformed signaling payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("playback failed: {0}")]
    Playback(#[from] PagerError),
    #[error("snapshot pipeline failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("no active session for channel {0}")]
    UnknownChannel(String),
    #[error("session for channel {0} did not connect")]
    NotConnected(String),
}

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("audio resource unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("audio container error: {0}")]
    Container(String),
    #[error("sample write failed: {0}")]
    Write(String),
    #[error("peer connection closed")]
    PeerClosed,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("keyframe decode failed: {0}")]
    Decode(String),
    #[error("still encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verification service unreachable: {0}")]
    Transport(String),
    #[error("verification service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("verification response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
#[error("invalid media config: {0}")]
pub struct ConfigError(pub &'static str);
