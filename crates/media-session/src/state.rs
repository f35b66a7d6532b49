use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `failed` is handled exactly like `closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Audio cues played to the remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    Accept,
    Exit,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Play the accept cue, then start the snapshot pipeline.
    AcceptAndSnapshot,
    /// Audio-only calls are declined: play the exit cue, then close.
    DeclineAndClose,
    /// Close the peer connection and drop the registry entry.
    Teardown,
    Ignore,
}

/// Policy for an inbound call session entering `state`.
pub fn react(state: ConnectionState, is_video_call: bool) -> Reaction {
    match state {
        ConnectionState::Connected if is_video_call => Reaction::AcceptAndSnapshot,
        ConnectionState::Connected => Reaction::DeclineAndClose,
        state if state.is_terminal() => Reaction::Teardown,
        _ => Reaction::Ignore,
    }
}
