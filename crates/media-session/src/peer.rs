//! Peer connection construction. Transport callbacks only forward
//! [`SessionEvent`]s; the owning session's driver acts on them in order.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MediaConfig;
use crate::error::{PagerError, SessionError};
use crate::pager::{GuardedTrack, PlaybackStats, play_file};
use crate::state::ConnectionState;

pub enum SessionEvent {
    State(ConnectionState),
    /// Locally gathered candidate, to be relayed to the remote side.
    Candidate(RTCIceCandidateInit),
    RemoteTrack(Arc<TrackRemote>),
    /// An inbound track stopped delivering packets.
    TrackEnded,
}

pub fn build_api() -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct PeerHandle {
    pub peer: Arc<RTCPeerConnection>,
    pub audio: Arc<TrackLocalStaticSample>,
    pub events_tx: mpsc::UnboundedSender<SessionEvent>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Creates a peer connection carrying one outbound Opus track and wires its
/// callbacks into an event channel.
pub async fn open_peer(
    api: &API,
    config: &MediaConfig,
    stream_id: &str,
) -> Result<PeerHandle, SessionError> {
    let peer = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        })
        .await?,
    );

    let audio = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        stream_id.to_owned(),
    ));
    let sender = match peer
        .add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
        .await
    {
        Ok(sender) => sender,
        Err(err) => {
            let _ = peer.close().await;
            return Err(err.into());
        }
    };

    // Feedback must be read for interceptors to run; the loop ends with the peer.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
        trace!("rtcp drain finished");
    });

    let (events_tx, events) = mpsc::unbounded_channel();

    let tx = events_tx.clone();
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(SessionEvent::State(state.into()));
        Box::pin(async {})
    }));

    let tx = events_tx.clone();
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(SessionEvent::Candidate(init));
                }
                Err(err) => warn!(error = %err, "failed to serialize local candidate"),
            }
        })
    }));

    let tx = events_tx.clone();
    peer.on_track(Box::new(move |track, _receiver, _transceiver| {
        let _ = tx.send(SessionEvent::RemoteTrack(track));
        Box::pin(async {})
    }));

    Ok(PeerHandle {
        peer,
        audio,
        events_tx,
        events,
    })
}

/// Connection, outbound audio and lifecycle flags shared by both session kinds.
pub struct MediaPeer {
    channel_id: String,
    peer: Arc<RTCPeerConnection>,
    audio: Arc<TrackLocalStaticSample>,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl MediaPeer {
    pub fn new(
        channel_id: impl Into<String>,
        handle: PeerHandle,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (state, _) = watch::channel(ConnectionState::New);
        (
            Self {
                channel_id: channel_id.into(),
                peer: handle.peer,
                audio: handle.audio,
                state,
                closed: AtomicBool::new(false),
                events_tx: handle.events_tx,
            },
            handle.events,
        )
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Records a transport state. Terminal states are sticky.
    pub(crate) fn publish(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Plays an audio resource on the outbound track while the connection is open.
    pub async fn play(&self, path: &Path) -> Result<PlaybackStats, PagerError> {
        let sink = GuardedTrack::new(Arc::clone(&self.audio), &self.peer);
        play_file(path, &sink).await
    }

    /// Marks the session closed. Returns false if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) async fn finish_close(&self) {
        close_peer(&self.peer).await;
        self.state.send_replace(ConnectionState::Closed);
    }
}

/// Resolves once the session has reached a terminal state.
pub(crate) async fn terminated(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|state| state.is_terminal()).await.map(|_| ());
}

/// Closes the connection unless it is already closed.
pub async fn close_peer(peer: &RTCPeerConnection) {
    if peer.connection_state() == RTCPeerConnectionState::Closed {
        return;
    }
    if let Err(err) = peer.close().await {
        warn!(error = %err, "peer connection close failed");
    }
}

/// True when the session description declares at least one video m-line.
pub fn offers_video(offer: &RTCSessionDescription) -> Result<bool, SessionError> {
    let parsed = offer.unmarshal()?;
    Ok(parsed
        .media_descriptions
        .iter()
        .any(|media| media.media_name.media == "video"))
}

/// Asks the remote sender for a keyframe every `every` until the connection
/// goes away or the session reports a terminal state.
pub async fn request_keyframes(
    peer: std::sync::Weak<RTCPeerConnection>,
    media_ssrc: u32,
    every: Duration,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    break;
                }
                continue;
            }
        }
        let Some(peer) = peer.upgrade() else {
            break;
        };
        if peer.connection_state() == RTCPeerConnectionState::Closed {
            break;
        }
        let request: [Box<dyn RtcpPacket + Send + Sync>; 1] = [Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })];
        if let Err(err) = peer.write_rtcp(&request).await {
            debug!(error = %err, media_ssrc, "keyframe request failed");
            break;
        }
    }
    trace!(media_ssrc, "keyframe requests stopped");
}
