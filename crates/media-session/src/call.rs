//! Inbound call sessions: answer the caller, then either run the still-image
//! challenge (video) or decline with a cue (audio only).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use signal_bus::{Envelope, Relay, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MediaConfig;
use crate::error::{SessionError, SnapshotError};
use crate::peer::{
    MediaPeer, SessionEvent, build_api, offers_video, open_peer, request_keyframes, terminated,
};
use crate::queue::{LossyQueue, PushOutcome};
use crate::registry::SessionRegistry;
use crate::snapshot::{DecoderFactory, SnapshotOutcome, SnapshotPipeline, vp8_decoder_factory};
use crate::state::{ConnectionState, Cue, Reaction, react};
use crate::verify::IdentityVerifier;

pub struct CallSession {
    media: MediaPeer,
    clan_id: String,
    caller_id: String,
    receiver_id: String,
    is_video_call: OnceLock<bool>,
    video: Mutex<Option<Arc<TrackRemote>>>,
    packets: Arc<LossyQueue<Packet>>,
    answered: AtomicBool,
}

impl CallSession {
    pub fn channel_id(&self) -> &str {
        self.media.channel_id()
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    /// Fixed by the first offer; `false` until then.
    pub fn is_video_call(&self) -> bool {
        self.is_video_call.get().copied().unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        self.media.state()
    }

    pub fn is_closed(&self) -> bool {
        self.media.is_closed()
    }

    pub fn has_video_track(&self) -> bool {
        self.video.lock().is_some()
    }

    /// Envelope from the bot back to the caller on this channel.
    fn reply(&self, kind: SignalKind) -> Envelope {
        Envelope::new(kind, self.channel_id()).with_route(
            self.clan_id.clone(),
            self.receiver_id.clone(),
            self.caller_id.clone(),
        )
    }
}

/// Answers inbound calls addressed to one bot identity.
#[derive(Clone)]
pub struct CallService {
    inner: Arc<CallInner>,
}

struct CallInner {
    bot_id: String,
    api: API,
    config: MediaConfig,
    relay: Arc<dyn Relay>,
    verifier: Arc<dyn IdentityVerifier>,
    decoders: DecoderFactory,
    sessions: SessionRegistry<CallSession>,
}

impl CallService {
    pub fn new(
        bot_id: impl Into<String>,
        config: MediaConfig,
        relay: Arc<dyn Relay>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, SessionError> {
        Self::with_decoders(bot_id, config, relay, verifier, vp8_decoder_factory())
    }

    pub fn with_decoders(
        bot_id: impl Into<String>,
        config: MediaConfig,
        relay: Arc<dyn Relay>,
        verifier: Arc<dyn IdentityVerifier>,
        decoders: DecoderFactory,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            inner: Arc::new(CallInner {
                bot_id: bot_id.into(),
                api: build_api()?,
                config,
                relay,
                verifier,
                decoders,
                sessions: SessionRegistry::new(),
            }),
        })
    }

    pub fn bot_id(&self) -> &str {
        &self.inner.bot_id
    }

    pub fn sessions(&self) -> &SessionRegistry<CallSession> {
        &self.inner.sessions
    }

    pub fn session(&self, channel_id: &str) -> Option<Arc<CallSession>> {
        self.inner.sessions.get(channel_id)
    }

    pub fn connection_state(&self, channel_id: &str) -> Option<ConnectionState> {
        self.session(channel_id).map(|session| session.state())
    }

    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), SessionError> {
        if envelope.receiver_id != self.inner.bot_id {
            trace!(channel_id = %envelope.channel_id, receiver_id = %envelope.receiver_id, "envelope not addressed to this bot");
            return Ok(());
        }
        match envelope.kind {
            SignalKind::SdpOffer => self.handle_offer(&envelope).await.map(|_| ()),
            SignalKind::IceCandidate => self.handle_candidate(&envelope).await,
            SignalKind::Quit => {
                self.handle_quit(&envelope).await;
                Ok(())
            }
            other => {
                debug!(kind = ?other, channel_id = %envelope.channel_id, "ignoring envelope");
                Ok(())
            }
        }
    }

    /// Applies an offer, answers it, and relays the answer to the caller.
    pub async fn handle_offer(&self, envelope: &Envelope) -> Result<RTCSessionDescription, SessionError> {
        let offer: RTCSessionDescription = envelope.payload_as()?;
        let has_video = offers_video(&offer)?;
        let (session, created) = self.session_for(envelope).await?;
        let is_video_call = *session.is_video_call.get_or_init(|| has_video);
        info!(
            channel_id = %envelope.channel_id,
            caller_id = %envelope.caller_id,
            is_video_call,
            "processing offer"
        );

        match self.answer(&session, offer).await {
            Ok(answer) => Ok(answer),
            Err(err) => {
                if created {
                    self.teardown_session(&session).await;
                }
                Err(err)
            }
        }
    }

    async fn answer(
        &self,
        session: &CallSession,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, SessionError> {
        let peer = session.media.connection();
        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer(None).await?;
        peer.set_local_description(answer.clone()).await?;
        let reply = session.reply(SignalKind::SdpAnswer).with_payload(&answer)?;
        self.inner.relay.send(reply).await?;
        Ok(answer)
    }

    /// Applies a remote candidate. Candidates for unknown channels are dropped.
    pub async fn handle_candidate(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let Some(session) = self.session(&envelope.channel_id) else {
            debug!(channel_id = %envelope.channel_id, "dropping candidate for unknown channel");
            return Ok(());
        };
        let candidate: RTCIceCandidateInit = envelope.payload_as()?;
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        session.media.connection().add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub async fn handle_quit(&self, envelope: &Envelope) {
        if !self.teardown(&envelope.channel_id).await {
            debug!(channel_id = %envelope.channel_id, "quit for unknown channel");
        }
    }

    /// Tears down the channel's session. Returns false if there was none.
    pub async fn teardown(&self, channel_id: &str) -> bool {
        match self.session(channel_id) {
            Some(session) => {
                self.teardown_session(&session).await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        for channel_id in self.inner.sessions.channel_ids() {
            self.teardown(&channel_id).await;
        }
    }

    async fn session_for(&self, envelope: &Envelope) -> Result<(Arc<CallSession>, bool), SessionError> {
        if let Some(session) = self.session(&envelope.channel_id) {
            return Ok((session, false));
        }

        let handle = open_peer(&self.inner.api, &self.inner.config, &envelope.channel_id).await?;
        let (media, events) = MediaPeer::new(envelope.channel_id.clone(), handle);
        let session = Arc::new(CallSession {
            media,
            clan_id: envelope.clan_id.clone(),
            caller_id: envelope.caller_id.clone(),
            receiver_id: self.inner.bot_id.clone(),
            is_video_call: OnceLock::new(),
            video: Mutex::new(None),
            packets: Arc::new(LossyQueue::new(
                self.inner.config.packet_queue_capacity,
                self.inner.config.drop_policy,
            )),
            answered: AtomicBool::new(false),
        });

        match self
            .inner
            .sessions
            .insert_if_absent(&envelope.channel_id, Arc::clone(&session))
        {
            Ok(session) => {
                info!(channel_id = %envelope.channel_id, "call session created");
                tokio::spawn(self.clone().drive(Arc::clone(&session), events));
                Ok((session, true))
            }
            Err(existing) => {
                session.media.finish_close().await;
                Ok((existing, false))
            }
        }
    }

    async fn drive(self, session: Arc<CallSession>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let mut state = session.media.subscribe();
        let timeout = self.inner.config.negotiation_timeout;
        let watchdog = tokio::time::sleep(timeout.unwrap_or_default());
        tokio::pin!(watchdog);
        let mut negotiating = timeout.is_some();

        loop {
            tokio::select! {
                biased;
                _ = terminated(&mut state) => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SessionEvent::State(next) => {
                            debug!(channel_id = %session.channel_id(), state = ?next, "connection state changed");
                            session.media.publish(next);
                            if next == ConnectionState::Connected {
                                negotiating = false;
                            }
                            self.on_state(&session, next).await;
                        }
                        SessionEvent::Candidate(candidate) => self.relay_candidate(&session, candidate).await,
                        SessionEvent::RemoteTrack(track) => self.on_remote_track(&session, track),
                        SessionEvent::TrackEnded => self.teardown_session(&session).await,
                    }
                }
                _ = &mut watchdog, if negotiating => {
                    warn!(channel_id = %session.channel_id(), "call did not connect in time");
                    negotiating = false;
                    self.teardown_session(&session).await;
                }
            }
        }
        debug!(channel_id = %session.channel_id(), "call driver stopped");
    }

    async fn on_state(&self, session: &Arc<CallSession>, state: ConnectionState) {
        match react(state, session.is_video_call()) {
            Reaction::AcceptAndSnapshot => {
                if !session.answered.swap(true, Ordering::AcqRel) {
                    self.spawn_challenge(Arc::clone(session));
                }
            }
            Reaction::DeclineAndClose => {
                if !session.answered.swap(true, Ordering::AcqRel) {
                    info!(channel_id = %session.channel_id(), "declining audio-only call");
                    let service = self.clone();
                    let session = Arc::clone(session);
                    tokio::spawn(async move {
                        service.play_cue(&session, Cue::Exit).await;
                        service.teardown_session(&session).await;
                    });
                }
            }
            Reaction::Teardown => self.teardown_session(session).await,
            Reaction::Ignore => {}
        }
    }

    fn spawn_challenge(&self, session: Arc<CallSession>) {
        let service = self.clone();
        tokio::spawn(async move {
            service.play_cue(&session, Cue::Accept).await;

            let mut pipeline = SnapshotPipeline::new(
                session.channel_id(),
                service.inner.config.snapshot_limit,
                Arc::clone(&service.inner.verifier),
                Arc::clone(&service.inner.decoders),
            );
            let packets = Arc::clone(&session.packets);
            let outcome = match tokio::spawn(async move { pipeline.run(&packets).await }).await {
                Ok(outcome) => outcome,
                Err(err) => Err(SnapshotError::Decode(format!("pipeline task aborted: {err}"))),
            };

            session.packets.close();
            match &outcome {
                Ok(outcome) => info!(channel_id = %session.channel_id(), ?outcome, "snapshot challenge finished"),
                Err(err) => warn!(channel_id = %session.channel_id(), error = %err, "snapshot pipeline failed"),
            }
            if let Some(cue) = closing_cue(&outcome) {
                service.play_cue(&session, cue).await;
            }
            service.teardown_session(&session).await;
        });
    }

    fn on_remote_track(&self, session: &Arc<CallSession>, track: Arc<TrackRemote>) {
        if track.kind() != RTPCodecType::Video {
            debug!(channel_id = %session.channel_id(), kind = ?track.kind(), "ignoring inbound track");
            return;
        }
        let media_ssrc = track.ssrc();
        debug!(channel_id = %session.channel_id(), media_ssrc, "inbound video track");
        *session.video.lock() = Some(Arc::clone(&track));

        tokio::spawn(pump_video(
            track,
            Arc::clone(&session.packets),
            session.media.events(),
        ));
        tokio::spawn(request_keyframes(
            Arc::downgrade(session.media.connection()),
            media_ssrc,
            self.inner.config.keyframe_interval,
            session.media.subscribe(),
        ));
    }

    async fn relay_candidate(&self, session: &CallSession, candidate: RTCIceCandidateInit) {
        let envelope = match session.reply(SignalKind::IceCandidate).with_payload(&candidate) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(channel_id = %session.channel_id(), error = %err, "failed to encode candidate");
                return;
            }
        };
        if let Err(err) = self.inner.relay.send(envelope).await {
            warn!(channel_id = %session.channel_id(), error = %err, "failed to relay candidate");
        }
    }

    async fn play_cue(&self, session: &CallSession, cue: Cue) {
        let path = self.inner.config.cues.path(cue);
        match session.media.play(path).await {
            Ok(stats) => debug!(channel_id = %session.channel_id(), ?cue, samples = stats.samples, "cue played"),
            Err(err) => warn!(channel_id = %session.channel_id(), ?cue, error = %err, "cue playback failed"),
        }
    }

    async fn teardown_session(&self, session: &Arc<CallSession>) {
        if !session.media.begin_close() {
            return;
        }
        session.packets.close();
        session.media.finish_close().await;
        self.inner
            .sessions
            .remove_if_same(session.channel_id(), session);
        info!(channel_id = %session.channel_id(), "call session closed");
    }
}

/// Cue played when the challenge ends. An interrupted challenge was already
/// torn down from outside and gets none.
pub fn closing_cue(outcome: &Result<SnapshotOutcome, SnapshotError>) -> Option<Cue> {
    match outcome {
        Ok(SnapshotOutcome::Verified { .. }) => Some(Cue::Success),
        Ok(SnapshotOutcome::Interrupted { .. }) => None,
        Ok(SnapshotOutcome::Rejected { .. } | SnapshotOutcome::Exhausted { .. }) | Err(_) => {
            Some(Cue::Failure)
        }
    }
}

async fn pump_video(
    track: Arc<TrackRemote>,
    packets: Arc<LossyQueue<Packet>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packets.push(packet) == PushOutcome::Closed {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "inbound video read failed");
                let _ = events.send(SessionEvent::TrackEnded);
                break;
            }
        }
    }
    trace!(dropped = packets.dropped(), "video pump stopped");
}
