//! Outbound radio sessions: publish an audio track into a channel and page
//! prerecorded audio onto it.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use signal_bus::{ConnectNotice, Envelope, Relay, SignalKind, TalkNotice};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::MediaConfig;
use crate::error::SessionError;
use crate::pager::PlaybackStats;
use crate::peer::{MediaPeer, SessionEvent, build_api, open_peer, terminated};
use crate::registry::SessionRegistry;
use crate::state::ConnectionState;

/// Identity the publisher presents on the relay.
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    pub user_id: String,
    pub clan_id: String,
    pub display_name: Option<String>,
}

pub struct StreamSession {
    media: MediaPeer,
    announced: AtomicBool,
}

impl StreamSession {
    pub fn channel_id(&self) -> &str {
        self.media.channel_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.media.state()
    }

    pub fn is_closed(&self) -> bool {
        self.media.is_closed()
    }
}

#[derive(Clone)]
pub struct StreamService {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    publisher: Publisher,
    api: API,
    config: MediaConfig,
    relay: Arc<dyn Relay>,
    sessions: SessionRegistry<StreamSession>,
}

impl StreamService {
    pub fn new(
        publisher: Publisher,
        config: MediaConfig,
        relay: Arc<dyn Relay>,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            inner: Arc::new(StreamInner {
                publisher,
                api: build_api()?,
                config,
                relay,
                sessions: SessionRegistry::new(),
            }),
        })
    }

    pub fn session(&self, channel_id: &str) -> Option<Arc<StreamSession>> {
        self.inner.sessions.get(channel_id)
    }

    pub fn connection_state(&self, channel_id: &str) -> Option<ConnectionState> {
        self.session(channel_id).map(|session| session.state())
    }

    fn envelope(&self, kind: SignalKind, channel_id: &str) -> Envelope {
        let publisher = &self.inner.publisher;
        let envelope = Envelope::new(kind, channel_id).with_route(
            publisher.clan_id.clone(),
            publisher.user_id.clone(),
            String::new(),
        );
        match &publisher.display_name {
            Some(name) => envelope.with_display_name(name.clone()),
            None => envelope,
        }
    }

    /// Opens a publisher session on `channel_id` and relays its offer.
    /// An already running session is returned as is.
    pub async fn start(&self, channel_id: &str) -> Result<Arc<StreamSession>, SessionError> {
        if let Some(session) = self.session(channel_id) {
            return Ok(session);
        }

        let handle = open_peer(&self.inner.api, &self.inner.config, channel_id).await?;
        let (media, events) = MediaPeer::new(channel_id, handle);
        let session = Arc::new(StreamSession {
            media,
            announced: AtomicBool::new(false),
        });
        if let Err(existing) = self
            .inner
            .sessions
            .insert_if_absent(channel_id, Arc::clone(&session))
        {
            session.media.finish_close().await;
            return Ok(existing);
        }
        info!(channel_id, "stream session created");
        tokio::spawn(self.clone().drive(Arc::clone(&session), events));

        if let Err(err) = self.offer(&session).await {
            self.teardown_session(&session).await;
            return Err(err);
        }
        Ok(session)
    }

    async fn offer(&self, session: &StreamSession) -> Result<(), SessionError> {
        let peer = session.media.connection();
        let offer = peer.create_offer(None).await?;
        peer.set_local_description(offer.clone()).await?;
        let envelope = self
            .envelope(SignalKind::SdpOffer, session.channel_id())
            .with_payload(&offer)?;
        self.inner.relay.send(envelope).await?;
        Ok(())
    }

    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), SessionError> {
        let Some(session) = self.session(&envelope.channel_id) else {
            trace!(channel_id = %envelope.channel_id, kind = ?envelope.kind, "no stream session for envelope");
            return Ok(());
        };
        match envelope.kind {
            SignalKind::SdpAnswer => {
                let answer: RTCSessionDescription = envelope.payload_as()?;
                session.media.connection().set_remote_description(answer).await?;
                debug!(channel_id = %envelope.channel_id, "stream answer applied");
            }
            SignalKind::IceCandidate => {
                let candidate: RTCIceCandidateInit = envelope.payload_as()?;
                if !candidate.candidate.is_empty() {
                    session.media.connection().add_ice_candidate(candidate).await?;
                }
            }
            SignalKind::ConnectAck => {
                let notice = TalkNotice {
                    channel_id: envelope.channel_id.clone(),
                    is_talk: true,
                };
                let ptt = self
                    .envelope(SignalKind::Ptt, &envelope.channel_id)
                    .with_payload(&notice)?;
                self.inner.relay.send(ptt).await?;
                info!(channel_id = %envelope.channel_id, "publisher acknowledged, talking");
            }
            SignalKind::Quit => self.teardown_session(&session).await,
            other => debug!(kind = ?other, channel_id = %envelope.channel_id, "ignoring envelope"),
        }
        Ok(())
    }

    /// Waits until the channel's session is connected.
    pub async fn wait_connected(&self, channel_id: &str, limit: Duration) -> Result<(), SessionError> {
        let session = self
            .session(channel_id)
            .ok_or_else(|| SessionError::UnknownChannel(channel_id.to_string()))?;
        let mut state = session.media.subscribe();
        let connected = match tokio::time::timeout(
            limit,
            state.wait_for(|state| *state == ConnectionState::Connected || state.is_terminal()),
        )
        .await
        {
            Ok(Ok(state)) => *state == ConnectionState::Connected,
            _ => false,
        };
        if connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected(channel_id.to_string()))
        }
    }

    /// Pages an audio resource into the channel's outbound track.
    pub async fn play(&self, channel_id: &str, path: &Path) -> Result<PlaybackStats, SessionError> {
        let session = self
            .session(channel_id)
            .ok_or_else(|| SessionError::UnknownChannel(channel_id.to_string()))?;
        info!(channel_id, path = %path.display(), "streaming audio");
        Ok(session.media.play(path).await?)
    }

    /// Ends the channel's session. Returns false if there was none.
    pub async fn stop(&self, channel_id: &str) -> bool {
        match self.session(channel_id) {
            Some(session) => {
                self.teardown_session(&session).await;
                true
            }
            None => false,
        }
    }

    async fn drive(self, session: Arc<StreamSession>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
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
                                self.announce(&session).await;
                            } else if next.is_terminal() {
                                self.teardown_session(&session).await;
                            }
                        }
                        SessionEvent::Candidate(candidate) => {
                            let envelope = self
                                .envelope(SignalKind::IceCandidate, session.channel_id())
                                .with_payload(&candidate);
                            match envelope {
                                Ok(envelope) => {
                                    if let Err(err) = self.inner.relay.send(envelope).await {
                                        warn!(channel_id = %session.channel_id(), error = %err, "failed to relay candidate");
                                    }
                                }
                                Err(err) => warn!(channel_id = %session.channel_id(), error = %err, "failed to encode candidate"),
                            }
                        }
                        SessionEvent::RemoteTrack(track) => {
                            debug!(channel_id = %session.channel_id(), kind = ?track.kind(), "ignoring inbound track on publisher");
                        }
                        SessionEvent::TrackEnded => {}
                    }
                }
                _ = &mut watchdog, if negotiating => {
                    warn!(channel_id = %session.channel_id(), "stream did not connect in time");
                    negotiating = false;
                    self.teardown_session(&session).await;
                }
            }
        }
        debug!(channel_id = %session.channel_id(), "stream driver stopped");
    }

    /// Tells the relay the publisher is connected, once per session.
    async fn announce(&self, session: &StreamSession) {
        if session.announced.swap(true, Ordering::AcqRel) {
            return;
        }
        let notice = ConnectNotice {
            channel_id: session.channel_id().to_string(),
        };
        let sent = match self
            .envelope(SignalKind::ConnectAck, session.channel_id())
            .with_payload(&notice)
        {
            Ok(envelope) => self.inner.relay.send(envelope).await.map_err(SessionError::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = sent {
            warn!(channel_id = %session.channel_id(), error = %err, "failed to announce publisher");
        }
    }

    async fn teardown_session(&self, session: &Arc<StreamSession>) {
        if !session.media.begin_close() {
            return;
        }
        session.media.finish_close().await;
        self.inner
            .sessions
            .remove_if_same(session.channel_id(), session);
        info!(channel_id = %session.channel_id(), "stream session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_bus::LocalRelay;

    fn publisher() -> Publisher {
        Publisher {
            user_id: "radio-bot".into(),
            clan_id: "clan".into(),
            display_name: Some("Radio".into()),
        }
    }

    #[tokio::test]
    async fn connected_publisher_is_announced_once() {
        let (bot, relay_side) = LocalRelay::pair();
        let mut outbound = relay_side.subscribe();
        let config = MediaConfig {
            negotiation_timeout: None,
            ..MediaConfig::localhost()
        };
        let service = StreamService::new(publisher(), config, Arc::new(bot)).expect("service");

        let session = service.start("R1").await.expect("started");
        let offer = outbound.recv().await.expect("offer relayed");
        assert_eq!(offer.kind, SignalKind::SdpOffer);
        assert_eq!(offer.display_name.as_deref(), Some("Radio"));

        for _ in 0..2 {
            session
                .media
                .events()
                .send(SessionEvent::State(ConnectionState::Connected))
                .expect("driver alive");
        }
        let ack = loop {
            let envelope = outbound.recv().await.expect("relay open");
            if envelope.kind == SignalKind::ConnectAck {
                break envelope;
            }
        };
        let notice: ConnectNotice = ack.payload_as().expect("notice");
        assert_eq!(notice.channel_id, "R1");
        assert_eq!(service.connection_state("R1"), Some(ConnectionState::Connected));
        service
            .wait_connected("R1", Duration::from_millis(50))
            .await
            .expect("connected");

        assert!(service.stop("R1").await);
        assert!(!service.stop("R1").await);
        while let Ok(envelope) = outbound.try_recv() {
            assert_ne!(envelope.kind, SignalKind::ConnectAck, "announced twice");
        }
    }

    #[tokio::test]
    async fn play_on_unknown_channel_is_an_error() {
        let (bot, _relay_side) = LocalRelay::pair();
        let service =
            StreamService::new(publisher(), MediaConfig::localhost(), Arc::new(bot)).expect("service");
        let err = service
            .play("missing", Path::new("audio/ncc8.ogg"))
            .await
            .expect_err("no session");
        assert!(matches!(err, SessionError::UnknownChannel(_)));
    }
}
