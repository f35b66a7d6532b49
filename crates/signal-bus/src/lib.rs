use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Signaling message types carried over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    SdpOffer,
    SdpAnswer,
    IceCandidate,
    /// Publisher-connected notification.
    ConnectAck,
    Quit,
    /// Push-to-talk notice sent by a stream publisher once acknowledged.
    Ptt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub channel_id: String,
    #[serde(default)]
    pub clan_id: String,
    #[serde(default)]
    pub caller_id: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: SignalKind, channel_id: impl Into<String>) -> Self {
        Self {
            kind,
            channel_id: channel_id.into(),
            clan_id: String::new(),
            caller_id: String::new(),
            receiver_id: String::new(),
            display_name: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_route(
        mut self,
        clan_id: impl Into<String>,
        caller_id: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Self {
        self.clan_id = clan_id.into();
        self.caller_id = caller_id.into();
        self.receiver_id = receiver_id.into();
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Builds a reply on the same channel, addressed from `sender` back to
    /// whoever sent this envelope.
    pub fn reply(&self, kind: SignalKind, sender: &str) -> Self {
        Self {
            kind,
            channel_id: self.channel_id.clone(),
            clan_id: self.clan_id.clone(),
            caller_id: sender.to_string(),
            receiver_id: self.caller_id.clone(),
            display_name: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Payload of a `connect-ack` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectNotice {
    pub channel_id: String,
}

/// Payload of a `ptt` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkNotice {
    pub channel_id: String,
    pub is_talk: bool,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    Closed,
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Bidirectional signaling relay. Outbound envelopes go through `send`,
/// inbound ones are delivered to every subscriber.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn send(&self, envelope: Envelope) -> RelayResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// In-memory relay end. Created in connected pairs for tests and in-process use.
#[derive(Debug)]
pub struct LocalRelay {
    inbound: broadcast::Sender<Envelope>,
    outbound: broadcast::Sender<Envelope>,
}

impl LocalRelay {
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(256)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (left, _) = broadcast::channel(capacity);
        let (right, _) = broadcast::channel(capacity);
        (
            Self {
                inbound: left.clone(),
                outbound: right.clone(),
            },
            Self {
                inbound: right,
                outbound: left,
            },
        )
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn send(&self, envelope: Envelope) -> RelayResult<()> {
        tracing::trace!(kind = ?envelope.kind, channel_id = %envelope.channel_id, "local relay send");
        self.outbound
            .send(envelope)
            .map(|_| ())
            .map_err(|_| RelayError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_relay_pair_round_trip() {
        let (bot, peer) = LocalRelay::pair();
        let mut bot_rx = bot.subscribe();
        let mut peer_rx = peer.subscribe();

        let offer = Envelope::new(SignalKind::SdpOffer, "C1")
            .with_route("clan", "human", "bot")
            .with_payload(&serde_json::json!({"type": "offer", "sdp": "v=0"}))
            .expect("payload");
        peer.send(offer.clone()).await.expect("send ok");
        assert_eq!(bot_rx.recv().await.expect("bot receives"), offer);

        let answer = offer.reply(SignalKind::SdpAnswer, "bot");
        bot.send(answer).await.expect("reply ok");
        let received = peer_rx.recv().await.expect("peer receives");
        assert_eq!(received.kind, SignalKind::SdpAnswer);
        assert_eq!(received.caller_id, "bot");
        assert_eq!(received.receiver_id, "human");
        assert_eq!(received.channel_id, "C1");
    }

    #[tokio::test]
    async fn send_without_listener_reports_closed() {
        let (bot, _peer) = LocalRelay::pair();
        let err = bot
            .send(Envelope::new(SignalKind::Quit, "C1"))
            .await
            .expect_err("nobody subscribed");
        assert!(matches!(err, RelayError::Closed));
    }

    #[test]
    fn wire_form_uses_kebab_types_and_camel_fields() {
        let envelope = Envelope::new(SignalKind::ConnectAck, "C9")
            .with_route("clan-1", "bot", "relay")
            .with_payload(&serde_json::json!({"channelId": "C9"}))
            .expect("payload");
        let text = envelope.to_text().expect("encode");
        assert!(text.contains("\"type\":\"connect-ack\""));
        assert!(text.contains("\"channelId\":\"C9\""));
        assert!(text.contains("\"receiverId\":\"relay\""));
        assert!(!text.contains("displayName"));

        let decoded = Envelope::from_text(
            r#"{"type":"quit","channelId":"C9","callerId":"human","receiverId":"bot"}"#,
        )
        .expect("decode");
        assert_eq!(decoded.kind, SignalKind::Quit);
        assert!(decoded.payload.is_null());
        assert!(decoded.clan_id.is_empty());
    }
}
