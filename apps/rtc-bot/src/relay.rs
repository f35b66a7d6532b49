//! WebSocket client for the channel relay. Envelopes travel as JSON text
//! frames; the connection is re-established with exponential backoff and
//! outbound envelopes wait in the queue while it is down.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use signal_bus::{Envelope, Relay, RelayError, RelayResult};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info, trace, warn};
use url::Url;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
const INBOUND_CAPACITY: usize = 512;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub url: Url,
    /// Skip certificate validation on `wss://` relays.
    pub accept_invalid_certs: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RelaySettings {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            accept_invalid_certs: false,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// Doubling reconnect delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial.min(max),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}

/// Relay end backed by a reconnecting WebSocket.
pub struct WsRelay {
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: broadcast::Sender<Envelope>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl WsRelay {
    /// Starts the connection loop. Returns immediately; envelopes sent
    /// before the first connection are queued.
    pub fn start(settings: RelaySettings) -> Result<Self, RelayError> {
        let connector = tls_connector(&settings)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);
        let task = tokio::spawn(run(settings, connector, outbound_rx, inbound.clone(), connected_tx));
        Ok(Self {
            outbound,
            inbound,
            connected,
            task,
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Waits until the socket is up.
    pub async fn wait_connected(&self, limit: Duration) -> RelayResult<()> {
        let mut connected = self.connected.clone();
        match tokio::time::timeout(limit, connected.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => Err(RelayError::Transport("relay did not connect in time".into())),
        }
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn send(&self, envelope: Envelope) -> RelayResult<()> {
        if self.task.is_finished() {
            return Err(RelayError::Closed);
        }
        self.outbound.send(envelope).map_err(|_| RelayError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }
}

fn tls_connector(settings: &RelaySettings) -> Result<Option<Connector>, RelayError> {
    if !settings.accept_invalid_certs {
        return Ok(None);
    }
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|err| RelayError::Transport(format!("tls connector: {err}")))?;
    Ok(Some(Connector::NativeTls(connector)))
}

enum SessionEnd {
    /// Socket dropped; reconnect.
    Lost,
    /// Every sender is gone; stop.
    Finished,
}

async fn run(
    settings: RelaySettings,
    connector: Option<Connector>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    inbound: broadcast::Sender<Envelope>,
    connected: watch::Sender<bool>,
) {
    let mut backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);
    // A frame taken off the queue but not yet written survives reconnects.
    let mut pending: Option<String> = None;

    loop {
        match connect_async_tls_with_config(settings.url.as_str(), None, false, connector.clone()).await {
            Ok((socket, _)) => {
                info!(url = %settings.url, "relay connected");
                backoff.reset();
                connected.send_replace(true);
                let end = session(socket, &mut outbound, &mut pending, &inbound).await;
                connected.send_replace(false);
                if matches!(end, SessionEnd::Finished) {
                    debug!("relay senders dropped, stopping");
                    return;
                }
            }
            Err(err) => {
                warn!(url = %settings.url, error = %err, "relay connect failed");
            }
        }
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "relay reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn session(
    socket: Socket,
    outbound: &mut mpsc::UnboundedReceiver<Envelope>,
    pending: &mut Option<String>,
    inbound: &broadcast::Sender<Envelope>,
) -> SessionEnd {
    let (mut write, mut read) = socket.split();

    if let Some(text) = pending.take() {
        if let Err(err) = write.send(Message::Text(text.clone())).await {
            warn!(error = %err, "relay resend failed");
            *pending = Some(text);
            return SessionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Finished;
                };
                let text = match envelope.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(kind = ?envelope.kind, error = %err, "dropping unencodable envelope");
                        continue;
                    }
                };
                trace!(kind = ?envelope.kind, channel_id = %envelope.channel_id, "relay send");
                if let Err(err) = write.send(Message::Text(text.clone())).await {
                    warn!(error = %err, "relay write failed");
                    *pending = Some(text);
                    return SessionEnd::Lost;
                }
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("relay closed the connection");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        match err {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                debug!("relay socket closed: {err}")
                            }
                            _ => warn!("relay socket error: {err}"),
                        }
                        return SessionEnd::Lost;
                    }
                };
                match Envelope::from_text(&text) {
                    Ok(envelope) => {
                        trace!(kind = ?envelope.kind, channel_id = %envelope.channel_id, "relay receive");
                        let _ = inbound.send(envelope);
                    }
                    Err(err) => warn!(error = %err, len = text.len(), "skipping unparseable relay frame"),
                }
            }
        }
    }
}
