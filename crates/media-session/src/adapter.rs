//! Feeds inbound relay envelopes into a session service, one at a time.

use std::sync::Arc;

use async_trait::async_trait;
use signal_bus::{Envelope, Relay};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::call::CallService;
use crate::error::SessionError;
use crate::stream::StreamService;

#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle_envelope(&self, envelope: Envelope) -> Result<(), SessionError>;
}

#[async_trait]
impl EnvelopeHandler for CallService {
    async fn handle_envelope(&self, envelope: Envelope) -> Result<(), SessionError> {
        CallService::handle_envelope(self, envelope).await
    }
}

#[async_trait]
impl EnvelopeHandler for StreamService {
    async fn handle_envelope(&self, envelope: Envelope) -> Result<(), SessionError> {
        StreamService::handle_envelope(self, envelope).await
    }
}

/// Processes envelopes in arrival order until the relay closes. A failing
/// envelope is logged and dropped; it never stops the loop.
pub async fn run_signaling<H>(mut inbound: broadcast::Receiver<Envelope>, handler: &H)
where
    H: EnvelopeHandler + ?Sized,
{
    loop {
        match inbound.recv().await {
            Ok(envelope) => {
                let kind = envelope.kind;
                let channel_id = envelope.channel_id.clone();
                if let Err(err) = handler.handle_envelope(envelope).await {
                    warn!(?kind, %channel_id, error = %err, "dropping signaling envelope");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "signaling receiver lagged; envelopes lost");
            }
            Err(RecvError::Closed) => {
                debug!("signaling relay closed");
                break;
            }
        }
    }
}

/// Subscribes to `relay` immediately and processes its envelopes on a task.
pub fn spawn_signaling<H>(relay: &dyn Relay, handler: Arc<H>) -> JoinHandle<()>
where
    H: EnvelopeHandler + ?Sized + 'static,
{
    let inbound = relay.subscribe();
    tokio::spawn(async move { run_signaling(inbound, handler.as_ref()).await })
}
