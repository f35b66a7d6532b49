//! Run modes: the check-in call answerer and the radio publisher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use media_session::{CallService, StreamService, spawn_signaling};
use signal_bus::Relay;
use tracing::{info, warn};

use crate::audio::{audio_files, find_audio};
use crate::checkin::{CheckinClient, CheckinSettings};
use crate::config::{BotConfig, Mode, RadioPlan, RadioSource};
use crate::relay::WsRelay;

const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(config: BotConfig) -> Result<()> {
    let relay = Arc::new(WsRelay::start(config.relay.clone()).context("failed to start relay")?);
    relay
        .wait_connected(RELAY_CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("relay {} unreachable", config.relay.url))?;

    match config.mode.clone() {
        Mode::Checkin(settings) => run_checkin(config, settings, relay).await,
        Mode::Radio(plan) => run_radio(config, plan, relay).await,
    }
}

async fn run_checkin(config: BotConfig, settings: CheckinSettings, relay: Arc<WsRelay>) -> Result<()> {
    let verifier =
        CheckinClient::new(settings, config.insecure).context("failed to build check-in client")?;
    let service = Arc::new(
        CallService::new(
            config.bot_id(),
            config.media.clone(),
            Arc::clone(&relay) as Arc<dyn Relay>,
            Arc::new(verifier),
        )
        .context("failed to build call service")?,
    );
    let signaling = spawn_signaling(relay.as_ref(), Arc::clone(&service));
    info!(bot_id = %config.bot_id(), "check-in bot ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
        }
        _ = signaling => warn!("signaling loop ended"),
    }
    service.shutdown().await;
    relay.close();
    Ok(())
}

/// Files to stream for a radio plan, in play order.
pub fn playlist(plan: &RadioPlan) -> Result<Vec<PathBuf>> {
    match &plan.source {
        RadioSource::File(name) => Ok(vec![find_audio(&plan.audio_dir, name)?]),
        RadioSource::Prefix(prefix) => {
            let files = audio_files(&plan.audio_dir, prefix)?;
            if files.is_empty() {
                bail!("no audio in {} starting with {prefix:?}", plan.audio_dir.display());
            }
            Ok(files.into_iter().map(|name| plan.audio_dir.join(name)).collect())
        }
    }
}

async fn run_radio(config: BotConfig, plan: RadioPlan, relay: Arc<WsRelay>) -> Result<()> {
    let files = playlist(&plan)?;
    let service = Arc::new(
        StreamService::new(
            config.publisher.clone(),
            config.media.clone(),
            Arc::clone(&relay) as Arc<dyn Relay>,
        )
        .context("failed to build stream service")?,
    );
    let signaling = spawn_signaling(relay.as_ref(), Arc::clone(&service));

    let channel = plan.channel_id.as_str();
    let streamed = async {
        service.start(channel).await?;
        service.wait_connected(channel, plan.connect_timeout).await?;
        for path in &files {
            let stats = service.play(channel, path).await?;
            info!(
                channel_id = channel,
                path = %path.display(),
                samples = stats.samples,
                duration_ms = stats.duration.as_millis() as u64,
                "finished track"
            );
        }
        anyhow::Ok(())
    };

    let outcome = tokio::select! {
        outcome = streamed => outcome,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            Ok(())
        }
    };

    service.stop(channel).await;
    signaling.abort();
    relay.close();
    outcome.with_context(|| format!("radio stream on {channel} failed"))
}
