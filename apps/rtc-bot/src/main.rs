use anyhow::Result;
use clap::Parser;
use rtc_bot::config::{BotConfig, Cli, Mode};
use rtc_bot::{app, telemetry};
use tracing::info;
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = BotConfig::try_from(cli)?;
    telemetry::init(&config.log)?;

    let mode = match &config.mode {
        Mode::Checkin(_) => "checkin",
        Mode::Radio(_) => "radio",
    };
    info!(
        mode,
        relay = %config.relay.url,
        bot_id = %config.bot_id(),
        log_level = %LevelFilter::from(config.log.level),
        "starting rtc-bot"
    );

    app::run(config).await
}
