use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use media_session::{CueSet, MediaConfig, Publisher};
use url::Url;

use crate::checkin::{CheckinSettings, DEFAULT_THRESHOLD};
use crate::relay::RelaySettings;
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Debug, Parser)]
#[command(
    name = "rtc-bot",
    author,
    version,
    about = "Channel bot answering identity-check calls and streaming radio audio"
)]
pub struct Cli {
    /// WebSocket URL of the channel relay.
    #[arg(long, env = "RTC_BOT_RELAY_URL", global = true)]
    pub relay_url: Option<String>,

    /// User id the bot signs envelopes with.
    #[arg(long, env = "RTC_BOT_ID", default_value = "rtc-bot", global = true)]
    pub bot_id: String,

    #[arg(long, env = "RTC_BOT_CLAN_ID", default_value = "", global = true)]
    pub clan_id: String,

    #[arg(long, env = "RTC_BOT_DISPLAY_NAME", global = true)]
    pub display_name: Option<String>,

    /// Accept invalid TLS certificates from the relay and the check-in service.
    #[arg(long, env = "RTC_BOT_INSECURE", default_value_t = false, global = true)]
    pub insecure: bool,

    /// STUN/TURN URLs, comma separated. Defaults to a public STUN server.
    #[arg(long = "ice-url", env = "RTC_BOT_ICE_URLS", value_delimiter = ',', global = true)]
    pub ice_urls: Vec<String>,

    #[arg(long, env = "RTC_BOT_ICE_USERNAME", global = true)]
    pub ice_username: Option<String>,

    #[arg(long, env = "RTC_BOT_ICE_CREDENTIAL", global = true)]
    pub ice_credential: Option<String>,

    /// Sessions not connected within this many seconds are torn down; 0 disables.
    #[arg(long, env = "RTC_BOT_NEGOTIATION_TIMEOUT_SECS", default_value_t = 30, global = true)]
    pub negotiation_timeout_secs: u64,

    #[arg(long, env = "RTC_BOT_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "RTC_BOT_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Answer video calls and verify the caller's face against the check-in service.
    Checkin(CheckinArgs),
    /// Publish prerecorded audio into a channel.
    Radio(RadioArgs),
}

#[derive(Debug, Args)]
pub struct CheckinArgs {
    #[arg(long, env = "RTC_BOT_CHECKIN_URL")]
    pub checkin_url: String,

    /// Value of the account header sent with every check-in request.
    #[arg(long, env = "RTC_BOT_CHECKIN_ACCOUNT")]
    pub checkin_account: String,

    /// Minimum match probability that counts as a successful check-in.
    #[arg(long, env = "RTC_BOT_CHECKIN_THRESHOLD", default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: f64,

    #[arg(long, env = "RTC_BOT_CHECKIN_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Stills sent for verification per call.
    #[arg(long, env = "RTC_BOT_SNAPSHOT_LIMIT", default_value_t = 5)]
    pub snapshot_limit: u32,

    #[arg(long, env = "RTC_BOT_KEYFRAME_INTERVAL_SECS", default_value_t = 3)]
    pub keyframe_interval_secs: u64,

    #[arg(long, env = "RTC_BOT_CUE_ACCEPT", default_value = "audio/hello.ogg")]
    pub cue_accept: PathBuf,

    #[arg(long, env = "RTC_BOT_CUE_EXIT", default_value = "audio/exit-call.ogg")]
    pub cue_exit: PathBuf,

    #[arg(long, env = "RTC_BOT_CUE_SUCCESS", default_value = "audio/checkin-success.ogg")]
    pub cue_success: PathBuf,

    #[arg(long, env = "RTC_BOT_CUE_FAILURE", default_value = "audio/checkin-failed.ogg")]
    pub cue_failure: PathBuf,
}

#[derive(Debug, Args)]
pub struct RadioArgs {
    /// Channel to publish into.
    #[arg(long)]
    pub channel: String,

    /// Play a single file by name from the audio directory.
    #[arg(long, conflicts_with = "prefix")]
    pub file: Option<String>,

    /// Play every `.ogg` file in the audio directory starting with this prefix.
    #[arg(long)]
    pub prefix: Option<String>,

    #[arg(long, env = "RTC_BOT_AUDIO_DIR", default_value = "audio")]
    pub audio_dir: PathBuf,

    /// Seconds to wait for the listener side to connect.
    #[arg(long, env = "RTC_BOT_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioSource {
    File(String),
    Prefix(String),
}

#[derive(Debug, Clone)]
pub struct RadioPlan {
    pub channel_id: String,
    pub source: RadioSource,
    pub audio_dir: PathBuf,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Checkin(CheckinSettings),
    Radio(RadioPlan),
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub relay: RelaySettings,
    pub publisher: Publisher,
    pub media: MediaConfig,
    pub log: LogConfig,
    pub insecure: bool,
    pub mode: Mode,
}

impl BotConfig {
    pub fn bot_id(&self) -> &str {
        &self.publisher.user_id
    }
}

impl TryFrom<Cli> for BotConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let relay_url = cli
            .relay_url
            .as_deref()
            .context("relay URL missing; pass --relay-url or set RTC_BOT_RELAY_URL")?;
        let relay_url =
            Url::parse(relay_url).with_context(|| format!("invalid relay URL: {relay_url}"))?;
        if !matches!(relay_url.scheme(), "ws" | "wss") {
            bail!("relay URL must use ws:// or wss://, got {relay_url}");
        }
        if cli.bot_id.trim().is_empty() {
            bail!("bot id must not be empty");
        }

        let mut media = MediaConfig::builder()
            .negotiation_timeout(Duration::from_secs(cli.negotiation_timeout_secs));
        let ice_urls: Vec<String> = cli
            .ice_urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if !ice_urls.is_empty() {
            media = match (cli.ice_username.clone(), cli.ice_credential.clone()) {
                (Some(username), Some(credential)) => {
                    media.add_ice_server_with_credentials(ice_urls, username, credential)
                }
                (None, None) => media.add_ice_server(ice_urls),
                _ => bail!("ICE username and credential must be given together"),
            };
        }

        let mode = match cli.command {
            Command::Checkin(args) => {
                let endpoint = Url::parse(&args.checkin_url)
                    .with_context(|| format!("invalid check-in URL: {}", args.checkin_url))?;
                if !(0.0..=1.0).contains(&args.threshold) {
                    bail!("check-in threshold must be within 0..=1, got {}", args.threshold);
                }
                media = media
                    .snapshot_limit(args.snapshot_limit)
                    .keyframe_interval(Duration::from_secs(args.keyframe_interval_secs))
                    .cues(CueSet {
                        accept: args.cue_accept,
                        exit: args.cue_exit,
                        success: args.cue_success,
                        failure: args.cue_failure,
                    });
                Mode::Checkin(CheckinSettings {
                    endpoint,
                    account_id: args.checkin_account,
                    threshold: args.threshold,
                    request_timeout: Duration::from_secs(args.request_timeout_secs),
                })
            }
            Command::Radio(args) => {
                let source = match (args.file, args.prefix) {
                    (Some(file), None) => RadioSource::File(file),
                    (None, Some(prefix)) => RadioSource::Prefix(prefix),
                    _ => bail!("exactly one of --file or --prefix is required"),
                };
                Mode::Radio(RadioPlan {
                    channel_id: args.channel,
                    source,
                    audio_dir: args.audio_dir,
                    connect_timeout: Duration::from_secs(args.connect_timeout_secs),
                })
            }
        };

        let media = media.build().context("invalid media settings")?;
        let mut relay = RelaySettings::new(relay_url);
        relay.accept_invalid_certs = cli.insecure;

        Ok(BotConfig {
            relay,
            publisher: Publisher {
                user_id: cli.bot_id,
                clan_id: cli.clan_id,
                display_name: cli.display_name,
            },
            media,
            log: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
            insecure: cli.insecure,
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<BotConfig> {
        let cli = Cli::try_parse_from(std::iter::once("rtc-bot").chain(args.iter().copied()))?;
        BotConfig::try_from(cli)
    }

    const RELAY: &str = "--relay-url=wss://relay.example/ws";

    #[test]
    fn checkin_defaults() {
        let config = parse(&[
            RELAY,
            "checkin",
            "--checkin-url=https://checkin.example/verify",
            "--checkin-account=acc",
        ])
        .expect("config");
        assert_eq!(config.bot_id(), "rtc-bot");
        assert_eq!(config.media.snapshot_limit, 5);
        assert_eq!(config.media.keyframe_interval, Duration::from_secs(3));
        assert_eq!(config.media.negotiation_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.media.cues, CueSet::default());
        assert_eq!(config.log.level, LogLevel::Info);
        let Mode::Checkin(settings) = config.mode else {
            panic!("expected checkin mode");
        };
        assert_eq!(settings.threshold, DEFAULT_THRESHOLD);
        assert_eq!(settings.account_id, "acc");
    }

    #[test]
    fn radio_requires_one_source() {
        assert!(parse(&[RELAY, "radio", "--channel=R1"]).is_err());
        assert!(parse(&[RELAY, "radio", "--channel=R1", "--file=a", "--prefix=b"]).is_err());

        let config = parse(&[RELAY, "radio", "--channel=R1", "--prefix=ncc8"]).expect("config");
        let Mode::Radio(plan) = config.mode else {
            panic!("expected radio mode");
        };
        assert_eq!(plan.source, RadioSource::Prefix("ncc8".into()));
        assert_eq!(plan.audio_dir, PathBuf::from("audio"));
    }

    #[test]
    fn zero_negotiation_timeout_disables_watchdog() {
        let config = parse(&[
            RELAY,
            "--negotiation-timeout-secs=0",
            "radio",
            "--channel=R1",
            "--file=news",
        ])
        .expect("config");
        assert_eq!(config.media.negotiation_timeout, None);
    }

    #[test]
    fn ice_servers_and_credentials() {
        let config = parse(&[
            RELAY,
            "--ice-url=turn:turn.example:3478,stun:stun.example:3478",
            "--ice-username=u",
            "--ice-credential=p",
            "radio",
            "--channel=R1",
            "--file=news",
        ])
        .expect("config");
        assert_eq!(config.media.ice_servers.len(), 1);
        assert_eq!(config.media.ice_servers[0].urls.len(), 2);
        assert_eq!(config.media.ice_servers[0].username, "u");

        let half = parse(&[RELAY, "--ice-url=turn:x", "--ice-username=u", "radio", "--channel=R1", "--file=a"]);
        assert!(half.is_err());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(parse(&["--relay-url=http://relay", "radio", "--channel=R1", "--file=a"]).is_err());
        assert!(
            parse(&[
                RELAY,
                "checkin",
                "--checkin-url=https://c.example",
                "--checkin-account=a",
                "--threshold=1.5",
            ])
            .is_err()
        );
        assert!(
            parse(&[
                RELAY,
                "checkin",
                "--checkin-url=https://c.example",
                "--checkin-account=a",
                "--snapshot-limit=0",
            ])
            .is_err()
        );
    }
}
