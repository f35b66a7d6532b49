use std::path::{Path, PathBuf};
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::ConfigError;
use crate::queue::DropPolicy;
use crate::state::Cue;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_PACKET_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_SNAPSHOT_LIMIT: u32 = 5;

/// Audio files played to the remote party at each outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueSet {
    pub accept: PathBuf,
    pub exit: PathBuf,
    pub success: PathBuf,
    pub failure: PathBuf,
}

impl Default for CueSet {
    fn default() -> Self {
        Self {
            accept: PathBuf::from("audio/hello.ogg"),
            exit: PathBuf::from("audio/exit-call.ogg"),
            success: PathBuf::from("audio/checkin-success.ogg"),
            failure: PathBuf::from("audio/checkin-failed.ogg"),
        }
    }
}

impl CueSet {
    pub fn path(&self, cue: Cue) -> &Path {
        match cue {
            Cue::Accept => &self.accept,
            Cue::Exit => &self.exit,
            Cue::Success => &self.success,
            Cue::Failure => &self.failure,
        }
    }
}

/// Configuration shared by call and stream sessions
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Sessions that have not connected within this window are torn down.
    /// `None` disables the watchdog.
    pub negotiation_timeout: Option<Duration>,
    /// Cadence of keyframe requests sent to a video caller
    pub keyframe_interval: Duration,
    pub packet_queue_capacity: usize,
    pub drop_policy: DropPolicy,
    /// Maximum number of stills handed to the verifier per call
    pub snapshot_limit: u32,
    pub cues: CueSet,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            keyframe_interval: DEFAULT_KEYFRAME_INTERVAL,
            packet_queue_capacity: DEFAULT_PACKET_QUEUE_CAPACITY,
            drop_policy: DropPolicy::default(),
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            cues: CueSet::default(),
        }
    }
}

impl MediaConfig {
    pub fn builder() -> MediaConfigBuilder {
        MediaConfigBuilder::default()
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }
}

/// Builder for [`MediaConfig`]
#[derive(Debug, Default)]
pub struct MediaConfigBuilder {
    ice_servers: Vec<RTCIceServer>,
    negotiation_timeout: Option<Option<Duration>>,
    keyframe_interval: Option<Duration>,
    packet_queue_capacity: Option<usize>,
    drop_policy: Option<DropPolicy>,
    snapshot_limit: Option<u32>,
    cues: Option<CueSet>,
}

impl MediaConfigBuilder {
    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    /// A zero duration disables the watchdog.
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some((!timeout.is_zero()).then_some(timeout));
        self
    }

    pub fn keyframe_interval(mut self, interval: Duration) -> Self {
        self.keyframe_interval = Some(interval);
        self
    }

    pub fn packet_queue(mut self, capacity: usize, policy: DropPolicy) -> Self {
        self.packet_queue_capacity = Some(capacity);
        self.drop_policy = Some(policy);
        self
    }

    pub fn snapshot_limit(mut self, limit: u32) -> Self {
        self.snapshot_limit = Some(limit);
        self
    }

    pub fn cues(mut self, cues: CueSet) -> Self {
        self.cues = Some(cues);
        self
    }

    pub fn build(self) -> Result<MediaConfig, ConfigError> {
        let defaults = MediaConfig::default();
        let config = MediaConfig {
            // An empty list here means the caller wants the default STUN server.
            ice_servers: if self.ice_servers.is_empty() {
                defaults.ice_servers
            } else {
                self.ice_servers
            },
            negotiation_timeout: self
                .negotiation_timeout
                .unwrap_or(defaults.negotiation_timeout),
            keyframe_interval: self.keyframe_interval.unwrap_or(defaults.keyframe_interval),
            packet_queue_capacity: self
                .packet_queue_capacity
                .unwrap_or(defaults.packet_queue_capacity),
            drop_policy: self.drop_policy.unwrap_or(defaults.drop_policy),
            snapshot_limit: self.snapshot_limit.unwrap_or(defaults.snapshot_limit),
            cues: self.cues.unwrap_or(defaults.cues),
        };
        if config.packet_queue_capacity == 0 {
            return Err(ConfigError("packet queue capacity must be positive"));
        }
        if config.keyframe_interval.is_zero() {
            return Err(ConfigError("keyframe interval must be positive"));
        }
        if config.snapshot_limit == 0 {
            return Err(ConfigError("snapshot limit must be at least 1"));
        }
        Ok(config)
    }
}
