//! Per-channel media sessions negotiated over a signaling relay: inbound
//! identity-check calls and outbound radio streams.

pub mod adapter;
pub mod call;
pub mod config;
pub mod error;
pub mod pager;
pub mod peer;
pub mod queue;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod stream;
pub mod verify;

pub use adapter::{EnvelopeHandler, run_signaling, spawn_signaling};
pub use call::{CallService, CallSession};
pub use config::{CueSet, MediaConfig, MediaConfigBuilder};
pub use error::{ConfigError, PagerError, SessionError, SnapshotError, VerifyError};
pub use pager::{PlaybackStats, play, play_file};
pub use queue::{DropPolicy, LossyQueue, PushOutcome};
pub use registry::SessionRegistry;
pub use snapshot::{SnapshotOutcome, SnapshotPipeline};
pub use state::{ConnectionState, Cue};
pub use stream::{Publisher, StreamService, StreamSession};
pub use verify::{IdentityVerifier, Verification};
