//! Turns inbound VP8 RTP into still images and runs the bounded verification
//! challenge over them.

use std::sync::Arc;

use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, info, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;

use crate::error::SnapshotError;
use crate::queue::LossyQueue;
use crate::verify::{IdentityVerifier, Verification};

const MAX_LATE_PACKETS: u16 = 20;
const VIDEO_CLOCK_RATE: u32 = 90_000;
const JPEG_QUALITY: u8 = 85;

pub trait KeyframeDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<DynamicImage, SnapshotError>;
}

/// Produces a fresh decoder; one is made after every attempt.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn KeyframeDecoder> + Send + Sync>;

pub fn vp8_decoder_factory() -> DecoderFactory {
    Arc::new(|| Box::new(Vp8StillDecoder) as Box<dyn KeyframeDecoder>)
}

/// Decodes a VP8 keyframe by wrapping it as a lossy WebP still.
#[derive(Debug, Default)]
pub struct Vp8StillDecoder;

impl KeyframeDecoder for Vp8StillDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<DynamicImage, SnapshotError> {
        image::load_from_memory_with_format(&wrap_webp(frame), ImageFormat::WebP)
            .map_err(|err| SnapshotError::Decode(err.to_string()))
    }
}

fn wrap_webp(frame: &[u8]) -> Vec<u8> {
    let padding = frame.len() & 1;
    let riff_len = 4 + 8 + frame.len() + padding;
    let mut out = Vec::with_capacity(8 + riff_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(riff_len as u32).to_le_bytes());
    out.extend_from_slice(b"WEBP");
    out.extend_from_slice(b"VP8 ");
    out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    out.extend_from_slice(frame);
    if padding == 1 {
        out.push(0);
    }
    out
}

/// VP8 frame tag: bit 0 clear marks a keyframe.
pub fn is_keyframe(frame: &[u8]) -> bool {
    frame.first().is_some_and(|tag| tag & 0x01 == 0)
}

/// JPEG-encodes a still and returns it base64 encoded.
pub fn encode_still(image: &DynamicImage) -> Result<String, SnapshotError> {
    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Verified { attempts: u32 },
    Rejected { attempts: u32, reason: String },
    /// The attempt limit was reached without a verdict.
    Exhausted { attempts: u32 },
    /// The packet queue closed underneath the pipeline.
    Interrupted { attempts: u32 },
}

pub struct SnapshotPipeline {
    channel_id: String,
    builder: SampleBuilder<Vp8Packet>,
    decoder: Box<dyn KeyframeDecoder>,
    decoders: DecoderFactory,
    verifier: Arc<dyn IdentityVerifier>,
    limit: u32,
    attempts: u32,
}

impl SnapshotPipeline {
    pub fn new(
        channel_id: impl Into<String>,
        limit: u32,
        verifier: Arc<dyn IdentityVerifier>,
        decoders: DecoderFactory,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            builder: new_builder(),
            decoder: decoders(),
            decoders,
            verifier,
            limit,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Consumes packets until the challenge finishes or the queue closes.
    pub async fn run(&mut self, packets: &LossyQueue<Packet>) -> Result<SnapshotOutcome, SnapshotError> {
        while let Some(packet) = packets.pop().await {
            self.builder.push(packet);
            while let Some(sample) = self.builder.pop() {
                if let Some(outcome) = self.on_frame(&sample.data).await? {
                    return Ok(outcome);
                }
            }
        }
        Ok(SnapshotOutcome::Interrupted {
            attempts: self.attempts,
        })
    }

    /// Handles one reassembled frame. `Some` ends the challenge.
    pub async fn on_frame(&mut self, frame: &[u8]) -> Result<Option<SnapshotOutcome>, SnapshotError> {
        if !is_keyframe(frame) {
            return Ok(None);
        }
        if self.attempts >= self.limit {
            info!(channel_id = %self.channel_id, attempts = self.attempts, "snapshot limit reached");
            return Ok(Some(SnapshotOutcome::Exhausted {
                attempts: self.attempts,
            }));
        }

        let decoded = self.decoder.decode(frame);
        self.reset();
        let still = match encode_still(&decoded?) {
            Ok(still) => still,
            Err(err) => {
                warn!(channel_id = %self.channel_id, error = %err, "skipping keyframe");
                return Ok(None);
            }
        };

        self.attempts += 1;
        let attempt = self.attempts;
        debug!(channel_id = %self.channel_id, attempt, "submitting still");
        match self.verifier.verify(&still).await {
            Ok(Verification::Verified) => Ok(Some(SnapshotOutcome::Verified { attempts: attempt })),
            Ok(Verification::Rejected(reason)) => Ok(Some(SnapshotOutcome::Rejected {
                attempts: attempt,
                reason,
            })),
            Ok(Verification::Retry) => Ok(None),
            Err(err) => {
                warn!(channel_id = %self.channel_id, attempt, error = %err, "verification failed, retrying");
                Ok(None)
            }
        }
    }

    fn reset(&mut self) {
        self.builder = new_builder();
        self.decoder = (self.decoders)();
    }
}

fn new_builder() -> SampleBuilder<Vp8Packet> {
    SampleBuilder::new(MAX_LATE_PACKETS, Vp8Packet::default(), VIDEO_CLOCK_RATE)
}
