//! Paced playback of Opus-in-Ogg resources onto an outbound audio track.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};
use webrtc::media::Sample;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::PagerError;

pub const OPUS_SAMPLE_RATE: u64 = 48_000;

/// One container page: an encoded payload and its cumulative sample position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub payload: Bytes,
    pub granule: u64,
}

pub trait PageSource: Send {
    /// Returns `Ok(None)` at end of stream.
    fn next_page(&mut self) -> Result<Option<Page>, PagerError>;
}

#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write(&self, sample: &Sample) -> Result<(), PagerError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub samples: usize,
    pub duration: Duration,
}

/// Duration covered by a page, from the previous page's granule to its own.
pub fn granule_duration(previous: u64, current: u64) -> Duration {
    let delta = current.saturating_sub(previous);
    Duration::from_nanos(delta.saturating_mul(1_000_000_000) / OPUS_SAMPLE_RATE)
}

/// Emits every page as one timed sample. Each write is followed by a wait
/// until the running deadline, advanced by that page's own duration.
pub async fn play<S, K>(source: &mut S, sink: &K) -> Result<PlaybackStats, PagerError>
where
    S: PageSource + ?Sized,
    K: SampleSink + ?Sized,
{
    let mut stats = PlaybackStats::default();
    let mut last_granule = 0;
    let mut deadline = Instant::now();

    while let Some(page) = source.next_page()? {
        let duration = granule_duration(last_granule, page.granule);
        last_granule = page.granule;

        sink.write(&Sample {
            data: page.payload,
            duration,
            ..Default::default()
        })
        .await?;
        stats.samples += 1;
        stats.duration += duration;

        if !duration.is_zero() {
            deadline += duration;
            tokio::time::sleep_until(deadline).await;
        }
    }

    trace!(samples = stats.samples, duration = ?stats.duration, "playback finished");
    Ok(stats)
}

pub async fn play_file<K>(path: &Path, sink: &K) -> Result<PlaybackStats, PagerError>
where
    K: SampleSink + ?Sized,
{
    debug!(path = %path.display(), "playing audio resource");
    let mut pages = OggPages::open(path).await?;
    play(&mut pages, sink).await
}

/// Pages of an Ogg stream. The identification header is consumed on open.
pub struct OggPages<R: Read> {
    reader: OggReader<R>,
}

impl OggPages<Cursor<Vec<u8>>> {
    pub async fn open(path: &Path) -> Result<Self, PagerError> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_reader(Cursor::new(bytes))
    }
}

impl<R: Read> OggPages<R> {
    pub fn from_reader(reader: R) -> Result<Self, PagerError> {
        let (reader, _header) =
            OggReader::new(reader, false).map_err(|err| PagerError::Container(err.to_string()))?;
        Ok(Self { reader })
    }
}

impl<R: Read + Send> PageSource for OggPages<R> {
    fn next_page(&mut self) -> Result<Option<Page>, PagerError> {
        match self.reader.parse_next_page() {
            Ok((payload, header)) => Ok(Some(Page {
                payload: payload.freeze(),
                granule: header.granule_position,
            })),
            Err(err) if is_end_of_stream(&err) => Ok(None),
            Err(err) => Err(PagerError::Container(err.to_string())),
        }
    }
}

fn is_end_of_stream(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::UnexpectedEof;
        }
        current = err.source();
    }
    false
}

#[async_trait]
impl SampleSink for TrackLocalStaticSample {
    async fn write(&self, sample: &Sample) -> Result<(), PagerError> {
        self.write_sample(sample)
            .await
            .map_err(|err| PagerError::Write(err.to_string()))
    }
}

/// Track sink that refuses writes once its peer connection is gone or closed.
pub struct GuardedTrack {
    track: Arc<TrackLocalStaticSample>,
    peer: Weak<RTCPeerConnection>,
}

impl GuardedTrack {
    pub fn new(track: Arc<TrackLocalStaticSample>, peer: &Arc<RTCPeerConnection>) -> Self {
        Self {
            track,
            peer: Arc::downgrade(peer),
        }
    }
}

#[async_trait]
impl SampleSink for GuardedTrack {
    async fn write(&self, sample: &Sample) -> Result<(), PagerError> {
        let open = self
            .peer
            .upgrade()
            .is_some_and(|peer| peer.connection_state() != RTCPeerConnectionState::Closed);
        if !open {
            return Err(PagerError::PeerClosed);
        }
        SampleSink::write(self.track.as_ref(), sample).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedPages(VecDeque<Result<Page, PagerError>>);

    impl ScriptedPages {
        fn with_granules(granules: &[u64]) -> Self {
            Self(
                granules
                    .iter()
                    .map(|granule| {
                        Ok(Page {
                            payload: Bytes::from_static(b"opus"),
                            granule: *granule,
                        })
                    })
                    .collect(),
            )
        }
    }

    impl PageSource for ScriptedPages {
        fn next_page(&mut self) -> Result<Option<Page>, PagerError> {
            self.0.pop_front().transpose()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<Vec<(Duration, Instant)>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl SampleSink for RecordingSink {
        async fn write(&self, sample: &Sample) -> Result<(), PagerError> {
            let mut written = self.written.lock();
            if self.fail_after.is_some_and(|limit| written.len() >= limit) {
                return Err(PagerError::Write("track gone".into()));
            }
            written.push((sample.duration, Instant::now()));
            Ok(())
        }
    }

    #[test]
    fn granule_delta_converts_at_48khz() {
        assert_eq!(granule_duration(0, 960), Duration::from_millis(20));
        assert_eq!(granule_duration(960, 2880), Duration::from_millis(40));
        assert_eq!(granule_duration(2880, 960), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_one_sample_per_page_and_durations_sum_to_last_granule() {
        let granules = [0, 960, 1920, 3840, 4320, 5280];
        let mut pages = ScriptedPages::with_granules(&granules);
        let sink = RecordingSink::default();
        let started = Instant::now();

        let stats = play(&mut pages, &sink).await.expect("playback succeeds");

        let last = *granules.last().unwrap();
        let expected = Duration::from_nanos(last * 1_000_000_000 / OPUS_SAMPLE_RATE);
        let written = sink.written.lock();
        assert_eq!(stats.samples, granules.len());
        assert_eq!(written.len(), granules.len());
        assert_eq!(written.iter().map(|(d, _)| *d).sum::<Duration>(), expected);
        assert_eq!(stats.duration, expected);
        assert_eq!(started.elapsed(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_follows_each_page_duration() {
        let mut pages = ScriptedPages::with_granules(&[0, 960, 2880, 3360]);
        let sink = RecordingSink::default();
        let started = Instant::now();

        play(&mut pages, &sink).await.expect("playback succeeds");

        let offsets: Vec<Duration> = sink
            .written
            .lock()
            .iter()
            .map(|(_, at)| at.duration_since(started))
            .collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_millis(20),
                Duration::from_millis(60),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_aborts_playback() {
        let mut pages = ScriptedPages::with_granules(&[0, 960, 1920, 2880]);
        let sink = RecordingSink {
            fail_after: Some(2),
            ..Default::default()
        };

        let err = play(&mut pages, &sink).await.expect_err("third write fails");
        assert!(matches!(err, PagerError::Write(_)));
        assert_eq!(sink.written.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_aborts_playback() {
        let mut pages = ScriptedPages(VecDeque::from(vec![
            Ok(Page {
                payload: Bytes::from_static(b"a"),
                granule: 960,
            }),
            Err(PagerError::Container("bad capture pattern".into())),
        ]));
        let sink = RecordingSink::default();

        let err = play(&mut pages, &sink).await.expect_err("corrupt page");
        assert!(matches!(err, PagerError::Container(_)));
        assert_eq!(sink.written.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ogg_pages_stop_cleanly_at_end_of_stream() {
        let mut pages = OggPages::from_reader(Cursor::new(fixture::opus_stream())).expect("valid id header");
        let sink = RecordingSink::default();
        let stats = play(&mut pages, &sink).await.expect("clean end of stream");

        assert_eq!(stats.samples, 3);
        assert_eq!(stats.duration, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn missing_resource_is_an_io_error() {
        let sink = RecordingSink::default();
        let err = play_file(Path::new("/nonexistent/cue.ogg"), &sink)
            .await
            .expect_err("no such file");
        assert!(matches!(err, PagerError::Io(_)));
    }
}

/// Opus-in-Ogg stream that plays for 40 ms.
#[cfg(test)]
pub(crate) mod fixture {
    fn ogg_page(header_type: u8, granule: u64, sequence: u32, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() < 255);
        let mut page = Vec::new();
        page.extend_from_slice(b"OggS");
        page.push(0);
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&0x5eed_u32.to_le_bytes());
        page.extend_from_slice(&sequence.to_le_bytes());
        page.extend_from_slice(&0_u32.to_le_bytes());
        page.push(1);
        page.push(payload.len() as u8);
        page.extend_from_slice(payload);
        page
    }

    fn opus_head() -> Vec<u8> {
        let mut head = Vec::new();
        head.extend_from_slice(b"OpusHead");
        head.push(1);
        head.push(2);
        head.extend_from_slice(&312_u16.to_le_bytes());
        head.extend_from_slice(&48_000_u32.to_le_bytes());
        head.extend_from_slice(&0_u16.to_le_bytes());
        head.push(0);
        head
    }

    pub(crate) fn opus_stream() -> Vec<u8> {
        let mut stream = ogg_page(0x02, 0, 0, &opus_head());
        stream.extend(ogg_page(0x00, 0, 1, b"OpusTags"));
        stream.extend(ogg_page(0x00, 960, 2, &[0xfc, 0xff, 0xfe]));
        stream.extend(ogg_page(0x04, 1920, 3, &[0xfc, 0xff, 0xfe]));
        stream
    }
}
