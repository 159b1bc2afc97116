//! Pipeline wiring: the segment assembler that groups encoded frames on
//! keyframe boundaries, and the controller that owns the capture, encode
//! and cadence threads for one broadcast session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::egress::hls::{HlsPublisher, Segment, StreamInfo};
use crate::egress::EgressResult;
use crate::encode::{
    EncodedFrame, EncoderBackend, EncoderConfig, EncoderEvent, KeyframeRequest,
};
use crate::h264::ParameterSets;
use crate::ingress::{frame_channel, FrameSource};
use crate::logsink::LogSink;
use crate::mux::FragmentedMp4Muxer;

pub mod runner;

/// Everything a session needs to run, derived from the settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub video: EncoderConfig,
    /// Wall-clock keyframe/segment cadence.
    pub target_segment_seconds: f64,
    /// Guard against degenerate one-frame segments when keyframes cluster.
    pub min_segment_seconds: f64,
    pub window_size: usize,
    /// Frame-in queue depth before frames get dropped.
    pub frame_queue: usize,
}

impl PipelineConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(self.target_segment_seconds)
    }
}

/// Groups encoded frames into segments on keyframe boundaries and feeds
/// the muxer. Runs exclusively on the pipeline thread; ordering between
/// parameter sets, frames and published segments follows from that.
pub struct SegmentAssembler {
    config: PipelineConfig,
    muxer: FragmentedMp4Muxer,
    publisher: Arc<HlsPublisher>,
    buffer: Vec<EncodedFrame>,
    sequence: u64,
    track_id: Option<u32>,
    dropped_segments: u64,
}

impl SegmentAssembler {
    pub fn new(config: PipelineConfig, publisher: Arc<HlsPublisher>) -> Self {
        Self {
            config,
            muxer: FragmentedMp4Muxer::new(),
            publisher,
            buffer: Vec::new(),
            sequence: 0,
            track_id: None,
            dropped_segments: 0,
        }
    }

    pub fn handle_event(&mut self, event: EncoderEvent) {
        match event {
            EncoderEvent::ParameterSets(params) => self.on_parameter_sets(params),
            EncoderEvent::Frame(frame) => self.on_frame(frame),
            EncoderEvent::Fault(fault) => {
                error!("Encoder fault: {:?}; session is over", fault);
            }
        }
    }

    fn on_parameter_sets(&mut self, params: ParameterSets) {
        match self.track_id {
            None => {
                let track_id = self.muxer.add_video_track(
                    self.config.video.width as u16,
                    self.config.video.height as u16,
                    params.clone(),
                );
                self.track_id = Some(track_id);
                self.publish_init(&params);
            }
            Some(track_id) => {
                // New generation mid-stream: close out the old one, then
                // swap the configuration under the same track.
                self.finalize_segment();
                if let Err(e) = self.muxer.replace_video_parameters(track_id, params.clone()) {
                    error!("Failed to apply new parameter sets: {}", e);
                    return;
                }
                warn!(
                    "Parameter sets changed mid-stream; init segment regenerated without a \
                     discontinuity marker"
                );
                self.publish_init(&params);
            }
        }
    }

    fn publish_init(&mut self, params: &ParameterSets) {
        match self.muxer.init_segment() {
            Ok(bytes) => self.publisher.publish_init(
                bytes,
                StreamInfo {
                    codecs: params.codec_string(),
                    width: self.config.video.width,
                    height: self.config.video.height,
                    frame_rate: self.config.video.frame_rate,
                    bandwidth: self.config.video.bitrate as u64,
                },
            ),
            Err(e) => error!("Failed to build init segment: {}", e),
        }
    }

    fn on_frame(&mut self, frame: EncodedFrame) {
        if frame.is_keyframe && !self.buffer.is_empty() {
            let span = frame
                .presentation_time
                .checked_sub(&self.buffer[0].presentation_time)
                .map(|d| d.as_seconds())
                .unwrap_or(0.0);
            if span >= self.config.min_segment_seconds {
                self.finalize_segment();
            }
        }
        self.buffer.push(frame);
    }

    /// Span of the buffered run including the last frame's duration.
    fn buffered_seconds(&self) -> f64 {
        let (Some(first), Some(last)) = (self.buffer.first(), self.buffer.last()) else {
            return 0.0;
        };
        last.presentation_time
            .checked_sub(&first.presentation_time)
            .map(|d| d.as_seconds())
            .unwrap_or(0.0)
            + last.duration.as_seconds()
    }

    fn finalize_segment(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let sequence = self.sequence;
        self.sequence += 1;

        let base_media_time = self.buffer[0].presentation_time;
        let bytes = match self
            .muxer
            .media_segment(&self.buffer, sequence as u32, base_media_time)
        {
            Ok(bytes) => bytes,
            Err(e) => {
                // A bad sample list is never fatal: drop, count, advance.
                self.dropped_segments += 1;
                warn!(
                    "Dropped segment {} ({} total): {}",
                    sequence, self.dropped_segments, e
                );
                self.buffer.clear();
                return;
            }
        };

        let duration = self.buffered_seconds();
        let sample_count = self.buffer.len();
        if duration.ceil() as u64 > self.publisher.target_duration() {
            self.publisher.bump_target_duration(duration.ceil() as u64);
        }

        let segment = Segment {
            filename: Segment::filename_for(sequence),
            sequence_number: sequence,
            bytes,
            duration_seconds: duration,
            created_at: Utc::now(),
        };
        let size = segment.bytes.len();
        if let EgressResult::Segments { created, evicted } = self.publisher.publish_segment(segment)
        {
            info!(
                "Finished {} [{:.3}s, {:.2} kB, {} samples, {} evicted]",
                created[0].filename,
                duration,
                size as f32 / 1024.0,
                sample_count,
                evicted.len()
            );
        }
        self.buffer.clear();
    }

    /// Drain at end of stream: the last partial segment is published only
    /// if it is a keyframe-led run of at least the minimum length.
    pub fn finish(&mut self) {
        let keyframe_led = self.buffer.first().map(|f| f.is_keyframe).unwrap_or(false);
        if keyframe_led && self.buffered_seconds() >= self.config.min_segment_seconds {
            self.finalize_segment();
        } else if !self.buffer.is_empty() {
            debug!(
                "Discarding {} tail frames ({}s, keyframe_led={})",
                self.buffer.len(),
                self.buffered_seconds(),
                keyframe_led
            );
            self.buffer.clear();
        }
        self.publisher.mark_ended();
    }

    pub fn dropped_segments(&self) -> u64 {
        self.dropped_segments
    }
}

/// Owns the threads of one broadcast session. The encoder, assembler and
/// muxer only ever talk through typed messages; there is no shared
/// mutable state between them beyond the publisher.
pub struct StreamController {
    session_id: Uuid,
    stop: Arc<AtomicBool>,
    publisher: Arc<HlsPublisher>,
    dropped_frames: Arc<AtomicU64>,
    log_sink: Option<Arc<LogSink>>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl StreamController {
    /// Spawn the capture, pipeline and cadence threads. The encoder
    /// backend is built on the pipeline thread so that a setup failure
    /// surfaces as an `EncoderFault::Setup` on the event stream.
    pub fn start<F>(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        backend_factory: F,
        publisher: Arc<HlsPublisher>,
        log_sink: Option<Arc<LogSink>>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn EncoderBackend>> + Send + 'static,
    {
        let session_id = Uuid::new_v4();
        let stop = Arc::new(AtomicBool::new(false));
        let (sink, frames, dropped_frames) = frame_channel(config.frame_queue);

        info!("Starting session {}", session_id);
        if let Some(sink) = &log_sink {
            sink.send("CMD", &format!("NEW_SESSION {}", session_id));
        }

        let keyframe = KeyframeRequest::default();
        let mut threads = Vec::new();

        // Pipeline thread: encoder -> assembler -> publisher.
        let runner_publisher = publisher.clone();
        let runner_config = config.clone();
        let runner_keyframe = keyframe.clone();
        threads.push(std::thread::spawn(move || {
            match runner::PipelineRunner::new(
                runner_config,
                backend_factory,
                runner_publisher,
                frames,
                runner_keyframe,
            ) {
                Ok(mut runner) => runner.run(),
                Err(e) => error!("Failed to start pipeline: {}", e),
            }
        }));

        // Capture thread: drops its sink on exit, which drains the runner.
        let source_stop = stop.clone();
        threads.push(std::thread::spawn(move || {
            if let Err(e) = source.run(sink, source_stop) {
                error!("Frame source failed: {}", e);
            }
        }));

        // Cadence thread: request a keyframe every target interval. The
        // cut itself happens when the keyframe actually arrives.
        let cadence_stop = stop.clone();
        let interval = config.frame_interval();
        threads.push(std::thread::spawn(move || {
            while !cadence_stop.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                keyframe.request();
            }
        }));

        Ok(Self {
            session_id,
            stop,
            publisher,
            dropped_frames,
            log_sink,
            threads,
        })
    }

    pub fn publisher(&self) -> Arc<HlsPublisher> {
        self.publisher.clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Signal every thread, then wait for the pipeline to drain.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads {
            if handle.join().is_err() {
                error!("A session thread panicked during shutdown");
            }
        }
        let dropped = self.dropped_frames.load(Ordering::Relaxed);
        info!(
            "Session {} ended ({} frames dropped at ingest)",
            self.session_id, dropped
        );
        if let Some(sink) = &self.log_sink {
            sink.send("CMD", &format!("END_SESSION {}", self.session_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::to_avcc;
    use crate::mux::validate::inspect_media_segment;
    use crate::time::{MediaTime, VIDEO_TIMESCALE};
    use bytes::Bytes;

    fn assembler(window_size: usize) -> (SegmentAssembler, Arc<HlsPublisher>) {
        let publisher = Arc::new(HlsPublisher::new(window_size, 1.0));
        let config = PipelineConfig {
            video: EncoderConfig {
                width: 960,
                height: 540,
                frame_rate: 15.0,
                bitrate: 2_000_000,
                keyframe_interval: 15,
            },
            target_segment_seconds: 1.0,
            min_segment_seconds: 0.5,
            window_size,
            frame_queue: 8,
        };
        (SegmentAssembler::new(config, publisher.clone()), publisher)
    }

    fn params() -> ParameterSets {
        ParameterSets {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x20, 0xAC, 0xD9]),
            pps: Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
        }
    }

    fn frame(index: i64, key: bool) -> EncodedFrame {
        let nal: &[u8] = if key { &[0x65, 0x88] } else { &[0x41, 0x9A] };
        let pts = MediaTime::new(index * 6_000, VIDEO_TIMESCALE);
        EncodedFrame {
            track_id: 1,
            avcc: to_avcc([nal]),
            presentation_time: pts,
            decode_time: pts,
            duration: MediaTime::new(6_000, VIDEO_TIMESCALE),
            is_keyframe: key,
        }
    }

    #[test]
    fn cuts_on_keyframes_with_min_length_guard() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));

        // 15 frames (1s) then a keyframe: one segment out
        for i in 0..15 {
            assembler.handle_event(EncoderEvent::Frame(frame(i, i == 0)));
        }
        assembler.handle_event(EncoderEvent::Frame(frame(15, true)));
        assert_eq!(publisher.window_filenames(), vec!["segment_0.m4s"]);

        // a keyframe only 2 frames later must NOT cut (0.13s < 0.5s)
        assembler.handle_event(EncoderEvent::Frame(frame(16, false)));
        assembler.handle_event(EncoderEvent::Frame(frame(17, true)));
        assert_eq!(publisher.window_filenames(), vec!["segment_0.m4s"]);
    }

    #[test]
    fn init_precedes_segments_and_codec_matches_sps() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));
        assert!(publisher.init_segment().is_some());
        assert_eq!(publisher.stream_info().unwrap().codecs, "avc1.640020");
    }

    #[test]
    fn segment_bytes_are_valid_media_segments() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));
        for i in 0..15 {
            assembler.handle_event(EncoderEvent::Frame(frame(i, i == 0)));
        }
        assembler.handle_event(EncoderEvent::Frame(frame(15, true)));

        let bytes = publisher.segment("segment_0.m4s").unwrap();
        let report = inspect_media_segment(&bytes).unwrap();
        assert_eq!(report.sample_count, 15);
        assert_eq!(report.base_media_decode_time, 0);
    }

    #[test]
    fn drain_keeps_only_keyframe_led_tails() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));

        // keyframe-led 1s run: published on finish
        for i in 0..15 {
            assembler.handle_event(EncoderEvent::Frame(frame(i, i == 0)));
        }
        assembler.finish();
        assert_eq!(publisher.window_filenames(), vec!["segment_0.m4s"]);
        assert!(publisher.is_ended());
    }

    #[test]
    fn drain_discards_short_tails() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));
        for i in 0..3 {
            assembler.handle_event(EncoderEvent::Frame(frame(i, i == 0)));
        }
        assembler.finish();
        assert!(publisher.window_filenames().is_empty());
        assert!(publisher.is_ended());
    }

    #[test]
    fn long_segment_bumps_target_duration() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));
        // 3 seconds of frames without an intervening keyframe
        for i in 0..45 {
            assembler.handle_event(EncoderEvent::Frame(frame(i, i == 0)));
        }
        assembler.handle_event(EncoderEvent::Frame(frame(45, true)));
        assert_eq!(publisher.target_duration(), 3);
    }

    #[test]
    fn parameter_set_change_flushes_and_republishes_init() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));
        for i in 0..15 {
            assembler.handle_event(EncoderEvent::Frame(frame(i, i == 0)));
        }

        let new_params = ParameterSets {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9]),
            pps: Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
        };
        assembler.handle_event(EncoderEvent::ParameterSets(new_params));

        // the partial buffer was flushed as a segment
        assert_eq!(publisher.window_filenames(), vec!["segment_0.m4s"]);
        // and the rendition now advertises the new profile
        assert_eq!(publisher.stream_info().unwrap().codecs, "avc1.640028");
    }

    #[test]
    fn bad_sample_runs_are_dropped_not_fatal() {
        let (mut assembler, publisher) = assembler(10);
        assembler.handle_event(EncoderEvent::ParameterSets(params()));

        // non-monotone decode times inside one buffered run
        assembler.handle_event(EncoderEvent::Frame(frame(10, true)));
        assembler.handle_event(EncoderEvent::Frame(frame(2, false)));
        for i in 20..36 {
            assembler.handle_event(EncoderEvent::Frame(frame(i, i == 20)));
        }
        // first run was dropped, later segments still flow
        assembler.handle_event(EncoderEvent::Frame(frame(36, true)));
        assert_eq!(assembler.dropped_segments(), 1);
        assert_eq!(publisher.window_filenames(), vec!["segment_1.m4s"]);
    }
}
