//! HLS publishing: the rolling playlist window plus the shared surface the
//! HTTP server reads from.
//!
//! All shared state sits behind one lock, held only long enough to move a
//! segment in or clone a refcounted byte buffer out; response writing
//! happens outside. The invariant this module defends: the set of segment
//! URIs in the playlist text equals the set of segments reachable at
//! media-segment URLs, at every instant.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{error, info, trace, warn};

use crate::egress::{EgressResult, SegmentMeta};

/// One muxed media segment (`moof` + `mdat`).
#[derive(Debug, Clone)]
pub struct Segment {
    pub filename: String,
    pub sequence_number: u64,
    pub bytes: Bytes,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn filename_for(sequence: u64) -> String {
        format!("segment_{}.m4s", sequence)
    }

    fn meta(&self) -> SegmentMeta {
        SegmentMeta {
            filename: self.filename.clone(),
            sequence: self.sequence_number,
            duration: self.duration_seconds,
            size: self.bytes.len(),
        }
    }
}

/// Declared properties of the single rendition, for the master playlist.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub codecs: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub bandwidth: u64,
}

struct PlaylistWindow {
    segments: VecDeque<Segment>,
    window_size: usize,
    /// Sequence number of the segment at the head of the window.
    media_sequence_base: u64,
    target_duration: u64,
    ended: bool,
}

impl PlaylistWindow {
    fn new(window_size: usize, target_duration: u64) -> Self {
        Self {
            segments: VecDeque::new(),
            window_size,
            media_sequence_base: 0,
            target_duration,
            ended: false,
        }
    }

    fn push(&mut self, segment: Segment) -> Vec<Segment> {
        self.segments.push_back(segment);

        let mut evicted = Vec::new();
        while self.segments.len() > self.window_size {
            if let Some(old) = self.segments.pop_front() {
                evicted.push(old);
            }
        }
        // The base is defined by whatever sits at the head, so sequence
        // gaps from dropped segments cannot desynchronize it.
        self.media_sequence_base = self
            .segments
            .front()
            .map(|s| s.sequence_number)
            .unwrap_or(0);
        evicted
    }

    fn segment(&self, filename: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.filename == filename)
    }

    fn filenames(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.filename.clone()).collect()
    }

    fn render(&self, stream_base: &str) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:6\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence_base);
        out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
        let _ = writeln!(out, "#EXT-X-MAP:URI=\"{}/init.mp4\"", stream_base);
        let entries = self
            .segments
            .iter()
            .map(|s| {
                format!(
                    "#EXTINF:{:.3},\n{}/segments/{}",
                    s.duration_seconds, stream_base, s.filename
                )
            })
            .join("\n");
        if !entries.is_empty() {
            out.push_str(&entries);
            out.push('\n');
        }
        if self.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}

struct HlsState {
    window: PlaylistWindow,
    init: Option<Bytes>,
    info: Option<StreamInfo>,
    ended_at: Option<Instant>,
}

/// Shared between the assembler (writer) and the HTTP server (readers).
pub struct HlsPublisher {
    state: RwLock<HlsState>,
}

impl HlsPublisher {
    pub fn new(window_size: usize, target_segment_seconds: f64) -> Self {
        Self {
            state: RwLock::new(HlsState {
                window: PlaylistWindow::new(window_size, target_segment_seconds.ceil() as u64),
                init: None,
                info: None,
                ended_at: None,
            }),
        }
    }

    /// Publish (or republish, on a parameter-set change) the
    /// initialization segment. Must happen before the first media segment.
    pub fn publish_init(&self, bytes: Bytes, info: StreamInfo) {
        let mut state = self.state.write().unwrap();
        info!(
            "Published init segment: {} bytes, {}",
            bytes.len(),
            info.codecs
        );
        state.init = Some(bytes);
        state.info = Some(info);
    }

    pub fn publish_segment(&self, segment: Segment) -> EgressResult {
        let mut state = self.state.write().unwrap();
        if state.init.is_none() {
            error!(
                "Refusing to publish {} before the init segment",
                segment.filename
            );
            return EgressResult::None;
        }

        let created = segment.meta();
        let evicted: Vec<SegmentMeta> = state
            .window
            .push(segment)
            .iter()
            .map(Segment::meta)
            .collect();
        for old in &evicted {
            trace!("Evicted {} from the playlist window", old.filename);
        }
        EgressResult::Segments {
            created: vec![created],
            evicted,
        }
    }

    /// Raise the advertised TARGETDURATION; never lowers it.
    pub fn bump_target_duration(&self, seconds: u64) {
        let mut state = self.state.write().unwrap();
        if seconds > state.window.target_duration {
            warn!(
                "Raising TARGETDURATION {} -> {}",
                state.window.target_duration, seconds
            );
            state.window.target_duration = seconds;
        }
    }

    pub fn target_duration(&self) -> u64 {
        self.state.read().unwrap().window.target_duration
    }

    /// Media playlist text, rendered fresh on every request. `None` until
    /// the init segment exists (there is nothing a client could play).
    pub fn media_playlist(&self, stream_base: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        state.init.as_ref()?;
        Some(state.window.render(stream_base))
    }

    pub fn master_playlist(&self, stream_base: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        let info = state.info.as_ref()?;
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:6\n");
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"{}\",RESOLUTION={}x{},FRAME-RATE={:.3}",
            info.bandwidth, info.codecs, info.width, info.height, info.frame_rate
        );
        let _ = writeln!(out, "{}/playlist.m3u8", stream_base);
        Some(out)
    }

    pub fn init_segment(&self) -> Option<Bytes> {
        self.state.read().unwrap().init.clone()
    }

    /// Bytes for a window-resident segment; evicted segments are gone.
    pub fn segment(&self, filename: &str) -> Option<Bytes> {
        let state = self.state.read().unwrap();
        state.window.segment(filename).map(|s| s.bytes.clone())
    }

    pub fn window_filenames(&self) -> Vec<String> {
        self.state.read().unwrap().window.filenames()
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.state.read().unwrap().info.clone()
    }

    /// Switch the playlist to its terminal form (`#EXT-X-ENDLIST`).
    pub fn mark_ended(&self) {
        let mut state = self.state.write().unwrap();
        state.window.ended = true;
        state.ended_at = Some(Instant::now());
    }

    pub fn is_ended(&self) -> bool {
        self.state.read().unwrap().window.ended
    }

    /// True once the post-stop grace period is over and the URL namespace
    /// should answer 410.
    pub fn ended_longer_than(&self, grace: Duration) -> bool {
        self.state
            .read()
            .unwrap()
            .ended_at
            .map(|t| t.elapsed() > grace)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::validate::check_playlist_matches_window;

    fn publisher_with_init(window_size: usize) -> HlsPublisher {
        let publisher = HlsPublisher::new(window_size, 1.0);
        publisher.publish_init(
            Bytes::from_static(&[0u8; 32]),
            StreamInfo {
                codecs: "avc1.640020".to_string(),
                width: 960,
                height: 540,
                frame_rate: 15.0,
                bandwidth: 2_000_000,
            },
        );
        publisher
    }

    fn segment(sequence: u64) -> Segment {
        Segment {
            filename: Segment::filename_for(sequence),
            sequence_number: sequence,
            bytes: Bytes::from(vec![sequence as u8; 64]),
            duration_seconds: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn media_playlist_layout_is_exact() {
        let publisher = publisher_with_init(10);
        publisher.publish_segment(segment(0));
        let playlist = publisher.media_playlist("/stream/Ab12Cd34").unwrap();
        assert_eq!(
            playlist,
            "#EXTM3U\n\
             #EXT-X-VERSION:6\n\
             #EXT-X-TARGETDURATION:1\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-INDEPENDENT-SEGMENTS\n\
             #EXT-X-MAP:URI=\"/stream/Ab12Cd34/init.mp4\"\n\
             #EXTINF:1.000,\n\
             /stream/Ab12Cd34/segments/segment_0.m4s\n"
        );
    }

    #[test]
    fn window_eviction_advances_media_sequence() {
        let publisher = publisher_with_init(3);
        for sequence in 0..5 {
            publisher.publish_segment(segment(sequence));
        }

        let playlist = publisher.media_playlist("/stream/x").unwrap();
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2"));
        check_playlist_matches_window(
            &playlist,
            &[
                "segment_2.m4s".to_string(),
                "segment_3.m4s".to_string(),
                "segment_4.m4s".to_string(),
            ],
        )
        .unwrap();

        // evicted segments are unreachable
        assert!(publisher.segment("segment_0.m4s").is_none());
        assert!(publisher.segment("segment_1.m4s").is_none());
        assert!(publisher.segment("segment_2.m4s").is_some());
    }

    #[test]
    fn eviction_reports_the_removed_segments() {
        let publisher = publisher_with_init(2);
        publisher.publish_segment(segment(0));
        publisher.publish_segment(segment(1));
        let result = publisher.publish_segment(segment(2));
        let EgressResult::Segments { created, evicted } = result else {
            panic!("expected segment result");
        };
        assert_eq!(created[0].filename, "segment_2.m4s");
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].filename, "segment_0.m4s");
    }

    #[test]
    fn segments_require_a_published_init() {
        let publisher = HlsPublisher::new(3, 1.0);
        let result = publisher.publish_segment(segment(0));
        assert!(matches!(result, EgressResult::None));
        assert!(publisher.segment("segment_0.m4s").is_none());
        assert!(publisher.media_playlist("/stream/x").is_none());
    }

    #[test]
    fn ended_stream_carries_endlist() {
        let publisher = publisher_with_init(3);
        publisher.publish_segment(segment(0));
        publisher.mark_ended();
        let playlist = publisher.media_playlist("/stream/x").unwrap();
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
        assert!(!publisher.ended_longer_than(Duration::from_secs(60)));
    }

    #[test]
    fn target_duration_only_rises() {
        let publisher = publisher_with_init(3);
        publisher.bump_target_duration(3);
        assert_eq!(publisher.target_duration(), 3);
        publisher.bump_target_duration(2);
        assert_eq!(publisher.target_duration(), 3);
    }

    #[test]
    fn master_playlist_declares_the_rendition() {
        let publisher = publisher_with_init(3);
        let master = publisher.master_playlist("/stream/x").unwrap();
        assert!(master.contains("CODECS=\"avc1.640020\""));
        assert!(master.contains("RESOLUTION=960x540"));
        assert!(master.contains("FRAME-RATE=15.000"));
        assert!(master.contains("BANDWIDTH=2000000"));
        assert!(master.ends_with("/stream/x/playlist.m3u8\n"));
    }
}
