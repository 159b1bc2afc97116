//! Fragmented-MP4 muxing: a one-shot initialization segment
//! (`ftyp` + `moov`) and repeated media segments (`moof` + `mdat`).
//!
//! Box layout follows ISO/IEC 14496-12 with the 14496-15 `avcC` record;
//! every structure here is emitted byte-exact so the output survives strict
//! native demuxers. Samples arrive as AVCC payloads and are copied into
//! `mdat` untouched.

use anyhow::{bail, ensure, Result};
use bytes::{BufMut, Bytes, BytesMut};

use crate::encode::EncodedFrame;
use crate::h264::ParameterSets;
use crate::time::{MediaTime, VIDEO_TIMESCALE};

pub mod boxes;
pub mod validate;

use boxes::{
    push_box, push_full_box, put_matrix, put_u24, put_zeros, BOX_HEADER_LEN,
};

/// `trun` sample flags for a sync sample: depends_on=2 (I frame),
/// is_depended_on=1, non-sync bit clear.
pub const SYNC_SAMPLE_FLAGS: u32 = 0x0201_0000;
/// Non-sync: depends_on=1, is_depended_on=1, non-sync bit set.
pub const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0001;

/// `trun` flags: data-offset + sample-duration + sample-size +
/// sample-flags. No composition offsets; B-frames are disabled upstream.
const TRUN_FLAGS: u32 = 0x0000_0701;
/// `tfhd` flags: default-base-is-moof.
const TFHD_FLAGS: u32 = 0x0002_0000;

#[derive(Debug, Clone)]
pub enum TrackKind {
    Video {
        width: u16,
        height: u16,
        params: ParameterSets,
    },
    /// Carried by the track abstraction; no audio is exercised end to end
    /// in the current scope.
    Audio {
        sample_rate: u32,
        channels: u16,
        config: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct TrackConfig {
    pub track_id: u32,
    /// Media timescale declared in `mdhd`; sample timing in `trun`/`tfdt`
    /// uses this scale.
    pub timescale: u32,
    pub kind: TrackKind,
}

struct SampleRun {
    duration: u32,
    size: u32,
    flags: u32,
}

/// Stateful muxer for one stream: track list plus the decode-time anchor
/// captured from the first media segment.
pub struct FragmentedMp4Muxer {
    tracks: Vec<TrackConfig>,
    next_track_id: u32,
    anchor: Option<MediaTime>,
}

impl Default for FragmentedMp4Muxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentedMp4Muxer {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_track_id: 1,
            anchor: None,
        }
    }

    pub fn add_video_track(&mut self, width: u16, height: u16, params: ParameterSets) -> u32 {
        let track_id = self.next_track_id;
        self.next_track_id += 1;
        self.tracks.push(TrackConfig {
            track_id,
            timescale: VIDEO_TIMESCALE,
            kind: TrackKind::Video {
                width,
                height,
                params,
            },
        });
        track_id
    }

    pub fn add_audio_track(&mut self, sample_rate: u32, channels: u16, config: Bytes) -> u32 {
        let track_id = self.next_track_id;
        self.next_track_id += 1;
        self.tracks.push(TrackConfig {
            track_id,
            timescale: sample_rate,
            kind: TrackKind::Audio {
                sample_rate,
                channels,
                config,
            },
        });
        track_id
    }

    /// Swap in a new parameter-set generation; the caller is expected to
    /// re-emit the initialization segment afterwards.
    pub fn replace_video_parameters(&mut self, track_id: u32, params: ParameterSets) -> Result<()> {
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.track_id == track_id)
            .ok_or_else(|| anyhow::anyhow!("unknown track {}", track_id))?;
        match &mut track.kind {
            TrackKind::Video { params: p, .. } => {
                *p = params;
                Ok(())
            }
            TrackKind::Audio { .. } => bail!("track {} is not a video track", track_id),
        }
    }

    pub fn has_tracks(&self) -> bool {
        !self.tracks.is_empty()
    }

    /// Forget the stream anchor; the next media segment establishes a new
    /// one. Used when a fresh stream starts on the same muxer.
    pub fn reset(&mut self) {
        self.anchor = None;
    }

    /// Build `ftyp` + `moov` for the configured tracks.
    pub fn init_segment(&self) -> Result<Bytes> {
        ensure!(
            !self.tracks.is_empty(),
            "cannot build an init segment without tracks"
        );

        let mut buf = BytesMut::new();
        self.write_ftyp(&mut buf);
        self.write_moov(&mut buf);
        Ok(buf.freeze())
    }

    /// Build `moof` + `mdat` for one run of samples belonging to a single
    /// track. `base_media_time` is the PTS of the first frame of the
    /// segment; the first call pins the stream anchor to it.
    pub fn media_segment(
        &mut self,
        samples: &[EncodedFrame],
        sequence_number: u32,
        base_media_time: MediaTime,
    ) -> Result<Bytes> {
        ensure!(!samples.is_empty(), "cannot mux an empty sample list");

        let track_id = samples[0].track_id;
        let track = self
            .tracks
            .iter()
            .find(|t| t.track_id == track_id)
            .ok_or_else(|| anyhow::anyhow!("unknown track {}", track_id))?;
        let timescale = track.timescale;

        for pair in samples.windows(2) {
            ensure!(
                pair[1].track_id == track_id,
                "mixed tracks in one sample run"
            );
            ensure!(
                pair[1].decode_time >= pair[0].decode_time,
                "non-monotone decode times ({} then {})",
                pair[0].decode_time,
                pair[1].decode_time
            );
        }

        let anchor = *self.anchor.get_or_insert(base_media_time);
        let base_decode_time = samples[0]
            .decode_time
            .checked_sub(&anchor)
            .map(|d| d.rescale(timescale))
            .filter(|v| *v >= 0)
            .ok_or_else(|| anyhow::anyhow!("decode time precedes the stream anchor"))?;

        let runs = Self::sample_runs(samples, timescale)?;

        // Two passes so that the trun data offset lands exactly on the
        // first byte of the mdat payload: probe the traf with offset 0 to
        // learn the moof size, then write it for real.
        let mut mfhd_payload = BytesMut::new();
        mfhd_payload.put_u32(sequence_number);
        let mut mfhd = BytesMut::new();
        push_full_box(&mut mfhd, *b"mfhd", 0, 0, &mfhd_payload);

        let probe = Self::write_traf(track_id, base_decode_time as u64, &runs, 0);
        let moof_size = BOX_HEADER_LEN + mfhd.len() + probe.len();
        let data_offset = (moof_size + BOX_HEADER_LEN) as u32;
        let traf = Self::write_traf(track_id, base_decode_time as u64, &runs, data_offset);

        let mut moof_payload = BytesMut::with_capacity(mfhd.len() + traf.len());
        moof_payload.put_slice(&mfhd);
        moof_payload.put_slice(&traf);

        let mdat_len: usize = samples.iter().map(|s| s.avcc.len()).sum();
        let mut buf = BytesMut::with_capacity(moof_size + BOX_HEADER_LEN + mdat_len);
        push_box(&mut buf, *b"moof", &moof_payload);

        buf.put_u32((BOX_HEADER_LEN + mdat_len) as u32);
        buf.put_slice(b"mdat");
        for sample in samples {
            buf.put_slice(&sample.avcc);
        }

        Ok(buf.freeze())
    }

    fn sample_runs(samples: &[EncodedFrame], timescale: u32) -> Result<Vec<SampleRun>> {
        let mut runs = Vec::with_capacity(samples.len());
        for (i, sample) in samples.iter().enumerate() {
            let duration = if let Some(next) = samples.get(i + 1) {
                next.decode_time
                    .checked_sub(&sample.decode_time)
                    .ok_or_else(|| anyhow::anyhow!("decode time delta overflow"))?
                    .rescale(timescale)
            } else {
                sample.duration.rescale(timescale)
            };
            ensure!(duration >= 0, "negative sample duration");
            runs.push(SampleRun {
                duration: duration as u32,
                size: sample.avcc.len() as u32,
                flags: if sample.is_keyframe {
                    SYNC_SAMPLE_FLAGS
                } else {
                    NON_SYNC_SAMPLE_FLAGS
                },
            });
        }
        Ok(runs)
    }

    fn write_traf(track_id: u32, base_decode_time: u64, runs: &[SampleRun], data_offset: u32) -> BytesMut {
        let mut payload = BytesMut::new();

        let mut tfhd = BytesMut::new();
        tfhd.put_u32(track_id);
        push_full_box(&mut payload, *b"tfhd", 0, TFHD_FLAGS, &tfhd);

        let mut tfdt = BytesMut::new();
        tfdt.put_u64(base_decode_time);
        push_full_box(&mut payload, *b"tfdt", 1, 0, &tfdt);

        let mut trun = BytesMut::new();
        trun.put_u32(runs.len() as u32);
        trun.put_u32(data_offset);
        for run in runs {
            trun.put_u32(run.duration);
            trun.put_u32(run.size);
            trun.put_u32(run.flags);
        }
        push_full_box(&mut payload, *b"trun", 0, TRUN_FLAGS, &trun);

        let mut traf = BytesMut::new();
        push_box(&mut traf, *b"traf", &payload);
        traf
    }

    fn write_ftyp(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        payload.put_slice(b"mp42"); // major brand
        payload.put_u32(1); // minor version
        for brand in [b"mp41", b"mp42", b"isom", b"hlsf"] {
            payload.put_slice(brand);
        }
        push_box(buf, *b"ftyp", &payload);
    }

    fn write_moov(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        self.write_mvhd(&mut payload);
        for track in &self.tracks {
            Self::write_trak(&mut payload, track);
        }
        self.write_mvex(&mut payload);
        push_box(buf, *b"moov", &payload);
    }

    fn write_mvhd(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        payload.put_u32(0); // creation_time
        payload.put_u32(0); // modification_time
        payload.put_u32(VIDEO_TIMESCALE); // timescale
        payload.put_u32(0); // duration: unknown, live
        payload.put_u32(0x0001_0000); // rate 1.0
        payload.put_u16(0x0100); // volume 1.0
        put_zeros(&mut payload, 2 + 8); // reserved
        put_matrix(&mut payload);
        put_zeros(&mut payload, 24); // pre_defined
        payload.put_u32(self.next_track_id);
        push_full_box(buf, *b"mvhd", 0, 0, &payload);
    }

    fn write_trak(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        Self::write_tkhd(&mut payload, track);
        Self::write_mdia(&mut payload, track);
        push_box(buf, *b"trak", &payload);
    }

    fn write_tkhd(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        payload.put_u32(0); // creation_time
        payload.put_u32(0); // modification_time
        payload.put_u32(track.track_id);
        payload.put_u32(0); // reserved
        payload.put_u32(0); // duration
        put_zeros(&mut payload, 8); // reserved
        payload.put_u16(0); // layer
        payload.put_u16(0); // alternate_group
        match &track.kind {
            TrackKind::Video { .. } => payload.put_u16(0),
            TrackKind::Audio { .. } => payload.put_u16(0x0100),
        }
        payload.put_u16(0); // reserved
        put_matrix(&mut payload);
        match &track.kind {
            TrackKind::Video { width, height, .. } => {
                payload.put_u32((*width as u32) << 16); // 16.16 fixed point
                payload.put_u32((*height as u32) << 16);
            }
            TrackKind::Audio { .. } => {
                payload.put_u32(0);
                payload.put_u32(0);
            }
        }
        // flags: track_enabled | track_in_movie
        push_full_box(buf, *b"tkhd", 0, 0x000003, &payload);
    }

    fn write_mdia(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        Self::write_mdhd(&mut payload, track);
        Self::write_hdlr(&mut payload, track);
        Self::write_minf(&mut payload, track);
        push_box(buf, *b"mdia", &payload);
    }

    fn write_mdhd(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        payload.put_u32(0); // creation_time
        payload.put_u32(0); // modification_time
        payload.put_u32(track.timescale);
        payload.put_u32(0); // duration
        payload.put_u16(0x55C4); // language: und
        payload.put_u16(0); // pre_defined
        push_full_box(buf, *b"mdhd", 0, 0, &payload);
    }

    fn write_hdlr(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        payload.put_u32(0); // pre_defined
        match &track.kind {
            TrackKind::Video { .. } => payload.put_slice(b"vide"),
            TrackKind::Audio { .. } => payload.put_slice(b"soun"),
        }
        put_zeros(&mut payload, 12); // reserved
        match &track.kind {
            TrackKind::Video { .. } => payload.put_slice(b"VideoHandler\0"),
            TrackKind::Audio { .. } => payload.put_slice(b"SoundHandler\0"),
        }
        push_full_box(buf, *b"hdlr", 0, 0, &payload);
    }

    fn write_minf(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        match &track.kind {
            TrackKind::Video { .. } => {
                let mut vmhd = BytesMut::new();
                vmhd.put_u16(0); // graphicsmode
                put_zeros(&mut vmhd, 6); // opcolor
                push_full_box(&mut payload, *b"vmhd", 0, 0x000001, &vmhd);
            }
            TrackKind::Audio { .. } => {
                let mut smhd = BytesMut::new();
                smhd.put_u16(0); // balance
                smhd.put_u16(0); // reserved
                push_full_box(&mut payload, *b"smhd", 0, 0, &smhd);
            }
        }
        Self::write_dinf(&mut payload);
        Self::write_stbl(&mut payload, track);
        push_box(buf, *b"minf", &payload);
    }

    fn write_dinf(buf: &mut BytesMut) {
        let mut url = BytesMut::new();
        // flags 0x000001: media data is in the same file
        push_full_box(&mut url, *b"url ", 0, 0x000001, &[]);

        let mut dref = BytesMut::new();
        dref.put_u32(1); // entry_count
        dref.put_slice(&url);

        let mut payload = BytesMut::new();
        push_full_box(&mut payload, *b"dref", 0, 0, &dref);
        push_box(buf, *b"dinf", &payload);
    }

    fn write_stbl(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        Self::write_stsd(&mut payload, track);

        // All sample information lives in movie fragments; the static
        // tables stay empty.
        let mut empty = BytesMut::new();
        empty.put_u32(0); // entry_count
        push_full_box(&mut payload, *b"stts", 0, 0, &empty);
        push_full_box(&mut payload, *b"stsc", 0, 0, &empty);

        let mut stsz = BytesMut::new();
        stsz.put_u32(0); // sample_size
        stsz.put_u32(0); // sample_count
        push_full_box(&mut payload, *b"stsz", 0, 0, &stsz);
        push_full_box(&mut payload, *b"stco", 0, 0, &empty);

        push_box(buf, *b"stbl", &payload);
    }

    fn write_stsd(buf: &mut BytesMut, track: &TrackConfig) {
        let mut payload = BytesMut::new();
        payload.put_u32(1); // entry_count
        match &track.kind {
            TrackKind::Video {
                width,
                height,
                params,
            } => Self::write_avc1(&mut payload, *width, *height, params),
            TrackKind::Audio {
                sample_rate,
                channels,
                config,
            } => Self::write_mp4a(&mut payload, *sample_rate, *channels, config),
        }
        push_full_box(buf, *b"stsd", 0, 0, &payload);
    }

    fn write_avc1(buf: &mut BytesMut, width: u16, height: u16, params: &ParameterSets) {
        let mut payload = BytesMut::new();
        put_zeros(&mut payload, 6); // reserved
        payload.put_u16(1); // data_reference_index
        payload.put_u16(0); // pre_defined
        payload.put_u16(0); // reserved
        put_zeros(&mut payload, 12); // pre_defined
        payload.put_u16(width);
        payload.put_u16(height);
        payload.put_u32(0x0048_0000); // horizresolution 72 dpi
        payload.put_u32(0x0048_0000); // vertresolution 72 dpi
        payload.put_u32(0); // reserved
        payload.put_u16(1); // frame_count
        put_zeros(&mut payload, 32); // compressorname
        payload.put_u16(0x0018); // depth
        payload.put_u16(0xFFFF); // pre_defined -1
        Self::write_avcc(&mut payload, params);
        push_box(buf, *b"avc1", &payload);
    }

    fn write_avcc(buf: &mut BytesMut, params: &ParameterSets) {
        let mut payload = BytesMut::new();
        payload.put_u8(1); // configurationVersion
        if params.sps.len() >= 4 {
            payload.put_u8(params.sps[1]); // AVCProfileIndication
            payload.put_u8(params.sps[2]); // profile_compatibility
            payload.put_u8(params.sps[3]); // AVCLevelIndication
        } else {
            payload.put_u8(66); // Baseline
            payload.put_u8(0);
            payload.put_u8(30); // Level 3.0
        }
        payload.put_u8(0xFF); // lengthSizeMinusOne = 3, reserved bits set
        payload.put_u8(0xE1); // one SPS, reserved bits set
        payload.put_u16(params.sps.len() as u16);
        payload.put_slice(&params.sps);
        payload.put_u8(0x01); // one PPS
        payload.put_u16(params.pps.len() as u16);
        payload.put_slice(&params.pps);
        push_box(buf, *b"avcC", &payload);
    }

    fn write_mp4a(buf: &mut BytesMut, sample_rate: u32, channels: u16, config: &Bytes) {
        let mut payload = BytesMut::new();
        put_zeros(&mut payload, 6); // reserved
        payload.put_u16(1); // data_reference_index
        put_zeros(&mut payload, 8); // reserved
        payload.put_u16(channels);
        payload.put_u16(16); // samplesize
        payload.put_u16(0); // pre_defined
        payload.put_u16(0); // reserved
        payload.put_u32(sample_rate << 16); // 16.16 fixed point
        Self::write_esds(&mut payload, config);
        push_box(buf, *b"mp4a", &payload);
    }

    fn write_esds(buf: &mut BytesMut, config: &Bytes) {
        let dec_specific_len = config.len();
        let dec_config_len = 13 + 2 + dec_specific_len;
        let es_len = 3 + 2 + dec_config_len + 3;

        let mut payload = BytesMut::new();
        payload.put_u8(0x03); // ES_DescrTag
        payload.put_u8(es_len as u8);
        payload.put_u16(1); // ES_ID
        payload.put_u8(0); // flags
        payload.put_u8(0x04); // DecoderConfigDescrTag
        payload.put_u8(dec_config_len as u8);
        payload.put_u8(0x40); // objectTypeIndication: AAC
        payload.put_u8(0x15); // streamType audio, upstream 0, reserved
        put_u24(&mut payload, 0); // bufferSizeDB
        payload.put_u32(0); // maxBitrate
        payload.put_u32(0); // avgBitrate
        payload.put_u8(0x05); // DecSpecificInfoTag
        payload.put_u8(dec_specific_len as u8);
        payload.put_slice(config);
        payload.put_u8(0x06); // SLConfigDescrTag
        payload.put_u8(1);
        payload.put_u8(0x02); // MP4 predefined
        push_full_box(buf, *b"esds", 0, 0, &payload);
    }

    fn write_mvex(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();

        let mut mehd = BytesMut::new();
        mehd.put_u64(0); // fragment_duration: unknown, live
        push_full_box(&mut payload, *b"mehd", 1, 0, &mehd);

        for track in &self.tracks {
            let mut trex = BytesMut::new();
            trex.put_u32(track.track_id);
            trex.put_u32(1); // default_sample_description_index
            trex.put_u32(0); // default_sample_duration
            trex.put_u32(0); // default_sample_size
            trex.put_u32(0); // default_sample_flags
            push_full_box(&mut payload, *b"trex", 0, 0, &trex);
        }
        push_box(buf, *b"mvex", &payload);
    }
}
