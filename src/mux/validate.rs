//! Independent structural validation of emitted segments.
//!
//! This parser shares no code with the writer side on purpose: it walks
//! raw bytes, so a bookkeeping bug in the muxer cannot cancel itself out
//! here. Used by the property tests and, behind the `debug-validate`
//! feature, by the diagnostics routes.

use anyhow::{bail, ensure, Context, Result};

use super::boxes::{FourCc, BOX_HEADER_LEN};

pub struct BoxView<'a> {
    pub kind: FourCc,
    pub payload: &'a [u8],
}

/// Parse a run of sibling boxes. The boxes must cover `data` exactly;
/// trailing or missing bytes are an error.
pub fn parse_boxes(data: &[u8]) -> Result<Vec<BoxView<'_>>> {
    let mut boxes = Vec::new();
    let mut i = 0;
    while i < data.len() {
        ensure!(
            i + BOX_HEADER_LEN <= data.len(),
            "truncated box header at offset {}",
            i
        );
        let size = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
        ensure!(size >= BOX_HEADER_LEN, "box size {} below header size", size);
        ensure!(
            i + size <= data.len(),
            "box at offset {} overruns buffer ({} > {})",
            i,
            size,
            data.len() - i
        );
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&data[i + 4..i + 8]);
        boxes.push(BoxView {
            kind,
            payload: &data[i + BOX_HEADER_LEN..i + size],
        });
        i += size;
    }
    Ok(boxes)
}

pub fn find_box<'a>(boxes: &'a [BoxView<'a>], kind: FourCc) -> Result<&'a BoxView<'a>> {
    boxes
        .iter()
        .find(|b| b.kind == kind)
        .with_context(|| format!("missing {} box", String::from_utf8_lossy(&kind)))
}

fn be_u32(data: &[u8], offset: usize) -> Result<u32> {
    ensure!(offset + 4 <= data.len(), "truncated field at {}", offset);
    Ok(u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}

fn be_u64(data: &[u8], offset: usize) -> Result<u64> {
    ensure!(offset + 8 <= data.len(), "truncated field at {}", offset);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    Ok(u64::from_be_bytes(bytes))
}

#[derive(Debug)]
pub struct InitSegmentReport {
    pub major_brand: String,
    pub compatible_brands: Vec<String>,
    pub movie_timescale: u32,
    pub track_ids: Vec<u32>,
    pub video_codec: Option<String>,
}

pub fn inspect_init_segment(data: &[u8]) -> Result<InitSegmentReport> {
    let top = parse_boxes(data)?;
    ensure!(top.len() == 2, "init segment must be ftyp + moov");
    ensure!(&top[0].kind == b"ftyp", "first box is not ftyp");
    ensure!(&top[1].kind == b"moov", "second box is not moov");

    let ftyp = top[0].payload;
    ensure!(ftyp.len() >= 8, "ftyp too short");
    let major_brand = String::from_utf8_lossy(&ftyp[0..4]).to_string();
    let compatible_brands = ftyp[8..]
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect();

    let moov = parse_boxes(top[1].payload)?;
    let mvhd = find_box(&moov, *b"mvhd")?;
    let movie_timescale = be_u32(mvhd.payload, 12)?;

    let mut track_ids = Vec::new();
    let mut video_codec = None;
    for trak in moov.iter().filter(|b| &b.kind == b"trak") {
        let children = parse_boxes(trak.payload)?;
        let tkhd = find_box(&children, *b"tkhd")?;
        track_ids.push(be_u32(tkhd.payload, 12)?);

        if let Some(codec) = video_codec_of_trak(&children)? {
            video_codec = Some(codec);
        }
    }
    ensure!(!track_ids.is_empty(), "moov carries no tracks");
    find_box(&moov, *b"mvex")?;

    Ok(InitSegmentReport {
        major_brand,
        compatible_brands,
        movie_timescale,
        track_ids,
        video_codec,
    })
}

fn video_codec_of_trak(trak_children: &[BoxView]) -> Result<Option<String>> {
    let mdia = parse_boxes(find_box(trak_children, *b"mdia")?.payload)?;
    let minf = parse_boxes(find_box(&mdia, *b"minf")?.payload)?;
    let stbl = parse_boxes(find_box(&minf, *b"stbl")?.payload)?;
    let stsd = find_box(&stbl, *b"stsd")?;
    ensure!(stsd.payload.len() >= 8, "stsd too short");
    // skip version/flags + entry_count
    let entries = parse_boxes(&stsd.payload[8..])?;
    let Some(avc1) = entries.iter().find(|b| &b.kind == b"avc1") else {
        return Ok(None);
    };
    // fixed-size VisualSampleEntry header precedes the codec boxes
    const VISUAL_ENTRY_LEN: usize = 78;
    ensure!(avc1.payload.len() > VISUAL_ENTRY_LEN, "avc1 entry too short");
    let codec_boxes = parse_boxes(&avc1.payload[VISUAL_ENTRY_LEN..])?;
    let avcc = find_box(&codec_boxes, *b"avcC")?;
    ensure!(avcc.payload.len() >= 4, "avcC too short");
    ensure!(avcc.payload[0] == 1, "bad avcC configurationVersion");
    Ok(Some(format!(
        "avc1.{:02x}{:02x}{:02x}",
        avcc.payload[1], avcc.payload[2], avcc.payload[3]
    )))
}

#[derive(Debug)]
pub struct MediaSegmentReport {
    pub sequence_number: u32,
    pub track_id: u32,
    pub base_media_decode_time: u64,
    pub sample_count: u32,
    pub data_offset: u32,
    pub sample_durations: Vec<u32>,
    pub sample_sizes: Vec<u32>,
    pub sample_flags: Vec<u32>,
    pub mdat_payload_len: usize,
}

impl MediaSegmentReport {
    /// Sum of sample durations, in the track timescale.
    pub fn total_duration(&self) -> u64 {
        self.sample_durations.iter().map(|d| *d as u64).sum()
    }
}

pub fn inspect_media_segment(data: &[u8]) -> Result<MediaSegmentReport> {
    let top = parse_boxes(data)?;
    ensure!(
        top.len() == 2 && &top[0].kind == b"moof" && &top[1].kind == b"mdat",
        "media segment must be exactly moof followed by mdat"
    );
    let moof_size = BOX_HEADER_LEN + top[0].payload.len();

    let moof = parse_boxes(top[0].payload)?;
    let mfhd = find_box(&moof, *b"mfhd")?;
    let sequence_number = be_u32(mfhd.payload, 4)?;

    let trafs: Vec<_> = moof.iter().filter(|b| &b.kind == b"traf").collect();
    ensure!(trafs.len() == 1, "expected exactly one traf");
    let traf = parse_boxes(trafs[0].payload)?;

    let tfhd = find_box(&traf, *b"tfhd")?;
    let tfhd_flags = be_u32(tfhd.payload, 0)? & 0x00FF_FFFF;
    ensure!(
        tfhd_flags & 0x020000 != 0,
        "tfhd missing default-base-is-moof"
    );
    let track_id = be_u32(tfhd.payload, 4)?;

    let tfdt = find_box(&traf, *b"tfdt")?;
    ensure!(!tfdt.payload.is_empty(), "tfdt too short");
    ensure!(tfdt.payload[0] == 1, "tfdt version must be 1");
    let base_media_decode_time = be_u64(tfdt.payload, 4)?;

    let trun = find_box(&traf, *b"trun")?;
    let trun_flags = be_u32(trun.payload, 0)? & 0x00FF_FFFF;
    ensure!(trun_flags & 0x000001 != 0, "trun missing data offset");
    let sample_count = be_u32(trun.payload, 4)?;
    let data_offset = be_u32(trun.payload, 8)?;
    ensure!(
        data_offset as usize == moof_size + BOX_HEADER_LEN,
        "trun data offset {} does not point at the mdat payload ({})",
        data_offset,
        moof_size + BOX_HEADER_LEN
    );

    let mut sample_durations = Vec::with_capacity(sample_count as usize);
    let mut sample_sizes = Vec::with_capacity(sample_count as usize);
    let mut sample_flags = Vec::with_capacity(sample_count as usize);
    let mut offset = 12;
    for _ in 0..sample_count {
        if trun_flags & 0x000100 != 0 {
            sample_durations.push(be_u32(trun.payload, offset)?);
            offset += 4;
        }
        if trun_flags & 0x000200 != 0 {
            sample_sizes.push(be_u32(trun.payload, offset)?);
            offset += 4;
        }
        if trun_flags & 0x000400 != 0 {
            sample_flags.push(be_u32(trun.payload, offset)?);
            offset += 4;
        }
        if trun_flags & 0x000800 != 0 {
            offset += 4; // composition time offset, unused here
        }
    }
    ensure!(offset == trun.payload.len(), "trun carries trailing bytes");

    let mdat_payload_len = top[1].payload.len();
    let declared: u64 = sample_sizes.iter().map(|s| *s as u64).sum();
    ensure!(
        declared == mdat_payload_len as u64,
        "sample sizes sum to {} but mdat carries {}",
        declared,
        mdat_payload_len
    );

    Ok(MediaSegmentReport {
        sequence_number,
        track_id,
        base_media_decode_time,
        sample_count,
        data_offset,
        sample_durations,
        sample_sizes,
        sample_flags,
        mdat_payload_len,
    })
}

/// Decode-time continuity between two successive segments of one stream.
pub fn check_continuity(prev: &MediaSegmentReport, next: &MediaSegmentReport) -> Result<()> {
    let expected = prev.base_media_decode_time + prev.total_duration();
    ensure!(
        next.base_media_decode_time >= expected,
        "tfdt went backwards: {} after {} + {}",
        next.base_media_decode_time,
        prev.base_media_decode_time,
        prev.total_duration()
    );
    Ok(())
}

/// Parse a rendered media playlist back and verify that the advertised
/// segment URIs are exactly `expected_filenames`, in order.
pub fn check_playlist_matches_window(text: &str, expected_filenames: &[String]) -> Result<()> {
    let (_, playlist) = m3u8_rs::parse_media_playlist(text.as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to parse media playlist: {}", e))?;

    let listed: Vec<String> = playlist
        .segments
        .iter()
        .map(|s| {
            s.uri
                .rsplit('/')
                .next()
                .unwrap_or(s.uri.as_str())
                .to_string()
        })
        .collect();
    if listed != expected_filenames {
        bail!(
            "playlist lists {:?} but the window holds {:?}",
            listed,
            expected_filenames
        );
    }
    Ok(())
}
