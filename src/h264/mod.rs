//! H.264 bitstream plumbing: NAL unit classification, Annex-B splitting,
//! AVCC length-prefixing and RBSP (de-)escaping.
//!
//! The pipeline carries AVCC throughout; Annex-B only ever appears at the
//! encoder boundary, where backends hand us start-code separated NAL units.

use bytes::{BufMut, Bytes, BytesMut};

pub mod bitstream;
pub mod sps;

/// Length of the AVCC length prefix in bytes (`lengthSizeMinusOne = 3`).
pub const AVCC_LENGTH_PREFIX: usize = 4;

/// NAL unit types this crate cares about (ISO/IEC 14496-10 table 7-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P frame).
    NonIdrSlice,
    /// IDR slice (keyframe).
    IdrSlice,
    /// Supplemental Enhancement Information.
    Sei,
    /// Sequence Parameter Set.
    Sps,
    /// Picture Parameter Set.
    Pps,
    /// Access Unit Delimiter.
    Aud,
    /// Anything else.
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            t => NalUnitType::Other(t),
        }
    }
}

impl NalUnitType {
    pub fn is_slice(&self) -> bool {
        matches!(self, NalUnitType::NonIdrSlice | NalUnitType::IdrSlice)
    }
}

/// Type of the NAL unit starting at `nal[0]`.
pub fn nal_type(nal: &[u8]) -> NalUnitType {
    nal.first().map(|b| NalUnitType::from(*b)).unwrap_or(NalUnitType::Other(0))
}

/// Split an Annex-B byte stream into NAL units, without the start codes.
///
/// Both 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) start codes are
/// accepted, mixed freely.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let len = data.len();
    let mut i = 0;

    while i + 3 <= len {
        let start_code_len = if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            3
        } else if i + 4 <= len
            && data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 0
            && data[i + 3] == 1
        {
            4
        } else {
            i += 1;
            continue;
        };

        let nal_start = i + start_code_len;
        let mut nal_end = len;
        let mut j = nal_start;
        while j + 3 <= len {
            if data[j] == 0 && data[j + 1] == 0 && (data[j + 2] == 1 || data[j + 2] == 0) {
                // candidate start of the next start code
                if data[j + 2] == 1 || (j + 4 <= len && data[j + 3] == 1) {
                    nal_end = j;
                    break;
                }
            }
            j += 1;
        }

        if nal_start < nal_end {
            nals.push(&data[nal_start..nal_end]);
        }
        i = nal_end;
    }

    nals
}

/// Length-prefix NAL units into a single AVCC buffer.
pub fn to_avcc<'a>(nals: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut buf = BytesMut::new();
    for nal in nals {
        buf.put_u32(nal.len() as u32);
        buf.put_slice(nal);
    }
    buf.freeze()
}

/// Walk an AVCC buffer, yielding each NAL unit. Returns `None` on a
/// malformed length prefix.
pub fn avcc_nal_units(avcc: &[u8]) -> Option<Vec<&[u8]>> {
    let mut nals = Vec::new();
    let mut i = 0;
    while i < avcc.len() {
        if i + AVCC_LENGTH_PREFIX > avcc.len() {
            return None;
        }
        let len = u32::from_be_bytes([avcc[i], avcc[i + 1], avcc[i + 2], avcc[i + 3]]) as usize;
        i += AVCC_LENGTH_PREFIX;
        if i + len > avcc.len() {
            return None;
        }
        nals.push(&avcc[i..i + len]);
        i += len;
    }
    Some(nals)
}

/// One generation of codec configuration. The SPS carried here is the
/// patched form (VUI timing injected); replacing a generation forces a new
/// initialization segment downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Bytes,
    pub pps: Bytes,
}

impl ParameterSets {
    /// RFC 6381 codec string (`avc1.PPCCLL`) from the SPS profile bytes.
    pub fn codec_string(&self) -> String {
        if self.sps.len() >= 4 {
            format!("avc1.{:02x}{:02x}{:02x}", self.sps[1], self.sps[2], self.sps[3])
        } else {
            // Baseline 3.0, same fallback the muxer uses for avcC
            "avc1.42001e".to_string()
        }
    }
}

/// Strip emulation prevention bytes (`00 00 03` -> `00 00`) from an
/// encoded NAL payload, producing the raw byte sequence payload.
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if zeros >= 2 && b == 3 && i + 1 < data.len() && data[i + 1] <= 3 {
            // emulation prevention byte, drop it
            zeros = 0;
            i += 1;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
        i += 1;
    }
    out
}

/// Re-insert emulation prevention bytes so that no `00 00 0x` (x <= 3)
/// sequence appears in the encoded payload.
pub fn escape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}
