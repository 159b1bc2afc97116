//! Typed emission of ISO BMFF box structure on top of [`bytes::BufMut`].
//!
//! Everything in the file format is big-endian; `BufMut`'s `put_*`
//! methods already are, so this module only adds the FourCC and box-wrap
//! operations. 64-bit box sizes are never needed at live segment sizes.

use bytes::{BufMut, BytesMut};

pub type FourCc = [u8; 4];

/// Box header length: u32 size + FourCC.
pub const BOX_HEADER_LEN: usize = 8;

/// Append `size || kind || payload` where `size` covers the 8-byte header.
pub fn push_box(buf: &mut BytesMut, kind: FourCc, payload: &[u8]) {
    buf.put_u32((BOX_HEADER_LEN + payload.len()) as u32);
    buf.put_slice(&kind);
    buf.put_slice(payload);
}

/// Append a full box: version byte and 24-bit flags ahead of the payload.
pub fn push_full_box(buf: &mut BytesMut, kind: FourCc, version: u8, flags: u32, payload: &[u8]) {
    buf.put_u32((BOX_HEADER_LEN + 4 + payload.len()) as u32);
    buf.put_slice(&kind);
    buf.put_u8(version);
    put_u24(buf, flags);
    buf.put_slice(payload);
}

pub fn put_u24(buf: &mut BytesMut, value: u32) {
    debug_assert!(value <= 0x00FF_FFFF);
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

pub fn put_fourcc(buf: &mut BytesMut, kind: FourCc) {
    buf.put_slice(&kind);
}

pub fn put_zeros(buf: &mut BytesMut, count: usize) {
    buf.put_bytes(0, count);
}

/// The identity transform matrix used by `mvhd` and `tkhd`.
pub fn put_matrix(buf: &mut BytesMut) {
    const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];
    for v in MATRIX {
        buf.put_u32(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn integer_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_u16(0xBEEF);
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u64(0x0123_4567_89AB_CDEF);
        put_u24(&mut buf, 0x02_00_00);

        let mut r = buf.freeze();
        assert_eq!(r.get_u16(), 0xBEEF);
        assert_eq!(r.get_u32(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64(), 0x0123_4567_89AB_CDEF);
        assert_eq!(r.chunk(), &[0x02, 0x00, 0x00]);
    }

    #[test]
    fn box_wrap_layout() {
        let mut buf = BytesMut::new();
        push_box(&mut buf, *b"mdat", &[0xAA, 0xBB, 0xCC]);
        assert_eq!(buf.len(), 11);
        assert_eq!(&buf[0..4], &[0, 0, 0, 11]);
        assert_eq!(&buf[4..8], b"mdat");
        assert_eq!(&buf[8..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn full_box_carries_version_and_flags() {
        let mut buf = BytesMut::new();
        push_full_box(&mut buf, *b"tfhd", 0, 0x020000, &[0, 0, 0, 1]);
        assert_eq!(&buf[0..4], &[0, 0, 0, 16]);
        assert_eq!(&buf[4..8], b"tfhd");
        assert_eq!(&buf[8..12], &[0x00, 0x02, 0x00, 0x00]);
        assert_eq!(&buf[12..], &[0, 0, 0, 1]);
    }
}
