//! VUI timing injection for encoder-emitted SPS NAL units.
//!
//! Hardware encoders commonly omit VUI `timing_info` from the SPS, and
//! Safari's native HLS demuxer rejects such streams. The patcher parses the
//! SPS up to `vui_parameters_present_flag`, re-emits the identical prefix
//! and appends a minimal VUI carrying only the timing fields.

use anyhow::{bail, ensure, Result};
use log::warn;

use super::bitstream::{BitReader, BitWriter};
use super::{escape_rbsp, nal_type, unescape_rbsp, NalUnitType};

/// Profiles whose SPS carries the chroma format / bit depth block
/// (ISO/IEC 14496-10 §7.3.2.1.1).
const HIGH_PROFILE_IDCS: [u32; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Ensure `sps` carries VUI timing info for `frame_rate`.
///
/// Idempotent: an SPS that already has VUI timing is returned unchanged.
/// Any parse failure degrades gracefully to the original bytes; only
/// Safari compatibility is lost, not the stream.
pub fn patch_sps(sps: &[u8], frame_rate: f32) -> Vec<u8> {
    match try_patch(sps, frame_rate) {
        Ok(Some(patched)) => patched,
        Ok(None) => sps.to_vec(),
        Err(e) => {
            warn!("Could not patch SPS timing info, using original: {}", e);
            sps.to_vec()
        }
    }
}

/// `Ok(None)` means the SPS already carries timing info.
fn try_patch(sps: &[u8], frame_rate: f32) -> Result<Option<Vec<u8>>> {
    ensure!(sps.len() >= 4, "SPS too short: {} bytes", sps.len());
    ensure!(
        nal_type(sps) == NalUnitType::Sps,
        "not an SPS NAL (type {})",
        sps[0] & 0x1F
    );

    let rbsp = unescape_rbsp(&sps[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(8)?; // constraint_set flags + reserved_zero_2bits
    r.read_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    if HIGH_PROFILE_IDCS.contains(&profile_idc) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present_flag
            let list_count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..list_count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let num_ref_frames_in_cycle = r.read_ue()?;
        for _ in 0..num_ref_frames_in_cycle {
            r.read_se()?; // offset_for_ref_frame
        }
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag
    r.read_ue()?; // pic_width_in_mbs_minus1
    r.read_ue()?; // pic_height_in_map_units_minus1
    if r.read_bit()? == 0 {
        // frame_mbs_only_flag
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag
    if r.read_bit()? == 1 {
        // frame_cropping_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }

    let prefix_bits = r.position();

    if r.read_bit()? == 1 {
        // VUI already present
        if vui_has_timing_info(&mut r)? {
            return Ok(None);
        }
        bail!("VUI present without timing info");
    }

    let time_scale = (2.0 * frame_rate).round() as u32;
    ensure!(time_scale > 0, "invalid frame rate {}", frame_rate);

    let mut w = BitWriter::new();
    w.copy_bits(&rbsp, prefix_bits);
    w.write_bit(1); // vui_parameters_present_flag
    w.write_bit(0); // aspect_ratio_info_present_flag
    w.write_bit(0); // overscan_info_present_flag
    w.write_bit(0); // video_signal_type_present_flag
    w.write_bit(0); // chroma_loc_info_present_flag
    w.write_bit(1); // timing_info_present_flag
    w.write_bits(1, 32); // num_units_in_tick
    w.write_bits(time_scale, 32); // time_scale
    w.write_bit(1); // fixed_frame_rate_flag
    w.write_bit(0); // nal_hrd_parameters_present_flag
    w.write_bit(0); // vcl_hrd_parameters_present_flag
    w.write_bit(0); // pic_struct_present_flag
    w.write_bit(0); // bitstream_restriction_flag
    let patched_rbsp = w.finish_rbsp();

    let mut out = Vec::with_capacity(patched_rbsp.len() + 1);
    out.push(sps[0]);
    out.extend_from_slice(&escape_rbsp(&patched_rbsp));
    Ok(Some(out))
}

/// Walk the head of the VUI up to and including
/// `timing_info_present_flag`.
fn vui_has_timing_info(r: &mut BitReader) -> Result<bool> {
    if r.read_bit()? == 1 {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc = r.read_bits(8)?;
        if aspect_ratio_idc == 255 {
            // Extended_SAR
            r.read_bits(16)?;
            r.read_bits(16)?;
        }
    }
    if r.read_bit()? == 1 {
        // overscan_info_present_flag
        r.read_bit()?;
    }
    if r.read_bit()? == 1 {
        // video_signal_type_present_flag
        r.read_bits(3)?; // video_format
        r.read_bit()?; // video_full_range_flag
        if r.read_bit()? == 1 {
            // colour_description_present_flag
            r.read_bits(24)?;
        }
    }
    if r.read_bit()? == 1 {
        // chroma_loc_info_present_flag
        r.read_ue()?;
        r.read_ue()?;
    }
    Ok(r.read_bit()? == 1)
}

fn skip_scaling_list(r: &mut BitReader, size: u32) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}
