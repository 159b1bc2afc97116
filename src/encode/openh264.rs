//! Software H.264 backend over the bundled openh264 codec.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use log::info;
use openh264::encoder::{Encoder, EncoderConfig as Openh264Config, FrameType};
use openh264::formats::YUVSource;

use super::{EncodedPicture, EncoderBackend, EncoderConfig};
use crate::h264::split_annex_b;
use crate::ingress::RawFrame;

pub struct Openh264Backend {
    encoder: Encoder,
}

impl Openh264Backend {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let cfg = Openh264Config::new(config.width, config.height)
            .enable_skip_frame(false)
            .max_frame_rate(config.frame_rate)
            .set_bitrate_bps(config.bitrate);
        let encoder =
            Encoder::with_config(cfg).map_err(|e| anyhow!("openh264 setup failed: {}", e))?;
        info!(
            "openh264 encoder ready: {}x{} @ {} bps",
            config.width, config.height, config.bitrate
        );
        Ok(Self { encoder })
    }
}

impl EncoderBackend for Openh264Backend {
    fn encode(&mut self, frame: &RawFrame, force_keyframe: bool) -> Result<EncodedPicture> {
        if force_keyframe {
            self.encoder.force_intra_frame(true);
        }
        let bitstream = self
            .encoder
            .encode(&PlanarFrame(frame))
            .map_err(|e| anyhow!("openh264 encode failed: {}", e))?;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let annex_b = bitstream.to_vec();
        let nals = split_annex_b(&annex_b)
            .into_iter()
            .map(Bytes::copy_from_slice)
            .collect();
        Ok(EncodedPicture { nals, is_keyframe })
    }
}

/// Adapter exposing a [`RawFrame`] as the planar source openh264 expects.
struct PlanarFrame<'a>(&'a RawFrame);

impl YUVSource for PlanarFrame<'_> {
    fn width(&self) -> i32 {
        self.0.width as i32
    }

    fn height(&self) -> i32 {
        self.0.height as i32
    }

    fn y(&self) -> &[u8] {
        &self.0.pixels.y
    }

    fn u(&self) -> &[u8] {
        &self.0.pixels.u
    }

    fn v(&self) -> &[u8] {
        &self.0.pixels.v
    }

    fn y_stride(&self) -> i32 {
        self.0.pixels.y_stride as i32
    }

    fn u_stride(&self) -> i32 {
        self.0.pixels.chroma_stride as i32
    }

    fn v_stride(&self) -> i32 {
        self.0.pixels.chroma_stride as i32
    }
}
