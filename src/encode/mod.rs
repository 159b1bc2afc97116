//! H.264 encoder wrapper: turns raw frames into AVCC access units plus
//! parameter-set events, independent of which codec implementation sits
//! behind the [`EncoderBackend`] seam.
//!
//! Output ordering contract: events are emitted in decode order, which
//! equals presentation order because B-frames are disabled everywhere.
//! Every keyframe payload is self-contained: the (patched) SPS and the PPS
//! are prepended as length-prefixed NALs ahead of the IDR slice, so a
//! segment led by that keyframe decodes without any earlier segment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::h264::{nal_type, sps::patch_sps, to_avcc, NalUnitType, ParameterSets};
use crate::ingress::RawFrame;

#[cfg(feature = "encoder-openh264")]
pub mod openh264;

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub bitrate: u32,
    /// Nominal GOP length in frames; the cadence timer usually forces
    /// keyframes earlier than this.
    pub keyframe_interval: u32,
}

/// Which way an encoder session died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFault {
    /// The backend could not be brought up; nothing was encoded.
    Setup,
    /// A frame failed to encode; the session is invalid from here on.
    Encode,
}

#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// New codec configuration generation, emitted before (or together
    /// with) the first keyframe that references it.
    ParameterSets(ParameterSets),
    Frame(EncodedFrame),
    /// Terminal within a session; a new session must be started.
    Fault(EncoderFault),
}

/// One encoded access unit in AVCC form.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub track_id: u32,
    /// Length-prefixed NAL units; for keyframes this starts with SPS then
    /// PPS then the IDR slice.
    pub avcc: Bytes,
    pub presentation_time: crate::time::MediaTime,
    pub decode_time: crate::time::MediaTime,
    pub duration: crate::time::MediaTime,
    pub is_keyframe: bool,
}

/// Raw output of one backend encode call.
pub struct EncodedPicture {
    /// NAL units without start codes or length prefixes.
    pub nals: Vec<Bytes>,
    pub is_keyframe: bool,
}

/// The codec seam. Implementations are opaque to the wrapper; they only
/// promise decode-order output with no frame reordering.
pub trait EncoderBackend: Send {
    fn encode(&mut self, frame: &RawFrame, force_keyframe: bool) -> Result<EncodedPicture>;
}

/// Cloneable handle the cadence timer uses to request a keyframe at the
/// next input frame.
#[derive(Clone, Default)]
pub struct KeyframeRequest(Arc<AtomicBool>);

impl KeyframeRequest {
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

pub struct H264Encoder {
    config: EncoderConfig,
    backend: Box<dyn EncoderBackend>,
    out: UnboundedSender<EncoderEvent>,
    keyframe: KeyframeRequest,
    track_id: u32,
    params: Option<ParameterSets>,
    failed: bool,
}

impl H264Encoder {
    /// `keyframe` is the shared request handle; the cadence timer keeps a
    /// clone and the encoder honors it at the next input frame.
    pub fn new(
        config: EncoderConfig,
        backend: Box<dyn EncoderBackend>,
        out: UnboundedSender<EncoderEvent>,
        keyframe: KeyframeRequest,
    ) -> Self {
        Self {
            config,
            backend,
            out,
            keyframe,
            track_id: 1,
            params: None,
            failed: false,
        }
    }

    pub fn keyframe_handle(&self) -> KeyframeRequest {
        self.keyframe.clone()
    }

    /// Request a keyframe at the next input frame.
    pub fn force_keyframe(&self) {
        self.keyframe.request();
    }

    /// Encode one frame and emit the resulting events. After an error the
    /// session is invalidated and further calls fail immediately.
    pub fn encode_frame(&mut self, frame: &RawFrame) -> Result<()> {
        if self.failed {
            bail!("encoder session is invalidated");
        }

        let force = self.keyframe.take();
        let picture = match self.backend.encode(frame, force) {
            Ok(p) => p,
            Err(e) => {
                self.failed = true;
                let _ = self.out.send(EncoderEvent::Fault(EncoderFault::Encode));
                return Err(e);
            }
        };

        let mut sps: Option<Bytes> = None;
        let mut pps: Option<Bytes> = None;
        let mut slices: Vec<Bytes> = Vec::with_capacity(picture.nals.len());
        let mut has_idr = false;
        for nal in picture.nals {
            match nal_type(&nal) {
                NalUnitType::Sps => sps = Some(nal),
                NalUnitType::Pps => pps = Some(nal),
                NalUnitType::IdrSlice => {
                    has_idr = true;
                    slices.push(nal);
                }
                NalUnitType::NonIdrSlice => slices.push(nal),
                // SEI and delimiters never reach the muxer; keyframe
                // payloads must start with SPS/PPS/IDR.
                NalUnitType::Sei | NalUnitType::Aud | NalUnitType::Other(_) => {}
            }
        }

        if let (Some(sps), Some(pps)) = (sps, pps) {
            let patched = Bytes::from(patch_sps(&sps, self.config.frame_rate));
            let generation = ParameterSets { sps: patched, pps };
            if self.params.as_ref() != Some(&generation) {
                if self.params.is_some() {
                    warn!("Encoder emitted a new parameter-set generation mid-stream");
                }
                debug!(
                    "Parameter sets: sps={} bytes, pps={} bytes",
                    generation.sps.len(),
                    generation.pps.len()
                );
                self.params = Some(generation.clone());
                let _ = self.out.send(EncoderEvent::ParameterSets(generation));
            }
        }

        if slices.is_empty() {
            // backend skipped the frame (rate control); nothing to emit
            return Ok(());
        }

        let is_keyframe = picture.is_keyframe || has_idr;
        let Some(params) = self.params.as_ref() else {
            self.failed = true;
            let _ = self.out.send(EncoderEvent::Fault(EncoderFault::Encode));
            bail!("encoded slices arrived before any parameter sets");
        };

        let avcc = if is_keyframe {
            let mut nals: Vec<&[u8]> = Vec::with_capacity(slices.len() + 2);
            nals.push(params.sps.as_ref());
            nals.push(params.pps.as_ref());
            nals.extend(slices.iter().map(|s| s.as_ref()));
            to_avcc(nals)
        } else {
            to_avcc(slices.iter().map(|s| s.as_ref()))
        };

        let _ = self.out.send(EncoderEvent::Frame(EncodedFrame {
            track_id: self.track_id,
            avcc,
            presentation_time: frame.presentation_time,
            // no B-frames: decode order equals presentation order
            decode_time: frame.presentation_time,
            duration: frame.duration,
            is_keyframe,
        }));
        Ok(())
    }

    /// Drain any pending backend state. With reordering disabled there is
    /// never a queue to flush, so this only exists to complete the session
    /// contract.
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }
}
