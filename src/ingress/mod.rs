//! Frame sources. The capture side is a collaborator: anything that can
//! push planar YUV frames with rational timestamps can feed the pipeline.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use log::trace;
use tokio::sync::mpsc;
use url::Url;

use crate::time::MediaTime;

#[cfg(feature = "test-pattern")]
pub mod test;

/// An I420 pixel buffer. Planes are borrowed by the encoder for the
/// duration of one encode call and never retained by the core.
#[derive(Clone)]
pub struct PixelBuffer {
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
    pub y_stride: usize,
    pub chroma_stride: usize,
}

/// One raw frame from the capture source.
#[derive(Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelBuffer,
    pub presentation_time: MediaTime,
    pub duration: MediaTime,
}

/// Handle the capture side pushes frames into.
///
/// `push` never blocks: the camera callback runs on a real-time thread, so
/// when the pipeline falls behind the frame is dropped and counted instead.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<RawFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameSink {
    pub fn push(&self, frame: RawFrame) {
        if let Err(e) = self.tx.try_send(frame) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!("Encoder input queue full, dropped frame ({} total)", total);
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

/// Create the bounded frame-in channel shared by source and pipeline.
pub fn frame_channel(capacity: usize) -> (FrameSink, mpsc::Receiver<RawFrame>, Arc<AtomicU64>) {
    let (tx, rx) = mpsc::channel(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FrameSink {
            tx,
            dropped: dropped.clone(),
        },
        rx,
        dropped,
    )
}

/// A capture device driver. Runs on its own thread and owns its pacing.
pub trait FrameSource: Send {
    /// Deliver frames into `sink` until `stop` is set. Dropping the sink on
    /// return is what lets the pipeline drain.
    fn run(self: Box<Self>, sink: FrameSink, stop: Arc<AtomicBool>) -> Result<()>;
}

/// Configured source endpoint, parsed from the settings string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEndpoint {
    TestPattern,
}

impl FromStr for SourceEndpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "test-pattern" {
            return Ok(Self::TestPattern);
        }
        let url: Url = s.parse()?;
        match url.scheme() {
            "test-pattern" => Ok(Self::TestPattern),
            _ => bail!("Unsupported source scheme: {}", url.scheme()),
        }
    }
}
