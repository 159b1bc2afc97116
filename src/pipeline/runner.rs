//! The pipeline thread: pulls raw frames off the bounded ingest queue,
//! runs them through the encoder and forwards every event to the
//! assembler. The assembler only ever runs here, which is what gives the
//! ordering guarantees between parameter sets, frames and segments.

use anyhow::Result;
use log::{error, info};
use tokio::sync::mpsc::{unbounded_channel, Receiver, UnboundedReceiver};

use crate::egress::hls::HlsPublisher;
use crate::encode::{EncoderBackend, EncoderEvent, EncoderFault, H264Encoder, KeyframeRequest};
use crate::ingress::RawFrame;
use crate::pipeline::{PipelineConfig, SegmentAssembler};
use std::sync::Arc;

pub struct PipelineRunner {
    frames: Receiver<RawFrame>,
    encoder: H264Encoder,
    events: UnboundedReceiver<EncoderEvent>,
    assembler: SegmentAssembler,
}

impl PipelineRunner {
    /// Build the encoder on the calling (pipeline) thread. A backend
    /// setup failure is pushed to the publisher path as a setup fault
    /// before this returns the error to the spawner.
    pub fn new<F>(
        config: PipelineConfig,
        backend_factory: F,
        publisher: Arc<HlsPublisher>,
        frames: Receiver<RawFrame>,
        keyframe: KeyframeRequest,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn EncoderBackend>>,
    {
        let (events_tx, events_rx) = unbounded_channel();
        let mut assembler = SegmentAssembler::new(config.clone(), publisher);

        let backend = match backend_factory() {
            Ok(backend) => backend,
            Err(e) => {
                assembler.handle_event(EncoderEvent::Fault(EncoderFault::Setup));
                return Err(e);
            }
        };

        // the cadence timer holds a clone of the keyframe handle
        let encoder = H264Encoder::new(config.video, backend, events_tx, keyframe);

        Ok(Self {
            frames,
            encoder,
            events: events_rx,
            assembler,
        })
    }

    /// Run until the frame channel closes (source stopped) or the encoder
    /// session dies. Either way the assembler drains before returning.
    pub fn run(&mut self) {
        loop {
            match self.frames.blocking_recv() {
                Some(frame) => {
                    let result = self.encoder.encode_frame(&frame);
                    self.forward_events();
                    if let Err(e) = result {
                        error!("Encoder session failed: {}", e);
                        break;
                    }
                }
                None => {
                    info!("Frame source closed, draining pipeline");
                    break;
                }
            }
        }
        let _ = self.encoder.flush();
        self.forward_events();
        self.assembler.finish();
    }

    fn forward_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.assembler.handle_event(event);
        }
    }
}
