//! Synthetic frame source: a sliding gradient with a per-frame luma band,
//! paced against the wall clock. Lets the whole pipeline run on machines
//! without a capture device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use log::info;

use crate::fraction::Fraction;
use crate::ingress::{FrameSink, FrameSource, PixelBuffer, RawFrame};
use crate::time::MediaTime;

pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: Fraction,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: Fraction) -> Self {
        Self { width, height, fps }
    }

    fn render(&self, index: i64) -> PixelBuffer {
        let w = self.width as usize;
        let h = self.height as usize;
        let phase = (index * 3) as usize;

        let mut y = vec![0u8; w * h];
        for (row, line) in y.chunks_mut(w).enumerate() {
            for (col, px) in line.iter_mut().enumerate() {
                *px = (((col * 255) / w + phase) & 0xFF) as u8;
            }
            // moving band makes every frame distinct
            if row == (phase / 2) % h {
                line.fill(0xEB);
            }
        }

        let cw = w / 2;
        let ch = h / 2;
        let mut u = vec![0u8; cw * ch];
        let mut v = vec![128u8; cw * ch];
        for (row, line) in u.chunks_mut(cw).enumerate() {
            let value = ((row * 255) / ch.max(1)) as u8;
            line.fill(value);
        }
        for (row, line) in v.chunks_mut(cw).enumerate() {
            line.fill((((row * 128) / ch.max(1)) + phase) as u8);
        }

        PixelBuffer {
            y: Bytes::from(y),
            u: Bytes::from(u),
            v: Bytes::from(v),
            y_stride: w,
            chroma_stride: cw,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn run(self: Box<Self>, sink: FrameSink, stop: Arc<AtomicBool>) -> Result<()> {
        // The test pattern keeps its own timebase (fps * 1000) to exercise
        // the rescaling path; nothing downstream assumes 90 kHz input.
        let (frame_ticks, timescale) = self.fps.frame_duration(1_000);
        let frame_interval = Duration::from_secs_f64(frame_ticks as f64 / timescale as f64);
        info!(
            "Test pattern source: {}x{} @ {:.2} fps",
            self.width,
            self.height,
            self.fps.as_f32()
        );

        let started = Instant::now();
        let mut index = 0i64;
        while !stop.load(Ordering::Relaxed) {
            sink.push(RawFrame {
                width: self.width,
                height: self.height,
                pixels: self.render(index),
                presentation_time: MediaTime::new(index * frame_ticks, timescale),
                duration: MediaTime::new(frame_ticks, timescale),
            });
            index += 1;

            let next_due = frame_interval * index as u32;
            let elapsed = started.elapsed();
            if next_due > elapsed {
                std::thread::sleep(next_due - elapsed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_timestamped_and_distinct() {
        let src = TestPatternSource::new(64, 36, Fraction::from((15, 1)));
        let a = src.render(0);
        let b = src.render(1);
        assert_eq!(a.y.len(), 64 * 36);
        assert_eq!(a.u.len(), 32 * 18);
        assert_ne!(a.y, b.y);
    }
}
