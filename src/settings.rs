use serde::{Deserialize, Serialize};

use crate::encode::EncoderConfig;
use crate::pipeline::PipelineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP listen address
    ///
    /// - 0.0.0.0:8080
    pub listen: String,

    /// Frame source endpoint
    ///
    /// - test-pattern
    pub source: String,

    /// Encoder backend and rendition parameters
    pub encoder: EncoderSettings,

    /// Segmentation / playlist window tuning
    #[serde(default)]
    pub segmenter: SegmenterSettings,

    /// Directory holding the player bundle (player.html, css/, js/)
    pub player_dir: String,

    /// Title shown by the player page
    #[serde(default = "default_app_title")]
    pub app_title: String,

    /// Optional UDP address receiving forwarded log lines
    ///
    /// - 127.0.0.1:9999
    pub log_forward: Option<String>,

    /// Seconds the final playlist stays up after the stream ends before
    /// the namespace answers 410
    #[serde(default = "default_end_grace")]
    pub end_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub backend: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub bitrate: u32,
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterSettings {
    /// Wall-clock segment cadence in seconds
    #[serde(default = "default_target_seconds")]
    pub target_seconds: f64,

    /// Minimum keyframe-led run length worth a segment
    #[serde(default = "default_min_seconds")]
    pub min_seconds: f64,

    /// Rolling playlist window size in segments
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Frame-in queue depth before frames are dropped
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            target_seconds: default_target_seconds(),
            min_seconds: default_min_seconds(),
            window_size: default_window_size(),
            frame_queue: default_frame_queue(),
        }
    }
}

fn default_app_title() -> String {
    "selfcast".to_string()
}

fn default_end_grace() -> u64 {
    10
}

fn default_keyframe_interval() -> u32 {
    120
}

fn default_target_seconds() -> f64 {
    1.0
}

fn default_min_seconds() -> f64 {
    0.5
}

fn default_window_size() -> usize {
    10
}

fn default_frame_queue() -> usize {
    8
}

impl Settings {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            video: EncoderConfig {
                width: self.encoder.width,
                height: self.encoder.height,
                frame_rate: self.encoder.frame_rate,
                bitrate: self.encoder.bitrate,
                keyframe_interval: self.encoder.keyframe_interval,
            },
            target_segment_seconds: self.segmenter.target_seconds,
            min_segment_seconds: self.segmenter.min_seconds,
            window_size: self.segmenter.window_size,
            frame_queue: self.segmenter.frame_queue,
        }
    }
}
