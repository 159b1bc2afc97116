use serde::{Deserialize, Serialize};

pub mod hls;

/// Basic details of a segment created or evicted by the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub filename: String,
    /// Segment index in the stream
    pub sequence: u64,
    /// Duration in seconds
    pub duration: f64,
    /// Muxed size in bytes
    pub size: usize,
}

#[derive(Debug)]
pub enum EgressResult {
    /// Nothing to report
    None,
    /// The publisher created/evicted some segments
    Segments {
        created: Vec<SegmentMeta>,
        evicted: Vec<SegmentMeta>,
    },
}
