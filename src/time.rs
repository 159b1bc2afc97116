use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Timescale of all muxed video tracks.
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// A rational media timestamp, `value / timescale` seconds.
///
/// Frame sources deliver timestamps in whatever timebase the capture device
/// uses; nothing upstream of the muxer assumes 90 kHz. Equality and
/// ordering compare the represented instant, not the encoding.
#[derive(Clone, Copy, Debug)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

impl MediaTime {
    pub fn new(value: i64, timescale: u32) -> Self {
        debug_assert!(timescale > 0);
        Self { value, timescale }
    }

    pub fn zero() -> Self {
        Self::new(0, VIDEO_TIMESCALE)
    }

    pub fn as_seconds(&self) -> f64 {
        self.value as f64 / self.timescale as f64
    }

    /// Convert to another timescale, rounding toward zero.
    pub fn rescale(&self, timescale: u32) -> i64 {
        if self.timescale == timescale {
            return self.value;
        }
        // i128 division truncates toward zero, matching the tfdt contract.
        (self.value as i128 * timescale as i128 / self.timescale as i128) as i64
    }

    /// `self - rhs` in this value's timescale; `rhs` is rebased first.
    pub fn checked_sub(&self, rhs: &MediaTime) -> Option<MediaTime> {
        let rhs_value = rhs.rescale(self.timescale);
        Some(MediaTime::new(
            self.value.checked_sub(rhs_value)?,
            self.timescale,
        ))
    }

    pub fn checked_add(&self, rhs: &MediaTime) -> Option<MediaTime> {
        let rhs_value = rhs.rescale(self.timescale);
        Some(MediaTime::new(
            self.value.checked_add(rhs_value)?,
            self.timescale,
        ))
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.value as i128 * other.timescale as i128;
        let rhs = other.value as i128 * self.timescale as i128;
        lhs.cmp(&rhs)
    }
}

impl Display for MediaTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}s", self.as_seconds())
    }
}
