//! Conversion between wire-native clocks and the canonical [`Duration`] domain.
//!
//! All conversions go through `u128` nanoseconds so that long-running live
//! sessions never accumulate floating point drift.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// MPEG-TS presentation/decode timestamps run at 90 kHz.
pub const MPEG_CLOCK_RATE: u32 = 90_000;

/// `ticks * 1s / clock_rate`, truncated to whole nanoseconds.
pub fn ticks_to_duration(ticks: u64, clock_rate: u32) -> Duration {
    if clock_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = ticks as u128 * NANOS_PER_SEC / clock_rate as u128;
    duration_from_nanos(nanos)
}

/// Inverse of [`ticks_to_duration`], rounded to the nearest tick.
pub fn duration_to_ticks(duration: Duration, clock_rate: u32) -> u64 {
    let nanos = duration.as_nanos();
    let ticks = (nanos * clock_rate as u128 + NANOS_PER_SEC / 2) / NANOS_PER_SEC;
    ticks.min(u64::MAX as u128) as u64
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = (nanos / NANOS_PER_SEC).min(u64::MAX as u128) as u64;
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

/// Extends a wrapping N-bit counter (33-bit PTS, 32-bit RTP or RTMP time)
/// into a monotonic 64-bit value.
#[derive(Debug, Clone)]
pub struct TimestampUnwrapper {
    bits: u32,
    last: Option<u64>,
}

impl TimestampUnwrapper {
    pub fn new(bits: u32) -> Self {
        Self { bits, last: None }
    }

    pub fn unwrap(&mut self, raw: u64) -> u64 {
        let modulus = 1u64 << self.bits;
        let half = modulus / 2;
        let raw = raw & (modulus - 1);

        let extended = match self.last {
            None => raw,
            Some(last) => {
                let mut candidate = (last & !(modulus - 1)) | raw;
                if candidate + half < last {
                    candidate += modulus;
                } else if candidate > last + half && candidate >= modulus {
                    candidate -= modulus;
                }
                candidate
            }
        };
        self.last = Some(extended);
        extended
    }
}

/// Rebases every timestamp of one client onto the first decode time it saw,
/// shared by all tracks so that audio and video stay aligned.
#[derive(Debug, Default, Clone)]
pub struct TimeBase {
    origin: Option<Duration>,
}

impl TimeBase {
    pub fn rebase(&mut self, time: Duration) -> Duration {
        let origin = *self.origin.get_or_insert(time);
        time.saturating_sub(origin)
    }

    pub fn is_set(&self) -> bool {
        self.origin.is_some()
    }
}
