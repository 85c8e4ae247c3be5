use std::{
    fmt,
    time::Duration,
};

use number_prefix::NumberPrefix;

/// Byte count in base 2 units.
#[derive(Clone, Copy, Debug)]
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(number) => write!(f, "{number:.0}B"),
            NumberPrefix::Prefixed(prefix, number) => write!(f, "{number:.2}{prefix}B"),
        }
    }
}

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;

/// Whole-second duration as its largest two units, eg. `1h 5m` or `42s`.
/// Used for ETAs, where more precision is noise.
#[derive(Clone, Copy, Debug)]
pub struct ShortDuration(pub Duration);

impl fmt::Display for ShortDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let (h, m, s) = (secs / SECS_PER_HOUR, secs % SECS_PER_HOUR / SECS_PER_MINUTE, secs % SECS_PER_MINUTE);

        if h > 0 {
            write!(f, "{h}h {m}m")
        } else if m > 0 {
            write!(f, "{m}m {s}s")
        } else {
            write!(f, "{s}s")
        }
    }
}

/// Whole-second duration in `HH:MM:SS` form. Hours are not wrapped.
#[derive(Clone, Copy, Debug)]
pub struct ClockDuration(pub Duration);

impl fmt::Display for ClockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();

        write!(
            f,
            "{:02}:{:02}:{:02}",
            secs / SECS_PER_HOUR,
            secs % SECS_PER_HOUR / SECS_PER_MINUTE,
            secs % SECS_PER_MINUTE,
        )
    }
}
