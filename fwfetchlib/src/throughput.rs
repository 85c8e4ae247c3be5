use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Default period over which throughput is averaged. Short enough that a
/// stalled connection shows up within a few seconds.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// Smallest usable window. Records older than the window are only dropped
/// when the window is non-zero.
pub const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Sliding-window rate estimator. Progress positions are recorded with their
/// timestamps and the rate is computed between the oldest and newest record
/// still inside the window.
#[derive(Debug)]
pub struct ThroughputMeter {
    window: Duration,
    buf: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(MIN_WINDOW),
            buf: VecDeque::new(),
        }
    }

    /// Forget all records, eg. when a new phase starts.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn record(&mut self, position: u64) {
        self.record_at(Instant::now(), position);
    }

    /// Record a position at a specific point in time. Positions must not
    /// decrease between [`Self::reset`] calls.
    pub fn record_at(&mut self, now: Instant, position: u64) {
        self.buf.push_back((now, position));

        // Keep the newest record that is already outside the window so the
        // computed rate always spans the full window once enough time passed.
        let end = self.buf
            .iter()
            .position(|x| now.saturating_duration_since(x.0) < self.window)
            .and_then(|x| x.checked_sub(1));
        if let Some(v) = end {
            self.buf.drain(0..v);
        }
    }

    /// Rate in units per second, or 0 if there are not enough records yet.
    pub fn units_per_sec(&self) -> u64 {
        if let (Some(f), Some(b)) = (self.buf.front(), self.buf.back()) {
            let elapsed = b.0.saturating_duration_since(f.0).as_secs_f64();
            if elapsed > 0.0 {
                return (b.1.saturating_sub(f.1) as f64 / elapsed) as u64;
            }
        }

        0
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
