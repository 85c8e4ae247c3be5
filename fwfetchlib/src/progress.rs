use std::{
    fmt,
    time::Duration,
};

use crate::{
    session::BinaryFileInfo,
    throughput::ThroughputMeter,
};

/// One sequential stage of an acquisition, each with its own progress and
/// throughput tracking.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    /// Session handshake and metadata requests. Reported as a single unit.
    Connecting,
    Download,
    Crc32,
    Md5,
    Decrypt,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Download => "Downloading",
            Self::Crc32 => "Verifying CRC32",
            Self::Md5 => "Verifying MD5",
            Self::Decrypt => "Decrypting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Progress of the active phase.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Progress {
    pub current: u64,
    /// Total units of work in the phase. Never 0; phases without a meaningful
    /// size use 1.
    pub max: u64,
    /// Smoothed throughput in units (bytes) per second
    pub speed: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub progress: Progress,
}

/// Receives job events as they happen. Callbacks run on the job's task,
/// potentially once per I/O chunk, so implementations must return quickly.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);

    /// Called once the firmware metadata is known, before the download starts.
    fn on_binary_info(&self, _info: &BinaryFileInfo) {}
}

/// Per-phase progress accumulator. Clamps positions to the phase size, keeps
/// them non-decreasing, and attaches a sliding-window throughput figure to
/// every report.
pub struct ProgressReporter<F> {
    max: u64,
    current: u64,
    meter: ThroughputMeter,
    callback: F,
}

impl<F: FnMut(Progress)> ProgressReporter<F> {
    pub fn new(max: u64, window: Duration, callback: F) -> Self {
        Self {
            max: max.max(1),
            current: 0,
            meter: ThroughputMeter::new(window),
            callback,
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Report the absolute position within the phase.
    pub fn report(&mut self, current: u64) {
        self.current = current.clamp(self.current, self.max);
        self.meter.record(self.current);

        (self.callback)(Progress {
            current: self.current,
            max: self.max,
            speed: self.meter.units_per_sec(),
        });
    }

    pub fn advance(&mut self, delta: u64) {
        self.report(self.current.saturating_add(delta));
    }
}
