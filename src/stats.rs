//! Receive-rate and latency accounting over one-second windows

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Figures for one completed window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    pub fps: u32,
    pub avg_latency: Duration,
    pub max_latency: Duration,
}

/// Counts frames and transmission latency, reporting once per second
pub struct FrameStats {
    window_start: Instant,
    frames: u32,
    latency_sum: Duration,
    latency_max: Duration,
    last: Option<StatsReport>,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::start_at(Instant::now())
    }
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_at(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
            latency_sum: Duration::ZERO,
            latency_max: Duration::ZERO,
            last: None,
        }
    }

    /// Count one received frame
    ///
    /// Returns the report of the window this frame closed, if any.
    pub fn record(&mut self, latency: Duration) -> Option<StatsReport> {
        self.record_at(Instant::now(), latency)
    }

    pub fn record_at(&mut self, now: Instant, latency: Duration) -> Option<StatsReport> {
        self.frames += 1;
        self.latency_sum += latency;
        self.latency_max = self.latency_max.max(latency);

        if now.saturating_duration_since(self.window_start) < WINDOW {
            return None;
        }

        let report = StatsReport {
            fps: self.frames,
            avg_latency: self.latency_sum / self.frames,
            max_latency: self.latency_max,
        };
        self.window_start = now;
        self.frames = 0;
        self.latency_sum = Duration::ZERO;
        self.latency_max = Duration::ZERO;
        self.last = Some(report);
        Some(report)
    }

    /// Report of the most recently completed window
    pub fn last_report(&self) -> Option<StatsReport> {
        self.last
    }
}
