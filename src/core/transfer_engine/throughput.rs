//! Sliding-window rate and ETA for the file being copied.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// With no chunk for this long the transfer is reported as stalled.
pub const STALL_WINDOW: Duration = Duration::from_secs(5);

/// Span of samples the instantaneous rate is computed over.
const RATE_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub struct Throughput {
    samples: VecDeque<(Instant, u64)>,
    last_chunk: Option<Instant>,
    /// When the current file's streams were opened.
    started: Option<Instant>,
}

impl Throughput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk of `bytes` that arrived at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.last_chunk = Some(now);
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > RATE_WINDOW && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Forget everything and start measuring a new file at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.samples.clear();
        self.last_chunk = None;
        self.started = Some(now);
    }

    /// No chunk within the window, counted from the last chunk or, before
    /// the first one, from the start of the file.
    pub fn is_stalled(&self, now: Instant) -> bool {
        match self.last_chunk.or(self.started) {
            Some(at) => now.saturating_duration_since(at) >= STALL_WINDOW,
            None => false,
        }
    }

    /// Bytes per second over the window, zero while stalled.
    pub fn rate(&self, now: Instant) -> f64 {
        if self.is_stalled(now) {
            return 0.0;
        }
        let Some(&(first, _)) = self.samples.front() else {
            return 0.0;
        };
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let span = now.saturating_duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        bytes as f64 / span
    }

    /// Seconds until `remaining` bytes are done; `None` when unknown.
    pub fn eta(&self, now: Instant, remaining: u64) -> Option<u64> {
        if remaining == 0 {
            return Some(0);
        }
        let rate = self.rate(now);
        if rate <= 0.0 {
            return None;
        }
        Some((remaining as f64 / rate).ceil() as u64)
    }
}
