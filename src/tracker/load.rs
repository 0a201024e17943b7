//! Host load monitoring for the adaptive scheduler budget
//!
//! The host reports how long each simulation tick took; observers report
//! their latency through the per-tick observer views. Both are reduced to a
//! [`LoadSample`] before the scheduler runs.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::scheduler::LoadSample;

/// Default number of tick samples kept (~5 seconds at 20Hz)
const DEFAULT_MAX_SAMPLES: usize = 100;

/// Minimum samples before the rolling average is trusted
const MIN_SAMPLES: usize = 5;

/// Rolling window of host tick durations
pub struct LoadMonitor {
    tick_durations: VecDeque<Duration>,
    max_samples: usize,
    /// Target tick duration (budget)
    target_tick_duration: Duration,
    tick_start: Option<Instant>,
}

impl LoadMonitor {
    pub fn new(tick_rate: u32) -> Self {
        Self::with_window(tick_rate, DEFAULT_MAX_SAMPLES)
    }

    pub fn with_window(tick_rate: u32, max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            tick_durations: VecDeque::with_capacity(max_samples),
            max_samples,
            target_tick_duration: Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64),
            tick_start: None,
        }
    }

    /// Start timing a host tick
    pub fn tick_start(&mut self) {
        self.tick_start = Some(Instant::now());
    }

    /// End timing a host tick and record the duration
    pub fn tick_end(&mut self) {
        if let Some(start) = self.tick_start.take() {
            self.record_tick(start.elapsed());
        }
    }

    /// Record a host tick duration measured elsewhere
    pub fn record_tick(&mut self, duration: Duration) {
        self.tick_durations.push_back(duration);
        while self.tick_durations.len() > self.max_samples {
            self.tick_durations.pop_front();
        }
    }

    /// Average tick duration, zero until enough samples exist
    pub fn average_tick_duration(&self) -> Duration {
        if self.tick_durations.len() < MIN_SAMPLES {
            return Duration::ZERO;
        }
        let sum: Duration = self.tick_durations.iter().sum();
        sum / self.tick_durations.len() as u32
    }

    /// Get the 95th percentile tick duration
    pub fn p95_tick_duration(&self) -> Duration {
        if self.tick_durations.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.tick_durations.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    /// Get budget usage as percentage (0-100+)
    pub fn budget_usage_percent(&self) -> f32 {
        let avg = self.average_tick_duration();
        (avg.as_secs_f32() / self.target_tick_duration.as_secs_f32()) * 100.0
    }

    /// Combine tick history with the mean of `latencies_ms`
    pub fn sample<I>(&self, latencies_ms: I) -> LoadSample
    where
        I: IntoIterator<Item = f64>,
    {
        let (sum, count) = latencies_ms
            .into_iter()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .fold((0.0, 0usize), |(sum, count), ms| (sum + ms, count + 1));
        LoadSample {
            average_tick: self.average_tick_duration(),
            average_latency_ms: if count == 0 { 0.0 } else { sum / count as f64 },
        }
    }

    pub fn clear(&mut self) {
        self.tick_durations.clear();
        self.tick_start = None;
    }
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new(20)
    }
}
