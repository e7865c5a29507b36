use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-run counters and rolling step timings for the sampling loop.
pub struct RunMetrics {
    step_micros: VecDeque<u32>,
    capacity: usize,
    steps_completed: u64,
    snapshots_written: u64,
    snapshot_failures: u64,
    bytes_written: u64,
    checkpoints_evicted: u64,
    pauses: u64,
    window_start: Instant,
    window_count: usize,
    window_paused_micros: u128, // time spent blocked on PAUSE, excluded from throughput
}

impl RunMetrics {
    pub fn with_capacity(capacity: usize) -> Self {
        RunMetrics {
            step_micros: VecDeque::with_capacity(capacity),
            capacity,
            steps_completed: 0,
            snapshots_written: 0,
            snapshot_failures: 0,
            bytes_written: 0,
            checkpoints_evicted: 0,
            pauses: 0,
            window_start: Instant::now(),
            window_count: 0,
            window_paused_micros: 0,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn record_step(&mut self, d: Duration) {
        self.step_micros.push_back(d.as_micros().min(u32::MAX as u128) as u32);
        if self.step_micros.len() > self.capacity {
            self.step_micros.pop_front();
        }
        self.steps_completed += 1;
        self.window_count += 1;
    }

    pub fn record_snapshot(&mut self, size_bytes: u64) {
        self.snapshots_written += 1;
        self.bytes_written += size_bytes;
    }

    pub fn record_snapshot_failure(&mut self) {
        self.snapshot_failures += 1;
    }

    pub fn record_eviction(&mut self, count: usize) {
        self.checkpoints_evicted += count as u64;
    }

    /// Record one pause and the time spent blocked in it.
    pub fn record_pause(&mut self, blocked: Duration) {
        self.pauses += 1;
        self.window_paused_micros += blocked.as_micros();
    }

    /// Mean of the last `last_n` step times in milliseconds.
    pub fn avg_step_ms(&self, last_n: usize) -> f32 {
        let n = self.step_micros.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let mean = self
            .step_micros
            .iter()
            .rev()
            .take(n)
            .map(|&v| v as f64)
            .sum::<f64>()
            / n as f64;
        (mean / 1000.0) as f32
    }

    /// Steps per second since the last `reset_window`, not counting paused time.
    pub fn steps_per_sec(&self) -> f32 {
        let total_micros = self.window_start.elapsed().as_micros();
        let net_micros = total_micros.saturating_sub(self.window_paused_micros);
        if net_micros == 0 {
            return 0.0;
        }
        self.window_count as f32 / (net_micros as f32 / 1_000_000.0)
    }

    pub fn reset_window(&mut self) {
        self.window_start = Instant::now();
        self.window_count = 0;
        self.window_paused_micros = 0;
    }

    pub fn steps_completed(&self) -> u64 {
        self.steps_completed
    }

    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written
    }

    pub fn snapshot_failures(&self) -> u64 {
        self.snapshot_failures
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn checkpoints_evicted(&self) -> u64 {
        self.checkpoints_evicted
    }

    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_step_ms_last_n() {
        let mut m = RunMetrics::new();
        m.record_step(Duration::from_micros(1000));
        m.record_step(Duration::from_micros(9000));
        m.record_step(Duration::from_micros(5000));
        assert!((m.avg_step_ms(1) - 5.0).abs() < 1e-3);
        assert!((m.avg_step_ms(100) - 5.0).abs() < 1e-3);
        assert_eq!(m.steps_completed(), 3);
    }

    #[test]
    fn test_timing_window_is_bounded() {
        let mut m = RunMetrics::with_capacity(2);
        m.record_step(Duration::from_micros(10_000));
        m.record_step(Duration::from_micros(2000));
        m.record_step(Duration::from_micros(4000));
        assert!((m.avg_step_ms(100) - 3.0).abs() < 1e-3);
        assert_eq!(m.steps_completed(), 3);
    }

    #[test]
    fn test_counters() {
        let mut m = RunMetrics::new();
        m.record_snapshot(100);
        m.record_snapshot(50);
        m.record_snapshot_failure();
        m.record_eviction(3);
        m.record_pause(Duration::from_millis(1));
        assert_eq!(m.snapshots_written(), 2);
        assert_eq!(m.bytes_written(), 150);
        assert_eq!(m.snapshot_failures(), 1);
        assert_eq!(m.checkpoints_evicted(), 3);
        assert_eq!(m.pauses(), 1);
    }

    #[test]
    fn test_paused_time_excluded_from_throughput() {
        let mut m = RunMetrics::new();
        for _ in 0..5 {
            m.record_step(Duration::from_micros(1000));
        }
        m.record_pause(Duration::from_secs(9999));
        assert_eq!(m.steps_per_sec(), 0.0);

        m.reset_window();
        m.record_step(Duration::from_micros(1000));
        std::thread::sleep(Duration::from_millis(5));
        assert!(m.steps_per_sec() > 0.0);
    }
}
