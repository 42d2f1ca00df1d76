use std::sync::Mutex;
use std::time::{Duration, Instant};

use multichannel_protocol::{ChunkStatus, SessionStatus};

// ---------------------------------------------------------------------------
// ProgressAggregator
// ---------------------------------------------------------------------------

/// Folds per-chunk progress into a size-weighted session percentage.
///
/// Each chunk contributes the highest progress ever observed for it, so a
/// retried chunk whose own progress resets to 0 never pulls the aggregate
/// down. Safe to share between the scheduler and any number of readers.
pub struct ProgressAggregator {
    inner: Mutex<AggregatorInner>,
}

struct AggregatorInner {
    sizes: Vec<u64>,
    best: Vec<u8>,
    total_bytes: u64,
    reported: f64,
    terminal: Option<SessionStatus>,
}

impl AggregatorInner {
    fn compute(&self) -> f64 {
        if self.sizes.is_empty() {
            return 0.0;
        }
        if self.total_bytes == 0 {
            // Only zero-size chunks: weigh them equally.
            let sum: u64 = self.best.iter().map(|&p| p as u64).sum();
            return sum as f64 / self.best.len() as f64;
        }
        let weighted: u128 = self
            .sizes
            .iter()
            .zip(&self.best)
            .map(|(&size, &p)| size as u128 * p as u128)
            .sum();
        weighted as f64 / self.total_bytes as f64
    }
}

impl ProgressAggregator {
    /// Creates an aggregator for chunks of the given sizes, in index order.
    pub fn new(sizes: impl IntoIterator<Item = u64>) -> Self {
        let sizes: Vec<u64> = sizes.into_iter().collect();
        let total_bytes = sizes.iter().sum();
        let best = vec![0; sizes.len()];
        Self {
            inner: Mutex::new(AggregatorInner {
                sizes,
                best,
                total_bytes,
                reported: 0.0,
                terminal: None,
            }),
        }
    }

    /// Records the state of chunk `index` and returns the new aggregate.
    ///
    /// `Completed` counts as 100 regardless of `progress`; `Pending`,
    /// `Assigned` and `Failed` add nothing beyond what was seen before.
    pub fn observe(&self, index: usize, status: ChunkStatus, progress: u8) -> f64 {
        let mut s = self.inner.lock().unwrap();
        let contribution = match status {
            ChunkStatus::Completed => 100,
            ChunkStatus::Transferring => progress.min(100),
            ChunkStatus::Pending | ChunkStatus::Assigned | ChunkStatus::Failed => 0,
        };
        if let Some(best) = s.best.get_mut(index) {
            *best = (*best).max(contribution);
        }
        let computed = s.compute();
        s.reported = s.reported.max(computed);
        s.reported
    }

    /// Highest aggregate percentage reported so far (0-100).
    pub fn percent(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        s.reported
    }

    /// Total bytes across all chunks.
    pub fn total_bytes(&self) -> u64 {
        let s = self.inner.lock().unwrap();
        s.total_bytes
    }

    /// Records the terminal state.
    ///
    /// Returns `true` only for the first call, so the caller emits its
    /// terminal event exactly once.
    pub fn finish(&self, status: SessionStatus) -> bool {
        let mut s = self.inner.lock().unwrap();
        if s.terminal.is_some() {
            return false;
        }
        s.terminal = Some(status);
        true
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates channel throughput over a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
    total_bytes: u64,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
                total_bytes: 0,
            }),
        }
    }

    /// Records `bytes` moved at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });
        s.total_bytes += bytes;

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average bytes/second within the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        if s.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the window start; its bytes predate it.
        let bytes: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Bytes recorded since creation, including samples outside the window.
    pub fn total_bytes(&self) -> u64 {
        let s = self.inner.lock().unwrap();
        s.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn aggregate_is_size_weighted() {
        let agg = ProgressAggregator::new([300, 100]);
        assert_eq!(agg.observe(1, ChunkStatus::Completed, 0), 25.0);
        assert_eq!(agg.observe(0, ChunkStatus::Transferring, 50), 62.5);
        assert_eq!(agg.observe(0, ChunkStatus::Completed, 50), 100.0);
    }

    #[test]
    fn aggregate_never_decreases_after_retry() {
        let agg = ProgressAggregator::new([100, 100]);
        agg.observe(0, ChunkStatus::Transferring, 80);
        let before = agg.percent();
        assert_eq!(before, 40.0);

        // Attempt fails and the chunk starts over.
        assert_eq!(agg.observe(0, ChunkStatus::Failed, 0), before);
        assert_eq!(agg.observe(0, ChunkStatus::Pending, 0), before);
        assert_eq!(agg.observe(0, ChunkStatus::Transferring, 10), before);
        assert_eq!(agg.observe(0, ChunkStatus::Transferring, 90), 45.0);
    }

    #[test]
    fn out_of_order_completion() {
        let agg = ProgressAggregator::new([10, 10, 10, 10]);
        let mut last = 0.0;
        for index in [3, 0, 2, 1] {
            let p = agg.observe(index, ChunkStatus::Completed, 100);
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn zero_size_chunks_weigh_equally() {
        let agg = ProgressAggregator::new([0]);
        assert_eq!(agg.percent(), 0.0);
        assert_eq!(agg.observe(0, ChunkStatus::Completed, 0), 100.0);
    }

    #[test]
    fn unknown_index_is_ignored() {
        let agg = ProgressAggregator::new([10]);
        assert_eq!(agg.observe(7, ChunkStatus::Completed, 100), 0.0);
    }

    #[test]
    fn finish_reports_once() {
        let agg = ProgressAggregator::new([10]);
        assert!(agg.finish(SessionStatus::Cancelled));
        assert!(!agg.finish(SessionStatus::Failed));
        assert!(!agg.finish(SessionStatus::Cancelled));
    }

    #[test]
    fn aggregator_concurrent_observers() {
        use std::thread;

        let agg = Arc::new(ProgressAggregator::new(vec![1; 100]));
        let mut handles = vec![];
        for t in 0..4 {
            let a = Arc::clone(&agg);
            handles.push(thread::spawn(move || {
                let mut last = 0.0;
                for i in (t..100).step_by(4) {
                    let p = a.observe(i, ChunkStatus::Completed, 100);
                    assert!(p >= last);
                    last = p;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(agg.percent(), 100.0);
    }

    #[test]
    fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert_eq!(calc.total_bytes(), 0);
    }

    #[test]
    fn speed_calculator_single_sample() {
        let calc = SpeedCalculator::default();
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert_eq!(calc.total_bytes(), 100);
    }

    #[test]
    fn speed_calculator_multiple_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(500);
        std::thread::sleep(Duration::from_millis(50));
        calc.add_sample(500);

        assert!(calc.bytes_per_second() > 0.0);
        assert_eq!(calc.total_bytes(), 1000);
    }

    #[test]
    fn speed_calculator_max_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        let s = calc.inner.lock().unwrap();
        assert!(s.samples.len() <= 5);
    }
}
