//! Timing for the measurement loop.
//!
//! Time-based iterations are self-timed: each thread checks the clock once
//! per batch and grows its batch geometrically, so clock reads stay rare
//! relative to invocations without overshooting the target by much.

use std::time::{Duration, Instant};

/// Largest batch a time-based iteration issues between clock checks
pub const MAX_BATCH: u64 = 1 << 20;

/// Per-thread cap on retained SampleTime samples
pub const MAX_SAMPLES: usize = 64 * 1024;

/// Timer for measuring benchmark iterations
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[inline(always)]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since start
    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Batch sizing for time-based iterations.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    target: Duration,
    batch: u64,
}

impl BatchSizer {
    /// Sizer for an iteration lasting `target`
    pub fn new(target: Duration) -> Self {
        Self { target, batch: 1 }
    }

    /// Invocations in the next batch, or `None` once the target is reached.
    ///
    /// The batch doubles each round but never beyond the estimated number of
    /// invocations left.
    pub fn next(&mut self, ops: u64, elapsed: Duration) -> Option<u64> {
        if elapsed >= self.target {
            return None;
        }
        if ops == 0 {
            return Some(self.batch);
        }
        let per_op = elapsed.as_nanos() as f64 / ops as f64;
        let remaining = (self.target - elapsed).as_nanos() as f64;
        let estimate = if per_op > 0.0 {
            (remaining / per_op).ceil() as u64
        } else {
            u64::MAX
        };
        self.batch = (self.batch * 2).min(estimate).clamp(1, MAX_BATCH);
        Some(self.batch)
    }
}

/// Keeps a bounded, evenly spaced subset of per-invocation timings.
///
/// Every `stride`-th invocation is timed. When the buffer fills, every other
/// sample is dropped and the stride doubles.
#[derive(Debug, Clone)]
pub struct Sampler {
    samples: Vec<Duration>,
    stride: u64,
    seen: u64,
    capacity: usize,
}

impl Sampler {
    /// Sampler retaining at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            stride: 1,
            seen: 0,
            capacity: capacity.max(2),
        }
    }

    /// Whether the upcoming invocation should be timed
    #[inline]
    pub fn should_time(&mut self) -> bool {
        self.seen += 1;
        self.seen % self.stride == 0
    }

    /// Keep a timing
    pub fn push(&mut self, sample: Duration) {
        self.samples.push(sample);
        if self.samples.len() >= self.capacity {
            let mut index = 0;
            self.samples.retain(|_| {
                index += 1;
                index % 2 == 0
            });
            self.stride *= 2;
        }
    }

    /// Retained timings
    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_batch_doubles_then_stops() {
        let mut sizer = BatchSizer::new(Duration::from_millis(100));
        assert_eq!(sizer.next(0, Duration::ZERO), Some(1));
        assert_eq!(sizer.next(1, Duration::from_nanos(10)), Some(2));
        assert_eq!(sizer.next(3, Duration::from_nanos(30)), Some(4));
        assert_eq!(sizer.next(7, Duration::from_millis(100)), None);
    }

    #[test]
    fn test_batch_capped_by_remaining_estimate() {
        let mut sizer = BatchSizer::new(Duration::from_millis(10));
        sizer.next(0, Duration::ZERO);
        // 1ms per op with 9ms left: at most 9 more
        for _ in 0..10 {
            let batch = sizer.next(1, Duration::from_millis(1)).unwrap();
            assert!(batch <= 9);
        }
    }

    #[test]
    fn test_sampler_bounded() {
        let mut sampler = Sampler::new(8);
        let mut timed = 0;
        for i in 0..1000u64 {
            if sampler.should_time() {
                timed += 1;
                sampler.push(Duration::from_nanos(i));
            }
        }
        assert!(sampler.samples().len() < 8);
        assert!(timed < 1000);
        assert!(!sampler.samples().is_empty());
    }
}
