//! Throttle: rate limiting for the designated input stream
//!
//! Paces a stream so its long-run throughput never exceeds
//! `sample_rate / slow_down_divisor`. Data passes through unchanged; only the
//! release time of each block is controlled.
//!
//! Pacing is "at most this fast": each block reserves `n / effective_rate`
//! seconds starting at the later of now and the end of the previous
//! reservation. The first block is released immediately, and a caller that
//! falls behind gets no catch-up burst.
//!
//! ```text
//!  block:     [ b0 ][ b1 ][ b2 ]        [ b3 ]
//!  release:   t0    t0+d0 t0+d0+d1      now (caller was late)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use uemix_core::throttle::{RateControl, RateLimiter};
//!
//! let control = Arc::new(RateControl::new(11_520_000.0, 4.0).unwrap());
//! assert_eq!(control.effective_rate(), 2_880_000.0);
//!
//! let mut limiter = RateLimiter::new(control.clone());
//! // First block is never delayed
//! assert!(limiter.compute_delay(1024).is_zero());
//!
//! control.set_slow_down_divisor(2.0).unwrap();
//! assert_eq!(control.effective_rate(), 5_760_000.0);
//! ```

use crate::endpoint::Shutdown;
use crate::error::{MixerError, MixerResult};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Longest pause the limiter will schedule for a single block.
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// One consistent set of rate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateParams {
    /// Nominal stream rate (samples/second)
    pub sample_rate: f64,
    /// Divisor applied to the nominal rate
    pub slow_down_divisor: f64,
    /// `sample_rate / slow_down_divisor`
    pub effective_rate: f64,
}

impl RateParams {
    /// Validate and derive the effective rate.
    pub fn new(sample_rate: f64, slow_down_divisor: f64) -> MixerResult<Self> {
        check_positive("sample_rate", sample_rate)?;
        check_positive("slow_down_divisor", slow_down_divisor)?;
        let effective_rate = sample_rate / slow_down_divisor;
        // The quotient can underflow even when both operands are valid
        if !(effective_rate.is_normal() && effective_rate > 0.0) {
            return Err(MixerError::InvalidParameter {
                name: "effective_rate",
                value: effective_rate,
            });
        }
        Ok(Self {
            sample_rate,
            slow_down_divisor,
            effective_rate,
        })
    }

    /// Time it takes to release `n` samples at the effective rate, capped at
    /// [`MAX_BLOCK_DURATION`].
    pub fn block_duration(&self, n: usize) -> Duration {
        Duration::try_from_secs_f64(n as f64 / self.effective_rate)
            .map_or(MAX_BLOCK_DURATION, |d| d.min(MAX_BLOCK_DURATION))
    }
}

fn check_positive(name: &'static str, value: f64) -> MixerResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MixerError::InvalidParameter { name, value })
    }
}

/// Shared, runtime-tunable rate parameters.
///
/// Readers always see one whole [`RateParams`] snapshot; setters validate
/// before publishing, so a rejected value leaves the previous one in place.
#[derive(Debug)]
pub struct RateControl {
    params: ArcSwap<RateParams>,
}

impl RateControl {
    pub fn new(sample_rate: f64, slow_down_divisor: f64) -> MixerResult<Self> {
        let params = RateParams::new(sample_rate, slow_down_divisor)?;
        Ok(Self {
            params: ArcSwap::from_pointee(params),
        })
    }

    /// Current snapshot.
    pub fn params(&self) -> RateParams {
        **self.params.load()
    }

    pub fn sample_rate(&self) -> f64 {
        self.params.load().sample_rate
    }

    pub fn slow_down_divisor(&self) -> f64 {
        self.params.load().slow_down_divisor
    }

    pub fn effective_rate(&self) -> f64 {
        self.params.load().effective_rate
    }

    /// Change the nominal rate; the effective rate follows.
    pub fn set_sample_rate(&self, sample_rate: f64) -> MixerResult<RateParams> {
        let updated = self.update(|p| RateParams::new(sample_rate, p.slow_down_divisor))?;
        info!(
            sample_rate = updated.sample_rate,
            effective_rate = updated.effective_rate,
            "sample rate changed"
        );
        Ok(updated)
    }

    /// Change the divisor; the effective rate follows.
    pub fn set_slow_down_divisor(&self, slow_down_divisor: f64) -> MixerResult<RateParams> {
        let updated = self.update(|p| RateParams::new(p.sample_rate, slow_down_divisor))?;
        info!(
            slow_down_divisor = updated.slow_down_divisor,
            effective_rate = updated.effective_rate,
            "slow-down divisor changed"
        );
        Ok(updated)
    }

    /// Publish `f(current)`; on error the current snapshot stays in place.
    fn update(
        &self,
        f: impl Fn(&RateParams) -> MixerResult<RateParams>,
    ) -> MixerResult<RateParams> {
        let mut outcome = None;
        self.params.rcu(|current| match f(current) {
            Ok(next) => {
                outcome = Some(Ok(next));
                Arc::new(next)
            }
            Err(e) => {
                outcome = Some(Err(e));
                Arc::clone(current)
            }
        });
        outcome.unwrap_or_else(|| Ok(self.params()))
    }
}

/// Per-stream pacing state reading a shared [`RateControl`].
#[derive(Debug)]
pub struct RateLimiter {
    control: Arc<RateControl>,
    /// Earliest instant the next block may be released
    next_release: Option<Instant>,
    total_samples: u64,
    start_time: Option<Instant>,
    shutdown: Shutdown,
}

impl RateLimiter {
    pub fn new(control: Arc<RateControl>) -> Self {
        Self {
            control,
            next_release: None,
            total_samples: 0,
            start_time: None,
            shutdown: Shutdown::new(),
        }
    }

    /// Attach the token that interrupts a pending delay.
    pub fn set_shutdown(&mut self, shutdown: &Shutdown) {
        self.shutdown = shutdown.clone();
    }

    pub fn control(&self) -> &Arc<RateControl> {
        &self.control
    }

    /// Reserve a release slot for `n` samples and return how long to wait.
    ///
    /// Uses the parameters current at the time of the call.
    pub fn compute_delay(&mut self, n: usize) -> Duration {
        let now = Instant::now();
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }

        let release = match self.next_release {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next_release = Some(release + self.control.params().block_duration(n));
        self.total_samples += n as u64;

        release - now
    }

    /// Wait for the block's release slot, then hand it back.
    ///
    /// Returns `None` if shutdown interrupted the wait.
    pub fn throttle<T: AsRef<[crate::types::Sample]>>(&mut self, block: T) -> Option<T> {
        let delay = self.compute_delay(block.as_ref().len());
        if self.shutdown.sleep(delay) {
            Some(block)
        } else {
            None
        }
    }

    /// Samples released since start or the last reset.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Measured throughput (samples/second).
    pub fn actual_rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_samples as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Forget pacing history; the next block is released immediately.
    pub fn reset(&mut self) {
        self.next_release = None;
        self.total_samples = 0;
        self.start_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{constant_block, Sample};
    use std::thread;

    fn limiter(rate: f64, divisor: f64) -> RateLimiter {
        RateLimiter::new(Arc::new(RateControl::new(rate, divisor).unwrap()))
    }

    #[test]
    fn test_effective_rate_updates() {
        let control = RateControl::new(1000.0, 2.0).unwrap();
        assert_eq!(control.effective_rate(), 500.0);

        control.set_slow_down_divisor(4.0).unwrap();
        assert_eq!(control.effective_rate(), 250.0);

        control.set_sample_rate(2000.0).unwrap();
        assert_eq!(control.effective_rate(), 500.0);
        assert_eq!(control.slow_down_divisor(), 4.0);
    }

    #[test]
    fn test_invalid_parameters_keep_previous() {
        let control = RateControl::new(1000.0, 4.0).unwrap();
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                control.set_slow_down_divisor(bad),
                Err(MixerError::InvalidParameter { name: "slow_down_divisor", .. })
            ));
            assert!(matches!(
                control.set_sample_rate(bad),
                Err(MixerError::InvalidParameter { name: "sample_rate", .. })
            ));
        }
        assert_eq!(control.effective_rate(), 250.0);
        assert!(RateControl::new(0.0, 1.0).is_err());
    }

    #[test]
    fn test_underflowing_effective_rate_rejected() {
        assert!(matches!(
            RateControl::new(1e-300, 1e300),
            Err(MixerError::InvalidParameter { name: "effective_rate", .. })
        ));

        // Each value alone is fine, their quotient is not
        let control = RateControl::new(1e-300, 1.0).unwrap();
        assert!(matches!(
            control.set_slow_down_divisor(1e300),
            Err(MixerError::InvalidParameter { name: "effective_rate", .. })
        ));
        assert_eq!(control.slow_down_divisor(), 1.0);
        assert_eq!(control.effective_rate(), 1e-300);
    }

    #[test]
    fn test_tiny_rate_saturates_instead_of_panicking() {
        let mut limiter = limiter(1e-300, 1.0);
        assert_eq!(limiter.compute_delay(4), Duration::ZERO);
        let delay = limiter.compute_delay(4);
        assert!(delay <= MAX_BLOCK_DURATION);
        assert!(delay > MAX_BLOCK_DURATION - Duration::from_secs(1));
        assert_eq!(
            limiter.control().params().block_duration(usize::MAX),
            MAX_BLOCK_DURATION
        );
    }

    #[test]
    fn test_first_call_has_no_delay() {
        let mut limiter = limiter(1000.0, 1.0);
        assert_eq!(limiter.compute_delay(500), Duration::ZERO);
        // The second block waits for the first one's slot
        let delay = limiter.compute_delay(500);
        assert!(delay > Duration::from_millis(400), "{:?}", delay);
        assert!(delay <= Duration::from_millis(500));
        assert_eq!(limiter.total_samples(), 1000);
    }

    #[test]
    fn test_throughput_lower_bound() {
        // N blocks of B samples take at least (N-1)*B / R
        let mut limiter = limiter(40_000.0, 2.0);
        let block = constant_block(Sample::new(1.0, 0.0), 200);
        let n = 6;

        let start = Instant::now();
        for _ in 0..n {
            let out = limiter.throttle(block.clone()).unwrap();
            assert_eq!(out, block);
        }
        let elapsed = start.elapsed().as_secs_f64();
        let bound = (n - 1) as f64 * 200.0 / 20_000.0;
        assert!(elapsed >= bound, "{} < {}", elapsed, bound);
    }

    #[test]
    fn test_no_catch_up_after_stall() {
        let mut limiter = limiter(1000.0, 1.0);
        limiter.compute_delay(10);
        thread::sleep(Duration::from_millis(50));
        // The caller fell behind; the next release is now, not in the past
        assert_eq!(limiter.compute_delay(10), Duration::ZERO);
        let delay = limiter.compute_delay(10);
        assert!(delay > Duration::from_millis(5) && delay <= Duration::from_millis(10));
    }

    #[test]
    fn test_divisor_change_applies_to_next_decision() {
        let control = Arc::new(RateControl::new(1000.0, 1.0).unwrap());
        let mut limiter = RateLimiter::new(control.clone());
        limiter.compute_delay(100);
        control.set_slow_down_divisor(10.0).unwrap();
        limiter.compute_delay(100);
        // 100 samples at 100 samples/s
        let delay = limiter.compute_delay(1);
        assert!(delay > Duration::from_millis(900), "{:?}", delay);
    }

    #[test]
    fn test_reset() {
        let mut limiter = limiter(100.0, 1.0);
        limiter.compute_delay(50);
        limiter.reset();
        assert_eq!(limiter.total_samples(), 0);
        assert_eq!(limiter.compute_delay(50), Duration::ZERO);
        assert_eq!(limiter.actual_rate(), 0.0);
    }

    #[test]
    fn test_shutdown_interrupts_delay() {
        let mut limiter = limiter(10.0, 1.0);
        let shutdown = Shutdown::new();
        limiter.set_shutdown(&shutdown);
        let block = constant_block(Sample::new(0.0, 0.0), 100);

        assert!(limiter.throttle(block.clone()).is_some());
        shutdown.trigger();
        let start = Instant::now();
        assert!(limiter.throttle(block).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_concurrent_reads_see_whole_snapshots() {
        let control = Arc::new(RateControl::new(1000.0, 1.0).unwrap());
        let writer = {
            let control = control.clone();
            thread::spawn(move || {
                for i in 1..2000 {
                    control.set_slow_down_divisor(1.0 + (i % 7) as f64).unwrap();
                    control.set_sample_rate(1000.0 * (1 + i % 5) as f64).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let control = control.clone();
                thread::spawn(move || {
                    for _ in 0..5000 {
                        let p = control.params();
                        assert_eq!(p.effective_rate, p.sample_rate / p.slow_down_divisor);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
