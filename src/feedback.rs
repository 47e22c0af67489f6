//! Latency feedback loop.
//!
//! Callers report how long each admitted call took. On a fixed interval the
//! controller compares the recent mean against the target and nudges the
//! bucket's rate by a multiplicative step: down when responses are slow,
//! up when they are fast, unchanged inside the dead band.

use crate::limiter_config::LimiterConfig;
use crate::priority::Priority;
use crate::token_bucket::TokenBucket;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Smoothing factor for the reported moving averages
const EMA_ALPHA: f64 = 0.1;
/// Samples required before the first adjustment
pub const MIN_SAMPLES_FOR_ADJUSTMENT: usize = 10;
/// How many of the newest samples feed an adjustment
pub const RECENT_SAMPLES: usize = 20;
const SLOW_THRESHOLD: f64 = 1.2;
const FAST_THRESHOLD: f64 = 0.8;
/// Smaller changes are float noise and are not counted
const MIN_RATE_DELTA: f64 = 1e-3;

/// One completed call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseSample {
    pub timestamp: Instant,
    pub duration: Duration,
    pub success: bool,
    pub priority: Priority,
}

/// A rate change applied by `maybe_adjust`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateChange {
    pub previous: f64,
    pub current: f64,
    pub observed: Duration,
}

#[derive(Debug, Default)]
struct Averages {
    response_secs: Option<f64>,
    queue_wait_secs: Option<f64>,
}

fn ema(current: Option<f64>, sample: f64) -> f64 {
    match current {
        Some(avg) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * avg,
        None => sample,
    }
}

#[derive(Debug)]
pub struct FeedbackController {
    target: Duration,
    factor: f64,
    window_size: usize,
    interval: Duration,
    samples: RwLock<VecDeque<ResponseSample>>,
    averages: Mutex<Averages>,
    last_adjustment: Mutex<Option<Instant>>,
}

impl FeedbackController {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            target: config.target_response_time,
            factor: config.adjustment_factor,
            window_size: config.response_window_size.max(1),
            interval: config.adjustment_interval,
            samples: RwLock::new(VecDeque::with_capacity(config.response_window_size)),
            averages: Mutex::new(Averages::default()),
            last_adjustment: Mutex::new(None),
        }
    }

    /// Seed the response-time average, e.g. from persisted history
    pub fn restore_average(&self, average: Duration) {
        self.averages.lock().response_secs = Some(average.as_secs_f64());
    }

    pub fn record_response(&self, duration: Duration, success: bool, priority: Priority) {
        {
            let mut samples = self.samples.write();
            while samples.len() >= self.window_size {
                samples.pop_front();
            }
            samples.push_back(ResponseSample {
                timestamp: Instant::now(),
                duration,
                success,
                priority,
            });
        }

        let mut averages = self.averages.lock();
        averages.response_secs = Some(ema(averages.response_secs, duration.as_secs_f64()));
    }

    pub fn record_queue_wait(&self, waited: Duration) {
        let mut averages = self.averages.lock();
        averages.queue_wait_secs = Some(ema(averages.queue_wait_secs, waited.as_secs_f64()));
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        self.averages
            .lock()
            .response_secs
            .map(Duration::from_secs_f64)
    }

    pub fn average_queue_wait(&self) -> Option<Duration> {
        self.averages
            .lock()
            .queue_wait_secs
            .map(Duration::from_secs_f64)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.read().len()
    }

    pub fn samples(&self) -> Vec<ResponseSample> {
        self.samples.read().iter().copied().collect()
    }

    /// Mean duration of the successful calls among the newest samples
    fn recent_success_mean(&self) -> Option<Duration> {
        let samples = self.samples.read();
        let (total, count) = samples
            .iter()
            .rev()
            .take(RECENT_SAMPLES)
            .filter(|s| s.success)
            .fold((Duration::ZERO, 0u32), |(total, count), s| {
                (total + s.duration, count + 1)
            });

        if count == 0 {
            None
        } else {
            Some(total / count)
        }
    }

    /// Retune `bucket` if the interval has elapsed and enough samples exist.
    ///
    /// Returns the change when the rate moved by more than float noise.
    pub fn maybe_adjust(&self, now: Instant, bucket: &TokenBucket) -> Option<RateChange> {
        let mut last_adjustment = self.last_adjustment.lock();
        if let Some(last) = *last_adjustment {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        if self.sample_count() < MIN_SAMPLES_FOR_ADJUSTMENT {
            return None;
        }

        let observed = self.recent_success_mean()?;
        *last_adjustment = Some(now);

        let ratio = observed.as_secs_f64() / self.target.as_secs_f64();
        let previous = bucket.rate();
        let proposed = if ratio > SLOW_THRESHOLD {
            previous * (1.0 - self.factor)
        } else if ratio < FAST_THRESHOLD {
            previous * (1.0 + self.factor)
        } else {
            return None;
        };

        let current = bucket.set_rate(proposed);
        if (current - previous).abs() <= MIN_RATE_DELTA {
            return None;
        }

        tracing::info!(
            previous_rate = previous,
            new_rate = current,
            observed_ms = observed.as_millis() as u64,
            target_ms = self.target.as_millis() as u64,
            "adjusted admission rate"
        );

        Some(RateChange {
            previous,
            current,
            observed,
        })
    }
}
