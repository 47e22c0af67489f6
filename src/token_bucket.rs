use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Token bucket with lazy refill.
///
/// Refill is computed from elapsed time whenever the bucket is touched, always
/// inside the same critical section as the read or subtraction that follows it,
/// so concurrent acquirers can never spend the same token twice.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    min_rate: f64,
    max_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: u32) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed > Duration::from_millis(1) {
            let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();

            // Prevent overflow by capping at capacity
            self.tokens = (self.tokens + tokens_to_add).min(capacity as f64);
            self.last_refill = now;
        }
    }
}

impl TokenBucket {
    /// A full bucket whose rate may be set anywhere at or above zero
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::with_bounds(capacity, refill_rate, 0.0, f64::MAX)
    }

    /// A full bucket whose rate is held within `[min_rate, max_rate]`
    pub fn with_bounds(capacity: u32, refill_rate: f64, min_rate: f64, max_rate: f64) -> Self {
        let min_rate = min_rate.max(0.0);
        let max_rate = max_rate.max(min_rate);
        Self {
            capacity,
            min_rate,
            max_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                refill_rate: refill_rate.clamp(min_rate, max_rate),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `tokens` if they are available right now. Never blocks.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let mut state = self.state.lock();
        state.refill(self.capacity);

        if state.tokens >= tokens as f64 {
            state.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }

    /// Return tokens taken for work that never ran
    pub fn release(&self, tokens: u32) {
        let mut state = self.state.lock();
        state.refill(self.capacity);
        state.tokens = (state.tokens + tokens as f64).min(self.capacity as f64);
    }

    /// Current (refreshed) token count, possibly fractional
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(self.capacity);
        state.tokens
    }

    /// How long until `required_tokens` would have accumulated at the current rate.
    ///
    /// Zero when already satisfiable, `Duration::MAX` when the rate is zero.
    pub fn estimated_wait(&self, required_tokens: u32) -> Duration {
        let mut state = self.state.lock();
        state.refill(self.capacity);

        if state.tokens >= required_tokens as f64 {
            return Duration::ZERO;
        }
        if state.refill_rate <= 0.0 {
            return Duration::MAX;
        }

        let tokens_needed = required_tokens as f64 - state.tokens;
        Duration::try_from_secs_f64(tokens_needed / state.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Store a new refill rate clamped to the bucket's bounds; returns the applied rate.
    ///
    /// Tokens accrued so far are credited at the old rate and kept.
    pub fn set_rate(&self, rate: f64) -> f64 {
        let applied = if rate.is_nan() {
            self.min_rate
        } else {
            rate.clamp(self.min_rate, self.max_rate)
        };
        let mut state = self.state.lock();
        state.refill(self.capacity);
        state.refill_rate = applied;
        applied
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().refill_rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn min_rate(&self) -> f64 {
        self.min_rate
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }
}
