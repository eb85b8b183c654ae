//! Token bucket rate limiting for callbacks.
//!
//! Calling code calls `trigger()` to request the callback; the limiter
//! makes sure it does not run too often. Bursts up to `capacity` run
//! immediately. Once the bucket is empty, triggers coalesce into a single
//! deferred call that runs on the next refill tick.
//!
//! # Usage
//!
//! [`RateLimiter`] is the synchronous core, driven by explicit `refill()`
//! calls. [`RateLimited`] wraps it with a tokio ticker task that refills
//! every period, and is what the event publisher uses.
//!
//! ```
//! use dvalue_debugger::ratelimit::RateLimiter;
//!
//! let mut calls = 0;
//! let mut limiter = RateLimiter::new(2, || calls += 1);
//! for _ in 0..5 {
//!     limiter.trigger();
//! }
//! limiter.refill();
//! drop(limiter);
//! assert_eq!(calls, 3);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Token bucket around a callback.
pub struct RateLimiter<F> {
    /// Maximum number of stored tokens.
    capacity: u32,
    /// Tokens currently available.
    tokens: u32,
    /// A trigger arrived while the bucket was empty.
    pending: bool,
    /// The rate limited action.
    callback: F,
}

impl<F: FnMut()> RateLimiter<F> {
    /// Create a limiter with a full bucket.
    pub fn new(capacity: u32, callback: F) -> Self {
        Self {
            capacity,
            tokens: capacity,
            pending: false,
            callback,
        }
    }

    /// Request the callback.
    ///
    /// Runs it now if a token is available, otherwise defers it to the
    /// next refill.
    pub fn trigger(&mut self) {
        if self.tokens > 0 {
            self.tokens -= 1;
            (self.callback)();
        } else {
            self.pending = true;
        }
    }

    /// One refill tick: add a token, then run a deferred callback if any.
    pub fn refill(&mut self) {
        if self.tokens < self.capacity {
            self.tokens += 1;
        }
        if self.pending {
            self.pending = false;
            self.tokens = self.tokens.saturating_sub(1);
            (self.callback)();
        }
    }

    /// Tokens currently available.
    #[inline]
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Check if a deferred callback is waiting for the next refill.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

type SharedLimiter = Arc<Mutex<RateLimiter<Box<dyn FnMut() + Send>>>>;

/// A [`RateLimiter`] refilled by a tokio ticker task.
///
/// The ticker is cancelled by [`RateLimited::cancel`] or on drop,
/// whichever comes first; cancelling again is a no-op.
pub struct RateLimited {
    inner: SharedLimiter,
    ticker: Option<JoinHandle<()>>,
}

impl RateLimited {
    /// Start a limiter that refills one token every `period`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(capacity: u32, period: Duration, callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let callback: Box<dyn FnMut() + Send> = Box::new(callback);
        let inner: SharedLimiter = Arc::new(Mutex::new(RateLimiter::new(capacity, callback)));

        let shared = inner.clone();
        let ticker = tokio::spawn(async move {
            let mut refill = interval_at(Instant::now() + period, period);
            refill.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                refill.tick().await;
                lock(&shared).refill();
            }
        });

        Self {
            inner,
            ticker: Some(ticker),
        }
    }

    /// Request the callback.
    pub fn trigger(&self) {
        lock(&self.inner).trigger();
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> u32 {
        lock(&self.inner).tokens()
    }

    /// Stop the refill ticker.
    pub fn cancel(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    /// Check if the ticker has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.ticker.is_none()
    }
}

impl Drop for RateLimited {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Lock the limiter, recovering from a poisoned mutex.
///
/// A callback that panicked leaves the counters consistent, so the state
/// is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_burst_up_to_capacity() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut limiter = RateLimiter::new(2, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            limiter.trigger();
        }

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.tokens(), 0);
        assert!(limiter.is_pending());
    }

    #[test]
    fn test_refill_runs_deferred_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut limiter = RateLimiter::new(2, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            limiter.trigger();
        }
        limiter.refill();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.tokens(), 0);

        // Nothing pending: refill only stores a token
        limiter.refill();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.tokens(), 1);
    }

    #[test]
    fn test_continuous_triggering_is_one_per_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut limiter = RateLimiter::new(2, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..2 {
            limiter.trigger();
        }
        for tick in 1..=10 {
            for _ in 0..100 {
                limiter.trigger();
            }
            limiter.refill();
            assert_eq!(count.load(Ordering::SeqCst), 2 + tick);
        }
    }

    #[test]
    fn test_tokens_capped_at_capacity() {
        let mut limiter = RateLimiter::new(3, || {});
        for _ in 0..10 {
            limiter.refill();
        }
        assert_eq!(limiter.tokens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_ticker() {
        let period = Duration::from_millis(100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let limited = RateLimited::spawn(2, period, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            limited.trigger();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // A sixth trigger lands within one period
        limited.trigger();
        tokio::time::sleep(period + Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Under continuous triggering at most one call per period
        for _ in 0..5 {
            for _ in 0..10 {
                limited.trigger();
            }
            tokio::time::sleep(period).await;
        }
        assert!(count.load(Ordering::SeqCst) <= 3 + 5);
        assert!(count.load(Ordering::SeqCst) >= 3 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut limited = RateLimited::spawn(1, Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        limited.trigger();
        limited.trigger();
        limited.cancel();
        limited.cancel();
        assert!(limited.is_cancelled());

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The deferred call never runs once the ticker is gone
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
