//! Rolling-window rate limiting on top of the bounded cache.

use std::sync::Arc;
use std::time::Duration;

use super::lru::LruCache;

/// Failure modes of a rate-limit check.
///
/// Only [`RateLimitError::Exceeded`] is a user-facing condition; anything
/// else is treated as an internal error by callers.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded: {rate} requests in {window:?}")]
    Exceeded { rate: u32, window: Duration },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Counts events per key within a rolling window.
///
/// The default is process-local and best-effort; deployments needing
/// cross-instance throttling supply their own implementation (e.g. backed by
/// a shared store).
pub trait RateLimiter: Send + Sync {
    /// Records one event for `key`, failing with
    /// [`RateLimitError::Exceeded`] once more than `rate` events land inside
    /// `window`.
    fn rate_limit(&self, key: &str, rate: u32, window: Duration) -> Result<(), RateLimitError>;
}

/// In-memory limiter backed by a bounded LRU cache.
///
/// Counters are created lazily, reset when their window elapses, and evicted
/// under capacity pressure — approximate by design, which is acceptable for
/// abuse throttling.
pub struct MemoryRateLimiter {
    cache: Arc<LruCache<String, u32>>,
}

impl MemoryRateLimiter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Arc::new(LruCache::new(capacity)),
        }
    }

    /// Shares an existing cache, e.g. with the revocation deny-list.
    #[must_use]
    pub fn with_cache(cache: Arc<LruCache<String, u32>>) -> Self {
        Self { cache }
    }
}

impl RateLimiter for MemoryRateLimiter {
    fn rate_limit(&self, key: &str, rate: u32, window: Duration) -> Result<(), RateLimitError> {
        let key = format!("rate:{key}");
        // The whole read-modify-write runs under one lock acquisition, so
        // concurrent calls for the same key never lose increments. A miss
        // or an expired counter restarts at zero; the check runs before the
        // increment, so the `rate`-th call in a window still succeeds and
        // the `rate + 1`-th trips the limit. Rejected calls write nothing,
        // so they do not extend the window.
        let mut exceeded = false;
        self.cache.update(key, window, |hits| {
            let hits = hits.copied().unwrap_or(0);
            if hits >= rate {
                exceeded = true;
                None
            } else {
                Some(hits + 1)
            }
        });
        if exceeded {
            return Err(RateLimitError::Exceeded { rate, window });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn allows_up_to_rate_then_trips() {
        let limiter = MemoryRateLimiter::new(16);
        let window = Duration::from_secs(60);
        for _ in 0..3 {
            limiter.rate_limit("login:a@a.a", 3, window).unwrap();
        }
        let err = limiter.rate_limit("login:a@a.a", 3, window).unwrap_err();
        match err {
            RateLimitError::Exceeded { rate, window: w } => {
                assert_eq!(rate, 3);
                assert_eq!(w, window);
            }
            RateLimitError::Backend(err) => panic!("unexpected backend error: {err}"),
        }
    }

    #[test]
    fn keys_are_independent() {
        let limiter = MemoryRateLimiter::new(16);
        let window = Duration::from_secs(60);
        limiter.rate_limit("a", 1, window).unwrap();
        limiter.rate_limit("b", 1, window).unwrap();
        assert!(limiter.rate_limit("a", 1, window).is_err());
        assert!(limiter.rate_limit("b", 1, window).is_err());
    }

    #[test]
    fn counter_resets_after_window() {
        let limiter = MemoryRateLimiter::new(16);
        let window = Duration::from_millis(30);
        limiter.rate_limit("reset", 1, window).unwrap();
        assert!(limiter.rate_limit("reset", 1, window).is_err());
        thread::sleep(Duration::from_millis(60));
        limiter.rate_limit("reset", 1, window).unwrap();
    }

    #[test]
    fn concurrent_calls_do_not_lose_increments() {
        let limiter = Arc::new(MemoryRateLimiter::new(16));
        let window = Duration::from_secs(60);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    limiter.rate_limit("shared", u32::MAX, window).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(limiter.cache.get(&"rate:shared".to_string()), Some(400));
    }

    #[test]
    fn eviction_under_pressure_forgives_old_keys() {
        // With a tiny cache, older counters fall off the tail; the limiter
        // degrades to best-effort instead of failing.
        let limiter = MemoryRateLimiter::new(2);
        let window = Duration::from_secs(60);
        limiter.rate_limit("one", 1, window).unwrap();
        assert!(limiter.rate_limit("one", 1, window).is_err());
        limiter.rate_limit("two", 1, window).unwrap();
        limiter.rate_limit("three", 1, window).unwrap();
        limiter.rate_limit("one", 1, window).unwrap();
    }
}
