//! Bounded in-memory caching and the rate limiter built on it.

pub mod lru;
pub mod rate_limit;

pub use lru::LruCache;
pub use rate_limit::{MemoryRateLimiter, RateLimitError, RateLimiter};
