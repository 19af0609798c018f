//! Utility modules

pub mod logger;
pub mod metrics;
pub mod rate_limiter;

pub use rate_limiter::{RateLimiter, RateWindow};
