//! Request throttling module
//!
//! Admission through the throttle happens in two steps:
//!
//! 1. **Rate limiting**: a sliding window of admission timestamps. When the
//!    trailing second already holds `max_requests_per_second` admissions (or
//!    the trailing 100 ms holds `burst_limit`), the caller sleeps until the
//!    oldest entry leaves the window. Bursts are smoothed, never rejected.
//! 2. **Concurrency limiting**: a semaphore with `max_concurrent_requests`
//!    slots. The slot is held by a [`ThrottlePermit`] and freed on drop.
//!
//! Callers pass through the rate limiter one at a time, in arrival order.

pub mod concurrency;
pub mod window;

pub use concurrency::{ConcurrencyThrottle, LoadSnapshot, ThrottleConfig, ThrottleError, ThrottlePermit};
pub use window::SlidingWindow;
