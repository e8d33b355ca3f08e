//! Bounded-permit primitives.
//!
//! - [`Semaphore`]: a fixed number of permits held in a bounded buffer.
//!   Acquire parks a token in the buffer, release takes one out, so capacity is
//!   the buffer size rather than a separately maintained counter.
//! - [`RateLimiter`]: a `Semaphore` for parallelism plus a per-second quota
//!   that resets on a fixed one-second tick.

mod rate_limit;
mod semaphore;

pub use rate_limit::{QUOTA_PERIOD, RateLimiter};
pub use semaphore::{Semaphore, SemaphoreError};
