//! Cooperative cancellation for pipeline runs.
//!
//! A run's [`CancellationToken`] is raced against every suspension point:
//! provider calls, retry backoff sleeps and waits on a shared prefix.

mod token;

pub use token::CancellationToken;
