//! Sliding-window call budget for quota-limited APIs.
//!
//! The search API allows a fixed number of calls per minute. [`RateLimiter`] remembers when
//! recent calls were made and, before the next one, waits until admitting it would keep the
//! trailing window within budget. Stale instants are evicted lazily on each admission check.
//!
//! The limiter is driven through `&mut self`, so a single retrieval loop owns it. Sharing one
//! across tasks needs an outer `tokio::sync::Mutex`.
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::clients::rate::{RateLimiter, RatePolicy};
//!
//! # async fn example() {
//! let mut limiter = RateLimiter::new(RatePolicy::AGGREGATION);
//! for _ in 0..3 {
//!   limiter.admit().await;
//!   // ... send the request ...
//!   limiter.track();
//! }
//! assert_eq!(limiter.recent_calls(), 3);
//! # }
//! ```

use std::collections::VecDeque;

use tokio::time::{sleep_until, Instant};

use super::*;

/// How many calls fit in a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
  /// Maximum number of calls inside one window
  pub max_calls: usize,
  /// Length of the trailing window
  pub window:    Duration,
}

impl RatePolicy {
  /// Budget for scroll-paged search requests: 10 calls per minute.
  pub const PAGING: RatePolicy = RatePolicy { max_calls: 10, window: Duration::from_secs(60) };
  /// Budget for one-shot aggregation requests: 5 calls per minute.
  pub const AGGREGATION: RatePolicy = RatePolicy { max_calls: 5, window: Duration::from_secs(60) };

  /// A per-minute budget of `max_calls` calls.
  pub fn per_minute(max_calls: usize) -> Self {
    Self { max_calls: max_calls.max(1), window: Duration::from_secs(60) }
  }
}

impl Default for RatePolicy {
  fn default() -> Self { Self::PAGING }
}

/// Tracks recent calls and blocks new ones that would exceed a [`RatePolicy`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
  policy: RatePolicy,
  calls:  VecDeque<Instant>,
}

impl RateLimiter {
  /// Creates a limiter with an empty call window.
  pub fn new(policy: RatePolicy) -> Self { Self { policy, calls: VecDeque::new() } }

  /// The policy this limiter enforces.
  pub fn policy(&self) -> RatePolicy { self.policy }

  /// Drops instants that have aged out of the window.
  fn evict(&mut self, now: Instant) {
    while let Some(oldest) = self.calls.front() {
      if now.duration_since(*oldest) >= self.policy.window {
        self.calls.pop_front();
      } else {
        break;
      }
    }
  }

  /// Waits until one more call fits in the trailing window.
  ///
  /// Returns immediately while the budget has room. Otherwise sleeps until the oldest tracked
  /// call ages out, then checks again.
  pub async fn admit(&mut self) {
    loop {
      self.evict(Instant::now());
      if self.calls.len() < self.policy.max_calls {
        return;
      }
      let Some(oldest) = self.calls.front().copied() else { return };
      let until = oldest + self.policy.window;
      debug!(
        "Call budget of {} per {:?} exhausted, waiting {:?}",
        self.policy.max_calls,
        self.policy.window,
        until.saturating_duration_since(Instant::now())
      );
      sleep_until(until).await;
    }
  }

  /// Appends a call instant to the window.
  pub fn record(&mut self, at: Instant) { self.calls.push_back(at); }

  /// Records a call made now.
  pub fn track(&mut self) { self.record(Instant::now()); }

  /// Number of calls inside the trailing window.
  pub fn recent_calls(&mut self) -> usize {
    self.evict(Instant::now());
    self.calls.len()
  }

  /// When the most recent call was recorded.
  pub fn last_call(&self) -> Option<Instant> { self.calls.back().copied() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_admits_within_budget_without_waiting() {
    let mut limiter = RateLimiter::new(RatePolicy::AGGREGATION);
    let start = Instant::now();
    for _ in 0..5 {
      limiter.admit().await;
      limiter.track();
    }
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(limiter.recent_calls(), 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_blocks_until_oldest_call_ages_out() {
    let mut limiter = RateLimiter::new(RatePolicy::AGGREGATION);
    let start = Instant::now();
    for _ in 0..5 {
      limiter.admit().await;
      limiter.track();
    }
    limiter.admit().await;
    assert_eq!(start.elapsed(), Duration::from_secs(60));
    assert_eq!(limiter.recent_calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_window_never_exceeds_budget() {
    let policy = RatePolicy { max_calls: 3, window: Duration::from_secs(60) };
    let mut limiter = RateLimiter::new(policy);
    let mut history = Vec::new();

    for i in 0..20u64 {
      limiter.admit().await;
      limiter.track();
      history.push(Instant::now());
      tokio::time::sleep(Duration::from_secs(i % 7)).await;
    }

    for (i, at) in history.iter().enumerate() {
      let inside = history[..=i]
        .iter()
        .filter(|earlier| at.duration_since(**earlier) < policy.window)
        .count();
      assert!(inside <= policy.max_calls, "{inside} calls inside one window");
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_calls_are_evicted() {
    let mut limiter = RateLimiter::new(RatePolicy::PAGING);
    limiter.record(Instant::now());
    tokio::time::advance(Duration::from_secs(30)).await;
    limiter.track();
    assert_eq!(limiter.recent_calls(), 2);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(limiter.recent_calls(), 1);
    assert!(limiter.last_call().is_some());
  }

  #[test]
  fn test_named_policies() {
    assert_eq!(RatePolicy::PAGING.max_calls, 10);
    assert_eq!(RatePolicy::AGGREGATION.max_calls, 5);
    assert_eq!(RatePolicy::per_minute(0).max_calls, 1);
    assert_eq!(RatePolicy::default(), RatePolicy::PAGING);
  }
}
