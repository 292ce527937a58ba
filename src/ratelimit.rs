//! Per-sender request throttling.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied; the window reopens after this many seconds.
    Limited { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Fixed-window rate limiter keyed by caller identity.
///
/// Each identity keeps the timestamps of its accepted requests inside the
/// current window; stale entries are pruned on every check, before
/// counting. A denied request is never recorded, so hammering the limit
/// does not push a caller's window forward. Bursts of up to twice the
/// limit can straddle a window boundary; that is the documented cost of a
/// fixed window.
pub struct RateLimiter {
    max_requests: usize,
    window_secs: u64,
    hits: Mutex<HashMap<String, Vec<u64>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record a request for `identity` at the current wall clock.
    pub fn check(&self, identity: &str) -> RateDecision {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.check_at(identity, now)
    }

    /// Clock-injected variant of [`check`](Self::check); `now_secs` is
    /// whole seconds and must not go backwards for a given identity.
    pub fn check_at(&self, identity: &str, now_secs: u64) -> RateDecision {
        let mut hits = self.hits.lock();
        let stamps = hits.entry(identity.to_string()).or_default();
        stamps.retain(|&t| now_secs.saturating_sub(t) < self.window_secs);
        if stamps.len() >= self.max_requests {
            // Oldest stamp is first: pushes are monotonic and retain keeps order.
            let oldest = stamps.first().copied().unwrap_or(now_secs);
            let elapsed = now_secs.saturating_sub(oldest);
            return RateDecision::Limited {
                retry_after_secs: self.window_secs.saturating_sub(elapsed),
            };
        }
        stamps.push(now_secs);
        RateDecision::Allowed
    }
}
