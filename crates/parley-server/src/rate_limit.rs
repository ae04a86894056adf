//! Fixed-window admission control per authenticated user.
//!
//! Counts are process-local and approximate by design of the window: a
//! burst straddling a window edge can see up to twice the quota.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parley_settings::RateLimitSettings;

/// Outcome of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    quota: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self {
            quota,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.quota, settings.window())
    }

    /// Count one request for `identity` unless its window is exhausted.
    /// Denied requests are not counted.
    pub fn admit(&self, identity: &str, now: Instant) -> Admission {
        // The entry guard holds the shard lock, so check-and-increment is
        // atomic per identity.
        let mut window = self.windows.entry(identity.to_string()).or_insert_with(|| Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.quota {
            let elapsed = now.saturating_duration_since(window.started);
            return Admission::Denied {
                retry_after: self.window.saturating_sub(elapsed),
            };
        }
        window.count += 1;
        Admission::Allowed {
            remaining: self.quota - window.count,
        }
    }

    /// Drop windows that have been idle for more than one window length.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let horizon = self.window * 2;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < horizon);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn admits_exactly_quota_then_denies() {
        let limiter = RateLimiter::new(3, WINDOW);
        let now = Instant::now();
        assert_eq!(limiter.admit("alice", now), Admission::Allowed { remaining: 2 });
        assert_eq!(limiter.admit("alice", now), Admission::Allowed { remaining: 1 });
        assert_eq!(limiter.admit("alice", now), Admission::Allowed { remaining: 0 });
        assert_eq!(
            limiter.admit("alice", now + Duration::from_secs(20)),
            Admission::Denied {
                retry_after: Duration::from_secs(40)
            }
        );
    }

    #[test]
    fn denials_are_not_counted_and_window_resets() {
        let limiter = RateLimiter::new(1, WINDOW);
        let start = Instant::now();
        assert!(limiter.admit("alice", start).is_allowed());
        for _ in 0..5 {
            assert!(!limiter.admit("alice", start).is_allowed());
        }
        assert!(limiter.admit("alice", start + WINDOW).is_allowed());
        assert!(!limiter.admit("alice", start + WINDOW).is_allowed());
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(1, WINDOW);
        let now = Instant::now();
        assert!(limiter.admit("alice", now).is_allowed());
        assert!(limiter.admit("bob", now).is_allowed());
        assert!(!limiter.admit("alice", now).is_allowed());
    }

    #[test]
    fn concurrent_admits_do_not_over_admit() {
        let limiter = Arc::new(RateLimiter::new(50, WINDOW));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| limiter.admit("alice", now).is_allowed()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn sweep_drops_stale_windows() {
        let limiter = RateLimiter::new(5, WINDOW);
        let start = Instant::now();
        limiter.admit("alice", start);
        limiter.admit("bob", start + WINDOW * 2);
        assert_eq!(limiter.sweep(start + WINDOW * 2 + Duration::from_secs(1)), 1);
        assert_eq!(limiter.tracked(), 1);
    }
}
