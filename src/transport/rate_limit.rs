// Sliding-window request admission, one limiter per endpoint.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Admits a request iff fewer than `limit` requests were admitted in the
/// trailing `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            sent: Mutex::new(VecDeque::with_capacity(limit as usize)),
        }
    }

    /// Try to admit one request now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut sent = self.sent.lock();
        while let Some(front) = sent.front() {
            if now.duration_since(*front) >= self.window {
                sent.pop_front();
            } else {
                break;
            }
        }
        if sent.len() < self.limit as usize {
            sent.push_back(now);
            true
        } else {
            false
        }
    }

    /// Requests admitted in the current window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let sent = self.sent.lock();
        sent.iter().filter(|t| now.duration_since(**t) < self.window).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = SlidingWindow::new(3, Duration::from_secs(1));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.in_window(), 3);
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindow::new(2, Duration::from_millis(50));
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start + Duration::from_millis(10)));
        // Both admissions have left the window.
        assert!(limiter.try_acquire_at(start + Duration::from_millis(60)));
    }
}
