//! Debounced, non-overlapping scan scheduling.
//!
//! The scheduler only holds state: the armed deadline (if any) and whether a
//! scan is in progress. The caller supplies the current time, so the same
//! logic runs against the tokio clock in production and a paused clock in
//! tests.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ScanScheduler {
    debounce: Duration,
    max_wait: Duration,
    deadline: Option<Instant>,
    first_pending: Option<Instant>,
    scanning: bool,
}

impl ScanScheduler {
    pub fn new(debounce: Duration, max_wait: Duration) -> Self {
        Self {
            debounce,
            max_wait: max_wait.max(debounce),
            deadline: None,
            first_pending: None,
            scanning: false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// New posts were marked at `now`. Re-arms the debounce timer unless a
    /// scan is running; posts marked during a scan are picked up by
    /// [`finish`](Self::finish). Continuous churn cannot push the deadline
    /// past `max_wait` after the first pending post. A `max_wait` too large
    /// to represent (e.g. `debounce_max_wait_ms = u64::MAX`) disables the cap,
    /// giving a pure trailing debounce.
    pub fn notify(&mut self, now: Instant) {
        if self.scanning {
            return;
        }
        let first = *self.first_pending.get_or_insert(now);
        let trailing = now + self.debounce;
        self.deadline = Some(match first.checked_add(self.max_wait) {
            Some(cap) => trailing.min(cap),
            None => trailing,
        });
    }

    /// Returns `true` when the timer has expired and a scan may start; the
    /// scheduler is then in the scanning state until `finish` or `cancel`.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if !self.scanning && now >= deadline => {
                self.deadline = None;
                self.first_pending = None;
                self.scanning = true;
                true
            }
            _ => false,
        }
    }

    /// A scan ended. If posts were marked meanwhile, a follow-up is armed
    /// for `now` and `true` is returned.
    pub fn finish(&mut self, now: Instant, pending: bool) -> bool {
        self.scanning = false;
        if pending {
            self.first_pending = Some(now);
            self.deadline = Some(now);
        }
        pending
    }

    /// Drop the timer and forget any scan in progress.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.first_pending = None;
        self.scanning = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn scheduler() -> ScanScheduler {
        ScanScheduler::new(ms(50), ms(1000))
    }

    #[test]
    fn test_burst_is_coalesced_into_one_deadline() {
        let start = Instant::now();
        let mut s = scheduler();

        for i in 0..10 {
            s.notify(start + ms(i));
        }

        assert_eq!(s.deadline(), Some(start + ms(9) + ms(50)));
        assert!(!s.fire(start + ms(50)));
        assert!(s.fire(start + ms(59)));
        assert!(s.is_scanning());
        assert_eq!(s.deadline(), None);
    }

    #[test]
    fn test_unbounded_max_wait_is_pure_trailing_debounce() {
        let start = Instant::now();
        let mut s = ScanScheduler::new(ms(50), Duration::from_millis(u64::MAX));

        for i in 0..100 {
            s.notify(start + ms(i * 40));
        }

        assert_eq!(s.deadline(), Some(start + ms(99 * 40) + ms(50)));
    }

    #[test]
    fn test_notifications_during_scan_do_not_arm_timer() {
        let start = Instant::now();
        let mut s = scheduler();
        s.notify(start);
        assert!(s.fire(start + ms(50)));

        s.notify(start + ms(60));
        assert_eq!(s.deadline(), None);
        assert!(!s.fire(start + ms(500)));
    }

    #[test]
    fn test_finish_with_pending_schedules_follow_up_immediately() {
        let start = Instant::now();
        let mut s = scheduler();
        s.notify(start);
        assert!(s.fire(start + ms(50)));

        let done = start + ms(80);
        assert!(s.finish(done, true));
        assert_eq!(s.deadline(), Some(done));
        assert!(s.fire(done));
    }

    #[test]
    fn test_finish_without_pending_goes_idle() {
        let start = Instant::now();
        let mut s = scheduler();
        s.notify(start);
        assert!(s.fire(start + ms(50)));

        assert!(!s.finish(start + ms(70), false));
        assert!(!s.is_scanning());
        assert_eq!(s.deadline(), None);
    }

    #[test]
    fn test_continuous_churn_is_capped_by_max_wait() {
        let start = Instant::now();
        let mut s = ScanScheduler::new(ms(50), ms(200));

        for i in 0..20 {
            s.notify(start + ms(i * 30));
        }

        assert_eq!(s.deadline(), Some(start + ms(200)));
    }

    #[test]
    fn test_cancel_clears_everything() {
        let start = Instant::now();
        let mut s = scheduler();
        s.notify(start);
        s.cancel();
        assert_eq!(s.deadline(), None);
        assert!(!s.fire(start + ms(100)));

        s.notify(start + ms(100));
        assert!(s.fire(start + ms(150)));
        s.cancel();
        assert!(!s.is_scanning());
    }
}
