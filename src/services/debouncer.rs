//! Scan debouncer - the idle/scanning/found/not_found/error state machine
//!
//! Decides whether a decoded payload is a new check-in event:
//! - nothing is accepted outside `scanning`, or while a cooldown runs
//! - a payload equal to the last accepted one is a duplicate
//! - after a match the last value is kept when the cooldown expires, so a
//!   badge left in front of the camera does not check in twice
//! - after a miss the last value is cleared, so the same badge can be
//!   retried once the directory is fixed
//!
//! Every acceptance, reset, cooldown expiry and stop advances `epoch`;
//! detections started under an older epoch no longer apply.

use crate::domain::types::ScanStatus;
use crate::infra::config::Config;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Result of offering a payload to the debouncer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Cooldown running, or the session is not scanning
    NotAccepting,
    /// Same value as the last accepted payload
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
struct Cooldown {
    until: Instant,
    clear_last_raw: bool,
}

#[derive(Debug)]
pub struct ScanDebouncer {
    status: ScanStatus,
    last_raw: Option<String>,
    accepting: bool,
    scan_count: u64,
    epoch: u64,
    cooldown: Option<Cooldown>,
    found_cooldown: Duration,
    miss_cooldown: Duration,
}

impl ScanDebouncer {
    pub fn new(found_cooldown: Duration, miss_cooldown: Duration) -> Self {
        Self {
            status: ScanStatus::Idle,
            last_raw: None,
            accepting: false,
            scan_count: 0,
            epoch: 0,
            cooldown: None,
            found_cooldown,
            miss_cooldown,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.found_cooldown(), config.miss_cooldown())
    }

    #[inline]
    pub fn status(&self) -> ScanStatus {
        self.status
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn last_raw_value(&self) -> Option<&str> {
        self.last_raw.as_deref()
    }

    #[inline]
    pub fn scan_count(&self) -> u64 {
        self.scan_count
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// When the running cooldown expires, if one is running
    pub fn cooldown_deadline(&self) -> Option<Instant> {
        self.cooldown.map(|c| c.until)
    }

    /// Enter `scanning` from any state with a clean slate
    pub fn start(&mut self) {
        self.status = ScanStatus::Scanning;
        self.accepting = true;
        self.last_raw = None;
        self.cooldown = None;
        self.advance_epoch();
    }

    /// Offer a decoded raw value. On `Accepted` the caller must follow up
    /// with `record_outcome`.
    pub fn offer(&mut self, raw_value: &str) -> Admission {
        if !self.accepting || self.status != ScanStatus::Scanning {
            return Admission::NotAccepting;
        }
        if self.last_raw.as_deref() == Some(raw_value) {
            return Admission::Duplicate;
        }

        self.last_raw = Some(raw_value.to_string());
        self.scan_count += 1;
        self.accepting = false;
        self.advance_epoch();
        Admission::Accepted
    }

    /// Record the match outcome of the accepted payload and start its cooldown
    pub fn record_outcome(&mut self, matched: bool, now: Instant) {
        let (status, duration) = if matched {
            (ScanStatus::Found, self.found_cooldown)
        } else {
            (ScanStatus::NotFound, self.miss_cooldown)
        };
        self.status = status;
        self.accepting = false;
        self.cooldown = Some(Cooldown { until: now + duration, clear_last_raw: !matched });
    }

    /// Expire the cooldown if its deadline has passed. Returns true when the
    /// debouncer went back to `scanning`.
    pub fn poll_cooldown(&mut self, now: Instant) -> bool {
        let Some(cooldown) = self.cooldown else {
            return false;
        };
        if now < cooldown.until {
            return false;
        }

        self.cooldown = None;
        self.accepting = true;
        self.status = ScanStatus::Scanning;
        if cooldown.clear_last_raw {
            self.last_raw = None;
        }
        self.advance_epoch();
        debug!(epoch = %self.epoch, cleared = %cooldown.clear_last_raw, "cooldown_expired");
        true
    }

    /// Manual "next scan": drop the last value and any cooldown.
    /// No-op (returns false) when idle or in error.
    pub fn next_scan(&mut self) -> bool {
        if matches!(self.status, ScanStatus::Idle | ScanStatus::Error) {
            return false;
        }
        self.last_raw = None;
        self.cooldown = None;
        self.accepting = true;
        self.status = ScanStatus::Scanning;
        self.advance_epoch();
        true
    }

    pub fn stop(&mut self) {
        self.status = ScanStatus::Idle;
        self.accepting = false;
        self.last_raw = None;
        self.cooldown = None;
        self.advance_epoch();
    }

    /// Camera failure: terminal until the next `start`
    pub fn fail(&mut self) {
        self.status = ScanStatus::Error;
        self.accepting = false;
        self.cooldown = None;
        self.advance_epoch();
    }

    #[inline]
    fn advance_epoch(&mut self) {
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOUND: Duration = Duration::from_millis(2000);
    const MISS: Duration = Duration::from_millis(1200);

    fn scanning() -> ScanDebouncer {
        let mut debouncer = ScanDebouncer::new(FOUND, MISS);
        debouncer.start();
        debouncer
    }

    #[test]
    fn test_idle_rejects_payloads() {
        let mut debouncer = ScanDebouncer::new(FOUND, MISS);
        assert_eq!(debouncer.status(), ScanStatus::Idle);
        assert_eq!(debouncer.offer("A1"), Admission::NotAccepting);
        assert_eq!(debouncer.scan_count(), 0);
    }

    #[test]
    fn test_identical_payloads_while_found_count_once() {
        let mut debouncer = scanning();
        let now = Instant::now();

        let mut accepted = 0;
        for _ in 0..10 {
            if debouncer.offer("A1") == Admission::Accepted {
                accepted += 1;
                debouncer.record_outcome(true, now);
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(debouncer.status(), ScanStatus::Found);
        assert_eq!(debouncer.scan_count(), 1);

        // Still the same badge after the cooldown: a duplicate, not a new event
        assert!(debouncer.poll_cooldown(now + FOUND));
        assert_eq!(debouncer.offer("A1"), Admission::Duplicate);
        assert_eq!(debouncer.scan_count(), 1);
    }

    #[test]
    fn test_found_cooldown_timing() {
        let mut debouncer = scanning();
        let now = Instant::now();

        assert_eq!(debouncer.offer("A1"), Admission::Accepted);
        debouncer.record_outcome(true, now);
        assert!(!debouncer.is_accepting());
        assert_eq!(debouncer.cooldown_deadline(), Some(now + FOUND));

        assert!(!debouncer.poll_cooldown(now + FOUND - Duration::from_millis(1)));
        assert!(!debouncer.is_accepting());
        assert_eq!(debouncer.offer("B2"), Admission::NotAccepting);

        assert!(debouncer.poll_cooldown(now + FOUND));
        assert!(debouncer.is_accepting());
        assert_eq!(debouncer.status(), ScanStatus::Scanning);
        assert_eq!(debouncer.last_raw_value(), Some("A1"));
        assert_eq!(debouncer.cooldown_deadline(), None);
    }

    #[test]
    fn test_miss_cooldown_clears_last_value() {
        let mut debouncer = scanning();
        let now = Instant::now();

        assert_eq!(debouncer.offer("PART-999"), Admission::Accepted);
        debouncer.record_outcome(false, now);
        assert_eq!(debouncer.status(), ScanStatus::NotFound);
        assert_eq!(debouncer.last_raw_value(), Some("PART-999"));

        assert!(!debouncer.poll_cooldown(now + MISS - Duration::from_millis(1)));
        assert!(debouncer.poll_cooldown(now + MISS));
        assert_eq!(debouncer.last_raw_value(), None);
        assert_eq!(debouncer.status(), ScanStatus::Scanning);

        // Same badge may be retried
        assert_eq!(debouncer.offer("PART-999"), Admission::Accepted);
        assert_eq!(debouncer.scan_count(), 2);
    }

    #[test]
    fn test_next_scan_resets_immediately() {
        let mut debouncer = scanning();
        let now = Instant::now();

        debouncer.offer("A1");
        debouncer.record_outcome(true, now);
        assert!(debouncer.next_scan());

        assert_eq!(debouncer.status(), ScanStatus::Scanning);
        assert!(debouncer.is_accepting());
        assert_eq!(debouncer.last_raw_value(), None);
        assert_eq!(debouncer.cooldown_deadline(), None);
        assert_eq!(debouncer.offer("A1"), Admission::Accepted);
    }

    #[test]
    fn test_next_scan_is_noop_when_idle_or_error() {
        let mut debouncer = ScanDebouncer::new(FOUND, MISS);
        let epoch = debouncer.epoch();
        assert!(!debouncer.next_scan());
        assert_eq!(debouncer.status(), ScanStatus::Idle);
        assert_eq!(debouncer.epoch(), epoch);

        debouncer.start();
        debouncer.fail();
        assert!(!debouncer.next_scan());
        assert_eq!(debouncer.status(), ScanStatus::Error);
        assert_eq!(debouncer.offer("A1"), Admission::NotAccepting);
    }

    #[test]
    fn test_epoch_advances_on_every_transition() {
        let mut debouncer = ScanDebouncer::new(FOUND, MISS);
        let now = Instant::now();
        let mut last = debouncer.epoch();
        let mut advanced = |debouncer: &ScanDebouncer| {
            let advanced = debouncer.epoch() > last;
            last = debouncer.epoch();
            advanced
        };

        debouncer.start();
        assert!(advanced(&debouncer));
        debouncer.offer("A1");
        assert!(advanced(&debouncer));
        debouncer.record_outcome(false, now);
        debouncer.poll_cooldown(now + MISS);
        assert!(advanced(&debouncer));
        debouncer.next_scan();
        assert!(advanced(&debouncer));
        debouncer.stop();
        assert!(advanced(&debouncer));
        assert_eq!(debouncer.status(), ScanStatus::Idle);
    }

    #[test]
    fn test_stop_clears_pending_cooldown() {
        let mut debouncer = scanning();
        let now = Instant::now();
        debouncer.offer("A1");
        debouncer.record_outcome(true, now);

        debouncer.stop();
        assert_eq!(debouncer.status(), ScanStatus::Idle);
        assert!(!debouncer.poll_cooldown(now + FOUND));
        assert_eq!(debouncer.status(), ScanStatus::Idle);
    }
}
