//! Retry timers for the negotiation stages
//!
//! Each stage of the negotiation (registration keep-alive, handshake
//! request, punch probes, stream-connect attempts) is driven by one
//! periodic timer. The timers live in `StageTimers`, and every state
//! transition replaces the set wholesale with exactly the timers valid
//! in the new state, so a canceled timer can never fire again and
//! canceling a never-started one is a no-op.

use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// Default interval between retries of any stage
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Maximum firings of a single stage timer before the negotiation is
/// declared failed. The original protocol retried forever; a bounded
/// count turns a vanished counterpart into a terminal error instead of
/// silent spin.
pub const MAX_RETRY_ATTEMPTS: u32 = 60;

// ============================================================================
// Retry Timer
// ============================================================================

/// A fixed-interval retry timer with an attempt cap
#[derive(Debug, Clone)]
pub struct RetryTimer {
    interval: Duration,
    next_fire: Instant,
    attempts: u32,
    max_attempts: u32,
}

impl RetryTimer {
    /// Create a timer whose first firing is one interval from `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self::with_max_attempts(interval, now, MAX_RETRY_ATTEMPTS)
    }

    pub fn with_max_attempts(interval: Duration, now: Instant, max_attempts: u32) -> Self {
        RetryTimer {
            interval,
            next_fire: now + interval,
            attempts: 0,
            max_attempts,
        }
    }

    /// Whether the timer is due at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_fire
    }

    /// Record a firing and schedule the next one
    pub fn record_fire(&mut self, now: Instant) {
        self.attempts += 1;
        self.next_fire = now + self.interval;
    }

    /// Whether the attempt cap has been reached
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// When the timer fires next
    pub fn deadline(&self) -> Instant {
        self.next_fire
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ============================================================================
// Stage Timers
// ============================================================================

/// The retry timers a peer engine may hold, at most one per stage.
///
/// States own their timers: `Registering` holds `registration`,
/// `Requesting` holds `registration` + `handshake`, `Punching` holds
/// `punch`, `Connecting` holds `connect` (initiator only). Everything
/// else is `None`.
#[derive(Debug, Default)]
pub struct StageTimers {
    pub registration: Option<RetryTimer>,
    pub handshake: Option<RetryTimer>,
    pub punch: Option<RetryTimer>,
    pub connect: Option<RetryTimer>,
}

impl StageTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every stage timer (idempotent)
    pub fn clear(&mut self) {
        self.registration = None;
        self.handshake = None;
        self.punch = None;
        self.connect = None;
    }

    /// Earliest pending deadline across all stages
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.registration.as_ref(),
            self.handshake.as_ref(),
            self.punch.as_ref(),
            self.connect.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(RetryTimer::deadline)
        .min()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_after_interval() {
        let start = Instant::now();
        let mut timer = RetryTimer::new(Duration::from_millis(100), start);

        assert!(!timer.is_due(start));
        assert!(!timer.is_due(start + Duration::from_millis(99)));
        assert!(timer.is_due(start + Duration::from_millis(100)));

        timer.record_fire(start + Duration::from_millis(100));
        assert!(!timer.is_due(start + Duration::from_millis(150)));
        assert!(timer.is_due(start + Duration::from_millis(200)));
    }

    #[test]
    fn test_timer_exhaustion() {
        let mut now = Instant::now();
        let mut timer = RetryTimer::with_max_attempts(Duration::from_millis(10), now, 3);

        for _ in 0..3 {
            assert!(!timer.is_exhausted());
            now += Duration::from_millis(10);
            assert!(timer.is_due(now));
            timer.record_fire(now);
        }

        assert!(timer.is_exhausted());
        assert_eq!(timer.attempts(), 3);
    }

    #[test]
    fn test_stage_timers_next_deadline() {
        let now = Instant::now();
        let mut timers = StageTimers::new();

        assert!(timers.next_deadline().is_none());

        timers.registration = Some(RetryTimer::new(Duration::from_millis(1000), now));
        timers.handshake = Some(RetryTimer::new(Duration::from_millis(300), now));

        assert_eq!(
            timers.next_deadline(),
            Some(now + Duration::from_millis(300))
        );
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut timers = StageTimers::new();
        timers.punch = Some(RetryTimer::new(Duration::from_millis(10), Instant::now()));

        timers.clear();
        assert!(timers.punch.is_none());

        // Clearing again must be a no-op, not a fault.
        timers.clear();
        assert!(timers.next_deadline().is_none());
    }
}
