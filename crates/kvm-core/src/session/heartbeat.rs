//! Heartbeat-based liveness detection.
//!
//! The monitor is a plain value driven by the session worker: the worker asks
//! [`HeartbeatMonitor::next_wakeup`] when to wake, then calls
//! [`HeartbeatMonitor::poll`] with the current time. It never sleeps or reads
//! the clock itself, which keeps it deterministic under test.
//!
//! ```text
//!  established        +interval           +2×interval
//!      │──────────────────│──────────────────│
//!      last ack           send Heartbeat     no ack yet → Stale
//! ```

use std::time::{Duration, Instant};

/// What the worker should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing is due yet.
    Idle,
    /// Send a heartbeat carrying this token.
    Send(u64),
    /// No ack for twice the interval; the peer is gone.
    Stale { silent_for: Duration },
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    last_ack_at: Instant,
    next_send_at: Instant,
    outstanding: Option<(u64, Instant)>,
    last_token: u64,
    last_rtt: Option<Duration>,
}

impl HeartbeatMonitor {
    /// Starts monitoring a session established at `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_ack_at: now,
            next_send_at: now + interval,
            outstanding: None,
            last_token: 0,
            last_rtt: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Instant after which the peer counts as gone unless an ack arrives.
    pub fn stale_at(&self) -> Instant {
        self.last_ack_at + self.interval * 2
    }

    /// Earliest instant at which [`poll`](Self::poll) may return something
    /// other than `Idle`.
    pub fn next_wakeup(&self) -> Instant {
        self.next_send_at.min(self.stale_at())
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if now >= self.stale_at() {
            return HeartbeatAction::Stale {
                silent_for: now.saturating_duration_since(self.last_ack_at),
            };
        }
        if now >= self.next_send_at {
            self.last_token += 1;
            self.outstanding = Some((self.last_token, now));
            self.next_send_at = now + self.interval;
            return HeartbeatAction::Send(self.last_token);
        }
        HeartbeatAction::Idle
    }

    /// Records an ack. Returns the round-trip time when the ack answers the
    /// most recent heartbeat.
    ///
    /// An ack for an older heartbeat still proves the peer is alive; tokens
    /// never sent are ignored.
    pub fn on_ack(&mut self, token: u64, now: Instant) -> Option<Duration> {
        if token == 0 || token > self.last_token {
            return None;
        }
        self.last_ack_at = now;
        match self.outstanding {
            Some((expected, sent_at)) if expected == token => {
                self.outstanding = None;
                let rtt = now.saturating_duration_since(sent_at);
                self.last_rtt = Some(rtt);
                Some(rtt)
            }
            _ => None,
        }
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn last_ack_at(&self) -> Instant {
        self.last_ack_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    #[test]
    fn test_first_heartbeat_is_due_after_one_interval() {
        // Arrange
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, start);

        // Act / Assert
        assert_eq!(monitor.next_wakeup(), start + INTERVAL);
        assert_eq!(monitor.poll(start + Duration::from_secs(29)), HeartbeatAction::Idle);
        assert_eq!(monitor.poll(start + INTERVAL), HeartbeatAction::Send(1));
    }

    #[test]
    fn test_ack_reports_rtt_and_refreshes_liveness() {
        // Arrange
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, start);
        let sent_at = start + INTERVAL;
        let HeartbeatAction::Send(token) = monitor.poll(sent_at) else {
            panic!("heartbeat should be due");
        };

        // Act
        let rtt = monitor.on_ack(token, sent_at + Duration::from_millis(4));

        // Assert
        assert_eq!(rtt, Some(Duration::from_millis(4)));
        assert_eq!(monitor.last_ack_at(), sent_at + Duration::from_millis(4));
        assert_eq!(
            monitor.next_wakeup(),
            sent_at + INTERVAL,
            "next heartbeat comes before the new stale deadline"
        );
    }

    #[test]
    fn test_missing_acks_for_two_intervals_mark_session_stale() {
        // Arrange
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, start);
        assert!(matches!(monitor.poll(start + INTERVAL), HeartbeatAction::Send(_)));

        // Act – the wake-up lands exactly on the stale deadline
        let deadline = monitor.next_wakeup();
        let action = monitor.poll(deadline);

        // Assert
        assert_eq!(deadline, start + INTERVAL * 2);
        assert_eq!(
            action,
            HeartbeatAction::Stale {
                silent_for: INTERVAL * 2
            }
        );
    }

    #[test]
    fn test_late_ack_for_older_token_keeps_session_alive_without_rtt() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10), start);
        assert_eq!(monitor.poll(start + Duration::from_secs(10)), HeartbeatAction::Send(1));
        monitor.on_ack(1, start + Duration::from_secs(11));
        assert_eq!(monitor.poll(start + Duration::from_secs(21)), HeartbeatAction::Send(2));

        // A duplicate ack for heartbeat 1 arrives while 2 is outstanding.
        let rtt = monitor.on_ack(1, start + Duration::from_secs(22));

        assert_eq!(rtt, None);
        assert_eq!(monitor.last_ack_at(), start + Duration::from_secs(22));
    }

    #[test]
    fn test_ack_for_unsent_token_is_ignored() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL, start);

        assert_eq!(monitor.on_ack(5, start + Duration::from_secs(1)), None);
        assert_eq!(monitor.last_ack_at(), start);
    }
}
