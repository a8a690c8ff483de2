//! Keep-alive timer for an open link
//!
//! A PINGREQ is due once either direction has been quiet for the keep-alive
//! interval, so a broker that stops answering is noticed even while the client
//! keeps publishing. While a ping is outstanding the link is considered lost
//! if no PINGRESP arrives within 1.5 x the interval. An interval of zero
//! disables both.

use std::time::Duration;
use tokio::time::Instant;

/// What the owner of the link should do now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    last_sent: Instant,
    last_received: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_sent: now,
            last_received: now,
            ping_sent_at: None,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// How long a ping may go unanswered
    pub fn response_timeout(&self) -> Duration {
        self.interval.mul_f64(1.5)
    }

    pub fn on_send(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn on_receive(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.ping_sent_at = Some(now);
    }

    pub fn on_ping_response(&mut self, now: Instant) {
        self.last_received = now;
        self.ping_sent_at = None;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Next instant at which [`poll`](Self::poll) may return something other than `Idle`
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.enabled() {
            return None;
        }
        Some(match self.ping_sent_at {
            Some(sent) => sent + self.response_timeout(),
            None => self.quiet_since() + self.interval,
        })
    }

    /// Start of the longer of the two idle periods
    fn quiet_since(&self) -> Instant {
        self.last_sent.min(self.last_received)
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        if !self.enabled() {
            return KeepAliveAction::Idle;
        }
        match self.ping_sent_at {
            Some(sent) if now.duration_since(sent) >= self.response_timeout() => {
                KeepAliveAction::TimedOut
            }
            Some(_) => KeepAliveAction::Idle,
            None if now.duration_since(self.quiet_since()) >= self.interval => {
                KeepAliveAction::SendPing
            }
            None => KeepAliveAction::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_pings() {
        let start = Instant::now();
        let keep_alive = KeepAlive::new(Duration::ZERO, start);

        assert!(!keep_alive.enabled());
        assert_eq!(keep_alive.next_deadline(), None);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(3600)),
            KeepAliveAction::Idle
        );
    }

    #[test]
    fn test_ping_due_after_idle_interval() {
        let start = Instant::now();
        let keep_alive = KeepAlive::new(Duration::from_secs(60), start);

        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(59)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(60)),
            KeepAliveAction::SendPing
        );
        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_secs(60))
        );
    }

    #[test]
    fn test_traffic_both_ways_resets_idle_timer() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(60), start);

        keep_alive.on_send(start + Duration::from_secs(30));
        keep_alive.on_receive(start + Duration::from_secs(30));

        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(60)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(90)),
            KeepAliveAction::SendPing
        );
    }

    #[test]
    fn test_silent_peer_triggers_ping_while_sending() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(10), start);

        for second in 1..10 {
            keep_alive.on_send(start + Duration::from_secs(second));
        }

        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(10)),
            KeepAliveAction::SendPing
        );
        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_secs(10))
        );
    }

    #[test]
    fn test_two_way_traffic_defers_ping() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(10), start);

        keep_alive.on_send(start + Duration::from_secs(8));
        keep_alive.on_receive(start + Duration::from_secs(9));

        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(17)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(18)),
            KeepAliveAction::SendPing
        );
    }

    #[test]
    fn test_unanswered_ping_times_out_after_one_and_a_half_intervals() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(60), start);
        let ping_at = start + Duration::from_secs(60);

        keep_alive.on_ping_sent(ping_at);

        assert!(keep_alive.ping_outstanding());
        assert_eq!(
            keep_alive.poll(ping_at + Duration::from_secs(89)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(ping_at + Duration::from_secs(90)),
            KeepAliveAction::TimedOut
        );
        assert_eq!(
            keep_alive.next_deadline(),
            Some(ping_at + Duration::from_secs(90))
        );
    }

    #[test]
    fn test_ping_response_clears_outstanding_ping() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(Duration::from_secs(10), start);
        let ping_at = start + Duration::from_secs(10);

        keep_alive.on_ping_sent(ping_at);
        keep_alive.on_ping_response(ping_at + Duration::from_millis(50));

        assert!(!keep_alive.ping_outstanding());
        assert_eq!(
            keep_alive.poll(ping_at + Duration::from_secs(5)),
            KeepAliveAction::Idle
        );
        assert_eq!(
            keep_alive.poll(ping_at + Duration::from_millis(10_050)),
            KeepAliveAction::SendPing
        );
    }
}
