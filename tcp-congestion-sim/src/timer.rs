//! The sender's single retransmission timer.
//!
//! Exactly one deadline is live at a time and it always belongs to the
//! oldest unacknowledged packet.  [`RetransmitTimer`] wraps a pinned
//! `tokio::time::Sleep` so the transmit loop can poll it inside
//! `tokio::select!` next to the ACK channel:
//!
//! ```ignore
//! tokio::select! {
//!     ev = acks.recv() => { /* may call timer.arm() / timer.cancel() */ }
//!     _ = timer.expired(), if timer.is_armed() => { /* timeout transition */ }
//! }
//! ```
//!
//! A disarmed timer parks its sleep far in the future; the `is_armed` guard
//! keeps `select!` from ever polling it in that state.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Deadline used while the timer is disarmed.
const PARKED: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug)]
pub struct RetransmitTimer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
    /// Timeout the timer was last armed with.
    armed_for: Duration,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RetransmitTimer {
    pub fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(PARKED)),
            armed: false,
            armed_for: Duration::ZERO,
        }
    }

    /// (Re)start the countdown; any earlier deadline is discarded.
    pub fn arm(&mut self, rto: Duration) {
        self.sleep.as_mut().reset(Instant::now() + rto);
        self.armed = true;
        self.armed_for = rto;
    }

    pub fn cancel(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + PARKED);
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn armed_for(&self) -> Duration {
        self.armed_for
    }

    /// Resolve once the armed deadline passes; the timer is disarmed on return.
    ///
    /// Only poll this while [`is_armed`](Self::is_armed) is true.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_armed_duration() {
        let mut timer = RetransmitTimer::new();
        let start = Instant::now();
        timer.arm(Duration::from_millis(200));
        assert!(timer.is_armed());

        timer.expired().await;
        assert!(!timer.is_armed());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_deadline() {
        let mut timer = RetransmitTimer::new();
        let start = Instant::now();
        timer.arm(Duration::from_millis(50));
        timer.arm(Duration::from_millis(400));
        assert_eq!(timer.armed_for(), Duration::from_millis(400));

        timer.expired().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_is_not_polled_by_select() {
        let mut timer = RetransmitTimer::new();
        timer.arm(Duration::from_millis(10));
        timer.cancel();
        assert!(!timer.is_armed());

        let fired = tokio::select! {
            _ = timer.expired(), if timer.is_armed() => true,
            _ = tokio::time::sleep(Duration::from_millis(100)) => false,
        };
        assert!(!fired);
    }
}
