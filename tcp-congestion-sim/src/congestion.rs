//! Sender-side congestion control state machine (Tahoe / Reno).
//!
//! [`CongestionController`] owns every piece of mutable sender state: the
//! sliding window (`base`, `next_seq`), the congestion window and threshold,
//! duplicate-ACK tracking, the in-flight buffer and the RTT estimator.  It
//! performs no I/O and never sleeps; the transmit loop in [`crate::sender`]
//! feeds it ACKs and timer expiries and carries out the transmissions it
//! asks for.  Because one owner applies every event in arrival order, ACK
//! handling, timeouts and admission can never race on `base` or `cwnd`.
//!
//! # Window layout
//!
//! ```text
//!   acked        in flight            sendable (cwnd permitting)
//! ────────┼──────────────────────┼────────────────────────▶ seq
//!        base                 next_seq                total+1
//! ```
//!
//! # Transitions
//!
//! | Event                  | ssthresh           | cwnd (Tahoe) | cwnd (Reno) |
//! |------------------------|--------------------|--------------|-------------|
//! | round without loss     | –                  | ×2 below ssthresh, else +1 ||
//! | third duplicate ACK    | max(cwnd / 2, 2)   | 1            | ssthresh    |
//! | retransmission timeout | max(cwnd / 2, 2)   | 1            | 1           |
//!
//! Growth is applied once per sending round by [`CongestionController::end_round`],
//! not per ACK.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;

use crate::packet::Packet;
use crate::rtt::RttEstimator;

/// Number of duplicate ACKs that signals a loss.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Lower bound on `ssthresh` after any loss.
pub const MIN_SSTHRESH: u32 = 2;

/// Loss-response variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionMode {
    /// Every loss collapses the window to one packet.
    #[default]
    Tahoe,
    /// Triple duplicate ACKs resume at `ssthresh` (fast recovery).
    Reno,
}

impl fmt::Display for CongestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tahoe => f.write_str("tahoe"),
            Self::Reno => f.write_str("reno"),
        }
    }
}

impl FromStr for CongestionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tahoe" | "1" => Ok(Self::Tahoe),
            "reno" | "2" => Ok(Self::Reno),
            other => Err(format!("unknown congestion mode `{other}` (expected tahoe or reno)")),
        }
    }
}

/// Growth regime implied by the current `cwnd` / `ssthresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoidance,
}

/// A packet that has been sent but not yet covered by a cumulative ACK.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub packet: Packet,
    /// Total transmissions of this packet (1 = first send).
    pub tx_count: u32,
    /// Time of the first transmission; cleared once the packet is
    /// retransmitted so it can no longer produce an RTT sample.
    pub first_sent_at: Option<Instant>,
}

/// Result of feeding one ACK to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Older than the last cumulative ACK, or beyond anything sent.  Ignored.
    Stale,
    /// The window slid forward.
    New {
        /// Number of packets this ACK newly covered.
        acked: u32,
        /// RTT sample taken from the packet at `ack`, if it was eligible.
        sample: Option<Duration>,
        /// `true` when nothing is left in flight (cancel the timer);
        /// otherwise the timer must restart for the new `base`.
        window_empty: bool,
    },
    /// A repeat of the last cumulative ACK that did not trigger recovery.
    Duplicate { count: u32 },
    /// Third duplicate: the caller must retransmit `seq` and restart the timer.
    FastRetransmit { seq: u32 },
}

/// Point-in-time copy of the controller's counters, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderSnapshot {
    pub base: u32,
    pub next_seq: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub last_ack: u32,
    pub dup_acks: u32,
    pub phase: Phase,
    pub in_recovery: bool,
    pub rto: Duration,
}

#[derive(Debug)]
pub struct CongestionController {
    mode: CongestionMode,
    /// Every packet of the transfer, indexed by `seq - 1`.
    packets: Vec<Packet>,

    /// Lowest unacknowledged sequence number.
    base: u32,
    /// Lowest sequence number never sent.
    next_seq: u32,
    cwnd: u32,
    ssthresh: u32,
    last_ack: u32,
    dup_acks: u32,
    /// Set by a fast retransmit; suppresses further fast retransmits until
    /// a new ACK or a timeout.
    in_recovery: bool,
    consecutive_timeouts: u32,

    in_flight: BTreeMap<u32, InFlightEntry>,
    rtt: RttEstimator,

    retransmissions: u64,
    timeouts: u64,
    fast_retransmits: u64,
}

impl CongestionController {
    /// Create a controller for `packets`, which must be numbered `1..=N`.
    ///
    /// # Panics
    ///
    /// Panics if `initial_ssthresh` is below [`MIN_SSTHRESH`].
    pub fn new(
        packets: Vec<Packet>,
        mode: CongestionMode,
        initial_ssthresh: u32,
        rtt: RttEstimator,
    ) -> Self {
        assert!(
            initial_ssthresh >= MIN_SSTHRESH,
            "initial_ssthresh must be at least {MIN_SSTHRESH}"
        );
        debug_assert!(packets.iter().zip(1u32..).all(|(p, seq)| p.seq == seq));
        Self {
            mode,
            packets,
            base: 1,
            next_seq: 1,
            cwnd: 1,
            ssthresh: initial_ssthresh,
            last_ack: 0,
            dup_acks: 0,
            in_recovery: false,
            consecutive_timeouts: 0,
            in_flight: BTreeMap::new(),
            rtt,
            retransmissions: 0,
            timeouts: 0,
            fast_retransmits: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit as many new packets as the window allows, recording them as
    /// sent at `now`.  Returns their sequence numbers in send order.
    pub fn admit(&mut self, now: Instant) -> Vec<u32> {
        let mut admitted = Vec::new();
        while self.can_admit() {
            let seq = self.next_seq;
            self.in_flight.insert(
                seq,
                InFlightEntry {
                    packet: self.packets[(seq - 1) as usize].clone(),
                    tx_count: 1,
                    first_sent_at: Some(now),
                },
            );
            self.next_seq += 1;
            admitted.push(seq);
        }
        admitted
    }

    /// `true` while `(next_seq - base) < cwnd` and unsent packets remain.
    pub fn can_admit(&self) -> bool {
        self.next_seq - self.base < self.cwnd && self.next_seq <= self.total()
    }

    /// Apply end-of-round growth.  Loss rounds leave the window as the loss
    /// transition set it.
    pub fn end_round(&mut self, loss: bool) {
        if loss {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_mul(2);
        } else {
            self.cwnd = self.cwnd.saturating_add(1);
        }
    }

    // -----------------------------------------------------------------------
    // Loss / ACK events
    // -----------------------------------------------------------------------

    /// Process one cumulative ACK received at `now`.
    pub fn on_ack(&mut self, ack: i32, now: Instant) -> AckOutcome {
        let Ok(ack) = u32::try_from(ack) else {
            return AckOutcome::Stale;
        };
        if ack < self.last_ack || ack >= self.next_seq {
            return AckOutcome::Stale;
        }

        if ack == self.last_ack {
            if self.window_empty() {
                // Nothing outstanding: a late repeat, not a loss signal.
                return AckOutcome::Duplicate { count: 0 };
            }
            self.dup_acks += 1;
            if self.dup_acks >= DUP_ACK_THRESHOLD && !self.in_recovery {
                return self.fast_retransmit();
            }
            return AckOutcome::Duplicate {
                count: self.dup_acks,
            };
        }

        // New ACK: sample, slide, forget everything it covers.
        let sample = self
            .in_flight
            .get(&ack)
            .and_then(|e| e.first_sent_at)
            .map(|sent| now.saturating_duration_since(sent));
        if let Some(s) = sample {
            self.rtt.record_sample(s);
        }

        let acked = ack - self.last_ack;
        self.in_flight = self.in_flight.split_off(&(ack + 1));
        self.base = ack + 1;
        self.last_ack = ack;
        self.dup_acks = 0;
        self.in_recovery = false;
        self.consecutive_timeouts = 0;

        AckOutcome::New {
            acked,
            sample,
            window_empty: self.window_empty(),
        }
    }

    fn fast_retransmit(&mut self) -> AckOutcome {
        self.ssthresh = (self.cwnd / 2).max(MIN_SSTHRESH);
        self.cwnd = match self.mode {
            CongestionMode::Tahoe => 1,
            CongestionMode::Reno => self.ssthresh,
        };
        self.dup_acks = 0;
        self.in_recovery = true;
        self.fast_retransmits += 1;
        let seq = self.base;
        self.mark_retransmitted(seq);
        AckOutcome::FastRetransmit { seq }
    }

    /// Apply the timeout transition and back off the RTO.
    ///
    /// Returns the sequence number to retransmit, or `None` if nothing is in
    /// flight (a stale expiry).
    pub fn on_timeout(&mut self) -> Option<u32> {
        if self.window_empty() {
            return None;
        }
        self.ssthresh = (self.cwnd / 2).max(MIN_SSTHRESH);
        self.cwnd = 1;
        self.dup_acks = 0;
        self.in_recovery = false;
        self.consecutive_timeouts += 1;
        self.timeouts += 1;
        self.rtt.back_off();
        let seq = self.base;
        self.mark_retransmitted(seq);
        Some(seq)
    }

    fn mark_retransmitted(&mut self, seq: u32) {
        if let Some(entry) = self.in_flight.get_mut(&seq) {
            entry.tx_count += 1;
            entry.first_sent_at = None;
            self.retransmissions += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Packet for `seq`, if it belongs to this transfer.
    pub fn packet(&self, seq: u32) -> Option<&Packet> {
        seq.checked_sub(1).and_then(|i| self.packets.get(i as usize))
    }

    pub fn in_flight(&self, seq: u32) -> Option<&InFlightEntry> {
        self.in_flight.get(&seq)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn window_empty(&self) -> bool {
        self.base == self.next_seq
    }

    /// All packets acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base > self.total()
    }

    pub fn total(&self) -> u32 {
        self.packets.len() as u32
    }

    pub fn mode(&self) -> CongestionMode {
        self.mode
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn phase(&self) -> Phase {
        if self.cwnd < self.ssthresh {
            Phase::SlowStart
        } else {
            Phase::CongestionAvoidance
        }
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    pub fn fast_retransmits(&self) -> u64 {
        self.fast_retransmits
    }

    pub fn snapshot(&self) -> SenderSnapshot {
        SenderSnapshot {
            base: self.base,
            next_seq: self.next_seq,
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            last_ack: self.last_ack,
            dup_acks: self.dup_acks,
            phase: self.phase(),
            in_recovery: self.in_recovery,
            rto: self.rtt.rto(),
        }
    }
}
