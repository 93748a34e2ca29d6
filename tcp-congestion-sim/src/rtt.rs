//! Round-trip-time estimation and retransmission timeout (RTO) derivation.
//!
//! The estimator follows Jacobson's algorithm:
//!
//! ```text
//! first sample S:   SRTT = S                      RTTVAR = S / 2
//! later samples:    SRTT = (1 - a) * SRTT + a * S
//!                   RTTVAR = (1 - b) * RTTVAR + b * |S - SRTT|
//! RTO = min(SRTT + 4 * RTTVAR, max_rto)           a = 1/8, b = 1/4
//! ```
//!
//! The deviation term uses the freshly updated SRTT.  On each retransmission
//! timeout the RTO doubles (capped at `max_rto`) and stays backed off until
//! the next genuine sample recomputes it.  Callers must never feed samples
//! from retransmitted packets (Karn's rule); [`crate::congestion`] enforces
//! that by forgetting the send time of anything it retransmits.

use std::time::Duration;

/// Gain applied to each new sample in the SRTT average.
pub const ALPHA: f64 = 0.125;
/// Gain applied to each new deviation in the RTTVAR average.
pub const BETA: f64 = 0.25;

/// Timeout bounds for one estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtoBounds {
    /// RTO used before the first sample arrives.
    pub initial: Duration,
    /// Lower clamp on computed RTOs.
    pub min: Duration,
    /// Upper clamp on both computed and backed-off RTOs.
    pub max: Duration,
}

impl Default for RtoBounds {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            min: Duration::from_millis(10),
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RttEstimator {
    bounds: RtoBounds,
    /// Smoothed RTT (estimatedRTT).
    srtt: Option<Duration>,
    /// RTT deviation (deviationRTT).
    rttvar: Option<Duration>,
    /// Timeout the next timer arm will use.
    current_rto: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(RtoBounds::default())
    }
}

impl RttEstimator {
    pub fn new(bounds: RtoBounds) -> Self {
        Self {
            bounds,
            srtt: None,
            rttvar: None,
            current_rto: bounds.initial.min(bounds.max),
        }
    }

    /// Fold one genuine RTT sample into the averages and recompute the RTO.
    pub fn record_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let srtt = srtt.mul_f64(1.0 - ALPHA) + sample.mul_f64(ALPHA);
                let rttvar =
                    rttvar.mul_f64(1.0 - BETA) + abs_diff(sample, srtt).mul_f64(BETA);
                self.srtt = Some(srtt);
                self.rttvar = Some(rttvar);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.current_rto = self.computed_rto();
    }

    /// Double the RTO after a retransmission timeout, capped at `max`.
    pub fn back_off(&mut self) {
        self.current_rto = self.current_rto.saturating_mul(2).min(self.bounds.max);
    }

    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Option<Duration> {
        self.rttvar
    }

    fn computed_rto(&self) -> Duration {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => (srtt + rttvar * 4)
                .max(self.bounds.min)
                .min(self.bounds.max),
            _ => self.bounds.initial,
        }
    }
}

#[inline]
fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn close(a: Duration, b: Duration) -> bool {
        abs_diff(a, b) < Duration::from_micros(2)
    }

    #[test]
    fn initial_rto_before_samples() {
        let est = RttEstimator::default();
        assert_eq!(est.rto(), ms(200));
        assert_eq!(est.srtt(), None);
    }

    #[test]
    fn first_sample_seeds_estimates() {
        let mut est = RttEstimator::default();
        est.record_sample(ms(100));
        assert_eq!(est.srtt(), Some(ms(100)));
        assert_eq!(est.rttvar(), Some(ms(50)));
        assert_eq!(est.rto(), ms(300));
    }

    #[test]
    fn ewma_update_uses_new_srtt_for_deviation() {
        let mut est = RttEstimator::default();
        est.record_sample(ms(100));
        est.record_sample(ms(180));
        // SRTT = 0.875*100 + 0.125*180 = 110
        // RTTVAR = 0.75*50 + 0.25*|180 - 110| = 55
        assert!(close(est.srtt().unwrap(), ms(110)));
        assert!(close(est.rttvar().unwrap(), ms(55)));
        assert!(close(est.rto(), ms(330)));
    }

    #[test]
    fn rto_capped_at_max() {
        let mut est = RttEstimator::new(RtoBounds {
            initial: ms(200),
            min: Duration::ZERO,
            max: ms(1000),
        });
        est.record_sample(ms(900));
        assert_eq!(est.rto(), ms(1000));
    }

    #[test]
    fn rto_floor_applies_to_computed_values() {
        let mut est = RttEstimator::new(RtoBounds {
            initial: ms(200),
            min: ms(50),
            max: ms(1000),
        });
        est.record_sample(Duration::from_micros(100));
        assert_eq!(est.rto(), ms(50));
    }

    #[test]
    fn back_off_doubles_until_cap() {
        let mut est = RttEstimator::new(RtoBounds {
            initial: ms(200),
            min: Duration::ZERO,
            max: ms(1000),
        });
        est.back_off();
        assert_eq!(est.rto(), ms(400));
        est.back_off();
        assert_eq!(est.rto(), ms(800));
        est.back_off();
        assert_eq!(est.rto(), ms(1000));
        est.back_off();
        assert_eq!(est.rto(), ms(1000));
    }

    #[test]
    fn backed_off_rto_held_until_next_sample() {
        let mut est = RttEstimator::default();
        est.record_sample(ms(100));
        est.back_off();
        assert_eq!(est.rto(), ms(600));
        // Estimates are untouched by back-off.
        assert_eq!(est.srtt(), Some(ms(100)));

        est.record_sample(ms(100));
        // SRTT stays 100, RTTVAR = 0.75*50 = 37.5 → RTO = 250
        assert!(close(est.rto(), Duration::from_micros(250_000)));
    }
}
