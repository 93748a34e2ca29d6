//! Receiver-side loss simulation.
//!
//! The byte stream underneath the protocol never loses data, so loss is
//! injected where the receiver reads packets: a dropped packet is discarded
//! and **no ACK** is sent for it, which is exactly what the sender would see
//! if the packet had vanished on the wire.
//!
//! | Model      | Behaviour                                                  |
//! |------------|------------------------------------------------------------|
//! | `none`     | Every packet is delivered.                                 |
//! | `random`   | Each arrival is dropped with probability `p`.              |
//! | `scripted` | Drops the first arrival of each listed sequence number.    |
//!
//! The random model takes an optional seed so that failures reproduce.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
enum LossModel {
    None,
    Random { probability: f64, rng: StdRng },
    /// Remaining drops per sequence number.
    Scripted(HashMap<u32, u32>),
}

#[derive(Debug)]
pub struct LossSimulator {
    model: LossModel,
    dropped: u64,
}

impl Default for LossSimulator {
    fn default() -> Self {
        Self::disabled()
    }
}

impl LossSimulator {
    /// Pass-through: nothing is ever dropped.
    pub fn disabled() -> Self {
        Self {
            model: LossModel::None,
            dropped: 0,
        }
    }

    /// Drop each arrival independently with `probability` in `[0, 1]`.
    ///
    /// With `seed = None` the generator is seeded from OS entropy.
    pub fn random(probability: f64, seed: Option<u64>) -> Self {
        debug_assert!((0.0..=1.0).contains(&probability));
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            model: LossModel::Random { probability, rng },
            dropped: 0,
        }
    }

    /// Drop one arrival of each listed sequence number.  Listing a number
    /// twice drops its first two arrivals.
    pub fn scripted<I>(drops: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let mut pending = HashMap::new();
        for seq in drops {
            *pending.entry(seq).or_insert(0) += 1;
        }
        Self {
            model: LossModel::Scripted(pending),
            dropped: 0,
        }
    }

    /// Decide the fate of one arriving packet.
    pub fn should_drop(&mut self, seq: u32) -> bool {
        let drop = match &mut self.model {
            LossModel::None => false,
            LossModel::Random { probability, rng } => rng.random::<f64>() < *probability,
            LossModel::Scripted(pending) => match pending.get_mut(&seq) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            },
        };
        if drop {
            self.dropped += 1;
        }
        drop
    }

    /// Packets dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_drops() {
        let mut sim = LossSimulator::disabled();
        assert!((1..=1000).all(|seq| !sim.should_drop(seq)));
        assert_eq!(sim.dropped(), 0);
    }

    #[test]
    fn scripted_drops_first_arrival_only() {
        let mut sim = LossSimulator::scripted([3]);
        assert!(!sim.should_drop(1));
        assert!(sim.should_drop(3));
        assert!(!sim.should_drop(3)); // retransmission gets through
        assert_eq!(sim.dropped(), 1);
    }

    #[test]
    fn scripted_repeats_count() {
        let mut sim = LossSimulator::scripted([5, 5]);
        assert!(sim.should_drop(5));
        assert!(sim.should_drop(5));
        assert!(!sim.should_drop(5));
    }

    #[test]
    fn random_extremes() {
        let mut never = LossSimulator::random(0.0, Some(1));
        let mut always = LossSimulator::random(1.0, Some(1));
        for seq in 1..=200 {
            assert!(!never.should_drop(seq));
            assert!(always.should_drop(seq));
        }
    }

    #[test]
    fn random_is_reproducible_with_seed() {
        let mut a = LossSimulator::random(0.3, Some(42));
        let mut b = LossSimulator::random(0.3, Some(42));
        let pa: Vec<bool> = (1..=500).map(|s| a.should_drop(s)).collect();
        let pb: Vec<bool> = (1..=500).map(|s| b.should_drop(s)).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn random_rate_is_roughly_probability() {
        let mut sim = LossSimulator::random(0.1, Some(7));
        for seq in 1..=10_000 {
            sim.should_drop(seq);
        }
        let rate = sim.dropped() as f64 / 10_000.0;
        assert!((0.07..0.13).contains(&rate), "rate was {rate}");
    }
}
