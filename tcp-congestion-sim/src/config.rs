//! Startup configuration for both ends of a transfer.
//!
//! All knobs are plain values with defaults matching the classic lab setup
//! (1 KiB packets, `ssthresh = 8`, 200 ms initial RTO capped at 5 s, 10 %
//! simulated loss).  `main.rs` maps CLI flags onto these structs; library
//! callers and tests build them directly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::congestion::{CongestionMode, MIN_SSTHRESH};
use crate::error::TransferError;
use crate::rtt::RtoBounds;

pub const DEFAULT_PORT: u16 = 3923;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_INITIAL_SSTHRESH: u32 = 8;
pub const DEFAULT_LOSS_PROBABILITY: f64 = 0.10;

/// Sender-side parameters.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Payload bytes per packet.
    pub chunk_size: usize,
    pub initial_ssthresh: u32,
    pub mode: CongestionMode,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Stop after this many rounds even if packets remain unacknowledged.
    pub max_rounds: Option<u32>,
    /// Abort after this many consecutive timeouts of the same packet.
    pub max_retransmits: Option<u32>,
    /// How long to wait for the receiver's end-of-session marker.
    pub close_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_ssthresh: DEFAULT_INITIAL_SSTHRESH,
            mode: CongestionMode::Tahoe,
            initial_rto: Duration::from_millis(200),
            min_rto: Duration::from_millis(10),
            max_rto: Duration::from_secs(5),
            max_rounds: None,
            max_retransmits: None,
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size must be at least 1 byte"));
        }
        if self.chunk_size > crate::packet::MAX_PAYLOAD_LEN {
            return Err(invalid(format!(
                "chunk_size must not exceed {} bytes",
                crate::packet::MAX_PAYLOAD_LEN
            )));
        }
        if self.initial_ssthresh < MIN_SSTHRESH {
            return Err(invalid(format!(
                "initial_ssthresh must be at least {MIN_SSTHRESH}"
            )));
        }
        if self.initial_rto.is_zero() {
            return Err(invalid("initial_rto must be positive"));
        }
        if self.max_rto < self.initial_rto {
            return Err(invalid("max_rto must not be below initial_rto"));
        }
        if self.min_rto > self.max_rto {
            return Err(invalid("min_rto must not exceed max_rto"));
        }
        Ok(())
    }

    pub fn rto_bounds(&self) -> RtoBounds {
        RtoBounds {
            initial: self.initial_rto,
            min: self.min_rto,
            max: self.max_rto,
        }
    }
}

/// Receiver-side parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory uploads are written into; created on demand.
    pub upload_dir: PathBuf,
    /// Probability of discarding each arriving packet.
    pub loss_probability: f64,
    /// Base RNG seed; connection `n` uses `seed + n`.
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            upload_dir: PathBuf::from("server_uploads"),
            loss_probability: DEFAULT_LOSS_PROBABILITY,
            seed: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if !(0.0..=1.0).contains(&self.loss_probability) {
            return Err(invalid("loss probability must be within [0, 1]"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> TransferError {
    TransferError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TransferConfig::default().validate().unwrap();
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_chunk() {
        let cfg = TransferConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(TransferError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_small_ssthresh() {
        let cfg = TransferConfig {
            initial_ssthresh: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_rto_bounds() {
        let cfg = TransferConfig {
            initial_rto: Duration::from_secs(10),
            max_rto: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TransferConfig {
            min_rto: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_loss_probability() {
        for p in [-0.1, 1.5, f64::NAN] {
            let cfg = ServerConfig {
                loss_probability: p,
                ..Default::default()
            };
            assert!(cfg.validate().is_err(), "{p} accepted");
        }
    }

    #[test]
    fn rto_bounds_follow_config() {
        let cfg = TransferConfig::default();
        let b = cfg.rto_bounds();
        assert_eq!(b.initial, Duration::from_millis(200));
        assert_eq!(b.max, Duration::from_secs(5));
    }
}
