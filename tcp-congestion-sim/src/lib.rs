//! `tcp-congestion-sim` - TCP Tahoe / Reno congestion control over a lossy
//! packet channel layered on a TCP byte stream.
//!
//! # Architecture
//!
//! ```text
//!  client                                         server
//!  ┌──────────────────────────┐   packets   ┌──────────────────────────┐
//!  │ sender round loop        │────────────▶│ LossSimulator            │
//!  │  ├── CongestionController│             │   └── Reassembler        │
//!  │  └── RetransmitTimer     │   ACKs      │         └── upload file  │
//!  │ ack listener task        │◀────────────│                          │
//!  └──────────────────────────┘             └──────────────────────────┘
//! ```
//!
//! The stream below is reliable, so loss is simulated at the receiver: a
//! dropped packet is simply never acknowledged.
//!
//! Each module has a single responsibility:
//! - [`packet`]     : wire format, framing helpers, packetization
//! - [`rtt`]        : smoothed RTT / RTO estimation
//! - [`timer`]      : the single retransmission timer
//! - [`congestion`] : window, threshold, duplicate-ACK state machine
//! - [`sender`]     : round loop and ACK listener
//! - [`receiver`]   : in-order reassembly and the receive loop
//! - [`simulator`]  : receiver-side packet loss
//! - [`server`]     : accept loop and per-connection sessions
//! - [`client`]     : connect, handshake, transfer
//! - [`config`]     : startup parameters
//! - [`error`]      : error taxonomy

pub mod client;
pub mod config;
pub mod congestion;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod timer;

pub use config::{ServerConfig, TransferConfig};
pub use congestion::CongestionMode;
pub use error::TransferError;
