//! Receive side: in-order reassembly and the per-connection receive loop.
//!
//! [`Reassembler`] is a pure state machine:
//!
//! - `seq == expected`: deliver, advance, then drain any buffered successors.
//! - `seq >  expected`: buffer (the first copy wins), within the limits below.
//! - `seq <  expected`: duplicate, discard.
//!
//! The out-of-order buffer is bounded twice: a packet more than
//! [`MAX_REORDER_DISTANCE`] ahead of `expected`, or one that would push the
//! buffered payload past [`MAX_BUFFERED_BYTES`], is discarded as if lost.
//!
//! Every packet that survives loss simulation is answered with the
//! cumulative ACK `expected - 1`, whether or not it moved the window.  The
//! ACK value therefore never decreases over a connection.
//!
//! [`receive_stream`] drives a reassembler over a byte stream, applying the
//! [`LossSimulator`] before anything else touches an arriving packet.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;
use crate::packet::{self, Frame, END_OF_SESSION};
use crate::simulator::LossSimulator;

// ---------------------------------------------------------------------------
// Reassembler
// ---------------------------------------------------------------------------

/// Furthest a buffered packet may sit ahead of `expected`, in packets.
pub const MAX_REORDER_DISTANCE: u32 = 1 << 16;

/// Ceiling on payload bytes held in the out-of-order buffer.
pub const MAX_BUFFERED_BYTES: usize = 256 * 1024 * 1024;

/// What happened to one accepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered, followed by `flushed` previously buffered packets.
    InOrder { flushed: usize },
    /// Held until the gap before it closes.
    Buffered,
    /// Ahead of the window but already held; this copy was discarded.
    AlreadyBuffered,
    /// Already delivered; discarded.
    Duplicate,
    /// Too far ahead, or the buffer is full; discarded.
    OutOfWindow,
}

/// Result of [`Reassembler::on_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub disposition: Disposition,
    /// Payloads now ready for the output, in sequence order.
    pub ready: Vec<Vec<u8>>,
    /// Cumulative ACK to send back.
    pub ack: u32,
}

#[derive(Debug)]
pub struct Reassembler {
    /// Next in-order sequence number wanted.
    expected: u32,
    out_of_order: BTreeMap<u32, Vec<u8>>,
    buffered_bytes: usize,
    max_distance: u32,
    max_bytes: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_limits(MAX_REORDER_DISTANCE, MAX_BUFFERED_BYTES)
    }

    /// Reassembler holding at most `max_distance` packets ahead of the gap
    /// and at most `max_bytes` of buffered payload.
    pub fn with_limits(max_distance: u32, max_bytes: usize) -> Self {
        Self {
            expected: 1,
            out_of_order: BTreeMap::new(),
            buffered_bytes: 0,
            max_distance,
            max_bytes,
        }
    }

    pub fn on_packet(&mut self, seq: u32, payload: Vec<u8>) -> Accepted {
        let mut ready = Vec::new();
        let disposition = if seq == self.expected {
            ready.push(payload);
            self.expected += 1;
            while let Some(next) = self.out_of_order.remove(&self.expected) {
                self.buffered_bytes -= next.len();
                ready.push(next);
                self.expected += 1;
            }
            Disposition::InOrder {
                flushed: ready.len() - 1,
            }
        } else if seq > self.expected {
            if self.out_of_order.contains_key(&seq) {
                Disposition::AlreadyBuffered
            } else if seq - self.expected > self.max_distance
                || self.buffered_bytes + payload.len() > self.max_bytes
            {
                Disposition::OutOfWindow
            } else {
                self.buffered_bytes += payload.len();
                self.out_of_order.insert(seq, payload);
                Disposition::Buffered
            }
        } else {
            Disposition::Duplicate
        };

        Accepted {
            disposition,
            ready,
            ack: self.ack_number(),
        }
    }

    /// Highest contiguous sequence number received (`expected - 1`).
    pub fn ack_number(&self) -> u32 {
        self.expected - 1
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Packets held ahead of a gap.
    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// Counters for one finished receive session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Packets read off the stream, dropped ones included.
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    /// Packets discarded because the reorder buffer could not take them.
    pub out_of_window: u64,
    pub bytes_written: u64,
    pub final_ack: u32,
}

/// Receive packets from `reader` until the end-of-stream sentinel, writing
/// reassembled bytes to `output` and ACKs to `writer`.
///
/// After the sentinel the end-of-session marker is written on the ACK
/// direction.  A stream that closes before the sentinel is
/// [`TransferError::ConnectionClosed`].
pub async fn receive_stream<R, W, O>(
    reader: &mut R,
    writer: &mut W,
    output: &mut O,
    loss: &mut LossSimulator,
    label: &str,
) -> Result<ReceiveReport, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut reassembler = Reassembler::new();
    let mut report = ReceiveReport::default();

    loop {
        let packet = match packet::read_frame(reader).await? {
            Some(Frame::Data(packet)) => packet,
            Some(Frame::EndOfStream) => {
                info!("[{label}] end-of-stream sentinel received");
                break;
            }
            None => {
                info!("[{label}] peer closed before end-of-stream");
                return Err(TransferError::ConnectionClosed);
            }
        };
        report.packets_received += 1;

        if loss.should_drop(packet.seq) {
            report.packets_dropped += 1;
            debug!("[{label}] ~~ dropped packet {} (simulated) ~~", packet.seq);
            continue;
        }

        let seq = packet.seq;
        let accepted = reassembler.on_packet(seq, packet.payload);
        match accepted.disposition {
            Disposition::InOrder { flushed } => {
                debug!("[{label}] received packet {seq}");
                if flushed > 0 {
                    debug!("[{label}] flushed {flushed} buffered packet(s) after {seq}");
                }
            }
            Disposition::Buffered => {
                report.out_of_order += 1;
                debug!("[{label}] buffered out-of-order packet {seq}");
            }
            Disposition::AlreadyBuffered | Disposition::Duplicate => {
                report.duplicates += 1;
                debug!("[{label}] discarded duplicate packet {seq}");
            }
            Disposition::OutOfWindow => {
                report.out_of_window += 1;
                warn!(
                    "[{label}] discarded packet {seq}: {} buffered, {} bytes",
                    reassembler.buffered(),
                    reassembler.buffered_bytes()
                );
            }
        }

        for chunk in &accepted.ready {
            output.write_all(chunk).await?;
            report.bytes_written += chunk.len() as u64;
        }

        packet::write_ack(writer, accepted.ack as i32).await?;
        writer.flush().await?;
        debug!("[{label}] -> ACK {}", accepted.ack);
    }

    output.flush().await?;
    report.final_ack = reassembler.ack_number();

    packet::write_ack(writer, END_OF_SESSION).await?;
    writer.flush().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{write_frame, Packet};

    fn payload(seq: u32) -> Vec<u8> {
        format!("<{seq}>").into_bytes()
    }

    #[test]
    fn in_order_delivery() {
        let mut r = Reassembler::new();
        for seq in 1..=3 {
            let a = r.on_packet(seq, payload(seq));
            assert_eq!(a.disposition, Disposition::InOrder { flushed: 0 });
            assert_eq!(a.ready, vec![payload(seq)]);
            assert_eq!(a.ack, seq);
        }
    }

    #[test]
    fn gap_buffers_then_flushes() {
        let mut r = Reassembler::new();
        r.on_packet(1, payload(1));
        for seq in 3..=5 {
            let a = r.on_packet(seq, payload(seq));
            assert_eq!(a.disposition, Disposition::Buffered);
            assert!(a.ready.is_empty());
            assert_eq!(a.ack, 1); // cumulative ACK stays put
        }
        assert_eq!(r.buffered(), 3);

        let a = r.on_packet(2, payload(2));
        assert_eq!(a.disposition, Disposition::InOrder { flushed: 3 });
        assert_eq!(a.ready, (2..=5).map(payload).collect::<Vec<_>>());
        assert_eq!(a.ack, 5);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn first_buffered_copy_wins() {
        let mut r = Reassembler::new();
        r.on_packet(3, b"first".to_vec());
        let a = r.on_packet(3, b"second".to_vec());
        assert_eq!(a.disposition, Disposition::AlreadyBuffered);
        r.on_packet(2, b"".to_vec());
        let a = r.on_packet(1, b"".to_vec());
        assert_eq!(a.ready.last().unwrap(), b"first");
    }

    #[test]
    fn old_packets_are_duplicates() {
        let mut r = Reassembler::new();
        r.on_packet(1, payload(1));
        r.on_packet(2, payload(2));
        let a = r.on_packet(1, payload(1));
        assert_eq!(a.disposition, Disposition::Duplicate);
        assert!(a.ready.is_empty());
        assert_eq!(a.ack, 2);
    }

    #[test]
    fn nothing_received_acks_zero() {
        let mut r = Reassembler::new();
        let a = r.on_packet(4, payload(4));
        assert_eq!(a.ack, 0);
    }

    #[test]
    fn ack_never_decreases_under_shuffled_arrivals() {
        let order = [5u32, 2, 9, 1, 1, 3, 8, 4, 2, 7, 6, 10, 3];
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        let mut last = 0;
        for seq in order {
            let a = r.on_packet(seq, payload(seq));
            assert!(a.ack >= last);
            last = a.ack;
            out.extend(a.ready.into_iter().flatten());
        }
        let expected: Vec<u8> = (1..=10).flat_map(payload).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn far_ahead_packets_are_not_buffered() {
        let mut r = Reassembler::with_limits(4, usize::MAX);
        assert_eq!(r.on_packet(5, payload(5)).disposition, Disposition::Buffered);
        let a = r.on_packet(6, payload(6));
        assert_eq!(a.disposition, Disposition::OutOfWindow);
        assert_eq!(a.ack, 0);
        assert_eq!(r.buffered(), 1);
    }

    #[test]
    fn buffered_bytes_are_capped_and_released() {
        let mut r = Reassembler::with_limits(u32::MAX, 10);
        assert_eq!(r.on_packet(2, vec![0; 6]).disposition, Disposition::Buffered);
        assert_eq!(r.on_packet(3, vec![0; 6]).disposition, Disposition::OutOfWindow);
        assert_eq!(r.buffered_bytes(), 6);

        // Closing the gap frees the space again.
        let a = r.on_packet(1, vec![0; 1]);
        assert_eq!(a.disposition, Disposition::InOrder { flushed: 1 });
        assert_eq!(r.buffered_bytes(), 0);
        assert_eq!(r.on_packet(4, vec![0; 6]).disposition, Disposition::Buffered);
    }

    #[test]
    fn flood_of_distinct_future_packets_stays_bounded() {
        let mut r = Reassembler::new();
        for seq in 2..=(MAX_REORDER_DISTANCE + 1000) {
            r.on_packet(seq, Vec::new());
        }
        assert_eq!(r.buffered(), MAX_REORDER_DISTANCE as usize);
    }

    async fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut buf = Vec::new();
        for f in frames {
            write_frame(&mut buf, f).await.unwrap();
        }
        buf
    }

    fn data(seq: u32) -> Frame {
        Frame::Data(Packet {
            seq,
            payload: payload(seq),
        })
    }

    async fn acks(mut bytes: &[u8]) -> Vec<i32> {
        let mut out = Vec::new();
        while let Some(a) = packet::read_ack(&mut bytes).await.unwrap() {
            out.push(a);
        }
        out
    }

    #[tokio::test]
    async fn receive_loop_acks_and_writes() {
        let input = wire(&[data(1), data(3), data(2), Frame::EndOfStream]).await;
        let mut ack_out = Vec::new();
        let mut file = Vec::new();
        let mut loss = LossSimulator::disabled();

        let report = receive_stream(&mut &input[..], &mut ack_out, &mut file, &mut loss, "t")
            .await
            .unwrap();

        assert_eq!(file, [payload(1), payload(2), payload(3)].concat());
        assert_eq!(acks(&ack_out).await, vec![1, 1, 3, END_OF_SESSION]);
        assert_eq!(report.packets_received, 3);
        assert_eq!(report.out_of_order, 1);
        assert_eq!(report.final_ack, 3);
    }

    #[tokio::test]
    async fn dropped_packet_gets_no_ack() {
        let input = wire(&[data(1), data(2), data(3), data(2), Frame::EndOfStream]).await;
        let mut ack_out = Vec::new();
        let mut file = Vec::new();
        let mut loss = LossSimulator::scripted([2]);

        let report = receive_stream(&mut &input[..], &mut ack_out, &mut file, &mut loss, "t")
            .await
            .unwrap();

        // 1 -> ack 1; 2 dropped silently; 3 buffered -> ack 1; 2 again -> ack 3
        assert_eq!(acks(&ack_out).await, vec![1, 1, 3, END_OF_SESSION]);
        assert_eq!(report.packets_dropped, 1);
        assert_eq!(file, [payload(1), payload(2), payload(3)].concat());
    }

    #[tokio::test]
    async fn close_without_sentinel_is_fatal() {
        let input = wire(&[data(1)]).await;
        let mut ack_out = Vec::new();
        let mut file = Vec::new();
        let err = receive_stream(
            &mut &input[..],
            &mut ack_out,
            &mut file,
            &mut LossSimulator::disabled(),
            "t",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::ConnectionClosed));
    }

    #[tokio::test]
    async fn truncated_frame_is_fatal() {
        let mut input = wire(&[data(1)]).await;
        input.truncate(input.len() - 1);
        let err = receive_stream(
            &mut &input[..],
            &mut Vec::new(),
            &mut Vec::new(),
            &mut LossSimulator::disabled(),
            "t",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Truncated { .. }));
    }
}
