//! Sender session: the transmit/round loop and the ACK listener.
//!
//! # Architecture
//!
//! ```text
//!              write half                         read half
//!  ┌─────────────────────────────┐        ┌──────────────────────┐
//!  │ round loop (state owner)    │◀─mpsc──│ ack_listener task    │
//!  │  ├── CongestionController   │ AckEvent│  read int32 ACKs     │
//!  │  └── RetransmitTimer        │        └──────────────────────┘
//!  └─────────────────────────────┘
//! ```
//!
//! The listener only parses ACKs and forwards them over an unbounded
//! channel, so it blocks on socket reads alone and keeps draining ACKs while
//! the round loop is busy writing a window.  Every state change is made by
//! the round loop, which multiplexes the ACK channel and the retransmission
//! timer with `tokio::select!`.  ACKs are applied in arrival
//! order, and a timer expiry can never interleave with half-applied ACK
//! handling.
//!
//! # Rounds
//!
//! Each round admits packets up to the congestion window, then processes
//! ACK and timer events until the window is fully acknowledged or a loss
//! event (timeout or fast retransmit) occurs.  A round without loss grows
//! the window; a loss round leaves it where the loss transition put it.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TransferConfig;
use crate::congestion::{AckOutcome, CongestionController};
use crate::error::TransferError;
use crate::packet::{self, Frame, Packet, END_OF_SESSION};
use crate::rtt::RttEstimator;
use crate::timer::RetransmitTimer;

/// Messages from the ACK listener to the round loop.
#[derive(Debug)]
pub enum AckEvent {
    Ack(i32),
    /// The receiver finished the session.
    EndOfSession,
    /// The stream closed without an end-of-session marker.
    Closed,
    Failed(TransferError),
}

/// cwnd / ssthresh at the start of one sending round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrace {
    pub round: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    /// New packets admitted in this round.
    pub sent: u32,
}

/// Summary of a finished (or capped) transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub packets: u32,
    pub rounds: Vec<RoundTrace>,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub fast_retransmits: u64,
    pub final_cwnd: u32,
    pub final_ssthresh: u32,
    pub final_rto: Duration,
    /// `false` when the round cap stopped the sender early.
    pub completed: bool,
}

impl TransferReport {
    /// Write the per-round window trace as `"<round> : <cwnd>"` lines.
    pub fn write_trace<W: std::io::Write>(&self, mut out: W) -> std::io::Result<()> {
        for r in &self.rounds {
            writeln!(out, "{} : {}", r.round, r.cwnd)?;
        }
        out.flush()
    }
}

/// Transfer `packets` over `stream` and return once the receiver has
/// acknowledged all of them (or the round cap is hit).
///
/// Any handshake must already have happened on `stream`.  On return the
/// end-of-stream sentinel has been sent, the ACK listener is stopped and the
/// write half is shut down.
pub async fn run_transfer<S>(
    stream: S,
    packets: Vec<Packet>,
    config: &TransferConfig,
) -> Result<TransferReport, TransferError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    config.validate()?;
    let (reader, mut writer) = tokio::io::split(stream);
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let listener = spawn_ack_listener(reader, ack_tx);

    let controller = CongestionController::new(
        packets,
        config.mode,
        config.initial_ssthresh,
        RttEstimator::new(config.rto_bounds()),
    );
    let mut session = Session {
        controller,
        timer: RetransmitTimer::new(),
        config,
    };

    let result = match session.drive(&mut writer, &mut ack_rx).await {
        Ok(report) => session
            .finish(&mut writer, &mut ack_rx)
            .await
            .map(|()| report),
        Err(e) => Err(e),
    };

    session.timer.cancel();
    let _ = writer.shutdown().await;
    listener.abort();
    result
}

/// Spawn the task that reads ACKs off `reader` until the session ends.
pub fn spawn_ack_listener<R>(
    reader: R,
    events: mpsc::UnboundedSender<AckEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(ack_listener(reader, events))
}

async fn ack_listener<R>(mut reader: R, events: mpsc::UnboundedSender<AckEvent>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let event = match packet::read_ack(&mut reader).await {
            Ok(Some(END_OF_SESSION)) => AckEvent::EndOfSession,
            Ok(Some(ack)) => AckEvent::Ack(ack),
            Ok(None) => AckEvent::Closed,
            Err(e) => AckEvent::Failed(e.into()),
        };
        let last = !matches!(event, AckEvent::Ack(_));
        if events.send(event).is_err() || last {
            debug!("[sender:acks] listener exiting");
            return;
        }
    }
}

struct Session<'a> {
    controller: CongestionController,
    timer: RetransmitTimer,
    config: &'a TransferConfig,
}

impl Session<'_> {
    async fn drive<W>(
        &mut self,
        writer: &mut W,
        acks: &mut mpsc::UnboundedReceiver<AckEvent>,
    ) -> Result<TransferReport, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rounds = Vec::new();
        let mut round = 0u32;

        info!(
            "[sender] TCP {} transfer of {} packet(s) starting",
            self.controller.mode(),
            self.controller.total()
        );

        while !self.controller.is_complete() {
            if self.config.max_rounds.is_some_and(|max| round >= max) {
                warn!("[sender] round cap of {round} reached with packets outstanding");
                break;
            }
            round += 1;
            let (cwnd, ssthresh) = (self.controller.cwnd(), self.controller.ssthresh());

            let admitted = self.controller.admit(Instant::now());
            for &seq in &admitted {
                self.transmit(writer, seq).await?;
                if seq == self.controller.base() {
                    self.timer.arm(self.controller.rto());
                }
            }
            writer.flush().await?;

            info!(
                "[sender] round {round}: cwnd={cwnd} ssthresh={ssthresh} sent={:?}",
                admitted
            );
            rounds.push(RoundTrace {
                round,
                cwnd,
                ssthresh,
                sent: admitted.len() as u32,
            });

            let loss = self.await_round(writer, acks).await?;
            self.controller.end_round(loss);
            if !loss {
                debug!(
                    "[sender] {:?}: cwnd -> {}",
                    self.controller.phase(),
                    self.controller.cwnd()
                );
            }
        }

        let c = &self.controller;
        Ok(TransferReport {
            packets: c.total(),
            rounds,
            retransmissions: c.retransmissions(),
            timeouts: c.timeouts(),
            fast_retransmits: c.fast_retransmits(),
            final_cwnd: c.cwnd(),
            final_ssthresh: c.ssthresh(),
            final_rto: c.rto(),
            completed: c.is_complete(),
        })
    }

    /// Process events until the window drains (`Ok(false)`) or a loss event
    /// ends the round (`Ok(true)`).
    async fn await_round<W>(
        &mut self,
        writer: &mut W,
        acks: &mut mpsc::UnboundedReceiver<AckEvent>,
    ) -> Result<bool, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.controller.window_empty() {
                return Ok(false);
            }
            if !self.timer.is_armed() {
                self.timer.arm(self.controller.rto());
            }

            tokio::select! {
                biased;

                event = acks.recv() => {
                    let ack = match event {
                        Some(AckEvent::Ack(ack)) => ack,
                        Some(AckEvent::Failed(e)) => return Err(e),
                        Some(AckEvent::EndOfSession) | Some(AckEvent::Closed) | None => {
                            return Err(TransferError::ConnectionClosed);
                        }
                    };
                    if self.on_ack(writer, ack).await? {
                        return Ok(true);
                    }
                }

                _ = self.timer.expired(), if self.timer.is_armed() => {
                    let Some(seq) = self.controller.on_timeout() else {
                        continue;
                    };
                    let attempts = self.controller.consecutive_timeouts();
                    if self.config.max_retransmits.is_some_and(|max| attempts > max) {
                        return Err(TransferError::RetriesExhausted { seq, attempts });
                    }
                    info!(
                        "[sender] timeout on packet {seq}: cwnd -> 1, ssthresh -> {}, rto -> {:?}",
                        self.controller.ssthresh(),
                        self.controller.rto()
                    );
                    self.retransmit(writer, seq).await?;
                    return Ok(true);
                }
            }
        }
    }

    /// Apply one ACK.  Returns `true` when it triggered a fast retransmit.
    async fn on_ack<W>(&mut self, writer: &mut W, ack: i32) -> Result<bool, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        match self.controller.on_ack(ack, Instant::now()) {
            AckOutcome::Stale => {
                debug!("[sender] <- ACK {ack} (stale)");
                Ok(false)
            }
            AckOutcome::Duplicate { count } => {
                debug!("[sender] <- ACK {ack} (duplicate #{count})");
                Ok(false)
            }
            AckOutcome::New {
                acked,
                sample,
                window_empty,
            } => {
                debug!(
                    "[sender] <- ACK {ack}: slid {acked}, sample={sample:?}, rto={:?}",
                    self.controller.rto()
                );
                if window_empty {
                    self.timer.cancel();
                } else {
                    self.timer.arm(self.controller.rto());
                }
                Ok(false)
            }
            AckOutcome::FastRetransmit { seq } => {
                info!(
                    "[sender] 3 duplicate ACKs for {ack}: fast retransmit {seq}, cwnd -> {}, ssthresh -> {}",
                    self.controller.cwnd(),
                    self.controller.ssthresh()
                );
                self.retransmit(writer, seq).await?;
                Ok(true)
            }
        }
    }

    async fn transmit<W>(&self, writer: &mut W, seq: u32) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(packet) = self.controller.packet(seq) else {
            return Ok(());
        };
        packet::write_frame(writer, &Frame::Data(packet.clone())).await?;
        debug!("[sender] -> packet {seq} ({} bytes)", packet.payload.len());
        Ok(())
    }

    /// Resend `base` and restart the timer with the current (backed-off) RTO.
    async fn retransmit<W>(&mut self, writer: &mut W, seq: u32) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        self.transmit(writer, seq).await?;
        writer.flush().await?;
        self.timer.arm(self.controller.rto());
        Ok(())
    }

    /// Send the sentinel and wait (bounded) for the receiver to close out.
    async fn finish<W>(
        &mut self,
        writer: &mut W,
        acks: &mut mpsc::UnboundedReceiver<AckEvent>,
    ) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        self.timer.cancel();
        packet::write_frame(writer, &Frame::EndOfStream).await?;
        writer.flush().await?;
        debug!("[sender] -> end-of-stream");

        let drained = tokio::time::timeout(self.config.close_timeout, async {
            while let Some(event) = acks.recv().await {
                match event {
                    AckEvent::Ack(ack) => debug!("[sender] <- late ACK {ack}"),
                    AckEvent::EndOfSession => return true,
                    AckEvent::Closed | AckEvent::Failed(_) => return false,
                }
            }
            false
        })
        .await;

        match drained {
            Ok(true) => info!("[sender] receiver confirmed end of session"),
            Ok(false) => warn!("[sender] stream closed before end-of-session marker"),
            Err(_) => warn!(
                "[sender] no end-of-session marker within {:?}; closing",
                self.config.close_timeout
            ),
        }
        Ok(())
    }
}
