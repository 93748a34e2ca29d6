//! Entry point for `tcp-congestion-sim`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work lives in the library; `main.rs` owns only process
//! setup (logging, argument parsing, trace output).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tcp_congestion_sim::config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_INITIAL_SSTHRESH, DEFAULT_LOSS_PROBABILITY, DEFAULT_PORT,
};
use tcp_congestion_sim::{client, server, CongestionMode, ServerConfig, TransferConfig};

/// TCP Tahoe / Reno file transfer over a simulated lossy channel.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Receive uploads, dropping packets at random.
    Server {
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        bind: SocketAddr,
        /// Directory received files are written into.
        #[arg(short, long, default_value = "server_uploads")]
        upload_dir: PathBuf,
        /// Probability of dropping each packet, in [0, 1].
        #[arg(short, long, default_value_t = DEFAULT_LOSS_PROBABILITY)]
        loss: f64,
        /// Seed for reproducible loss patterns.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Upload one file.
    Client {
        /// Server address (e.g. 127.0.0.1:3923).
        #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
        server: SocketAddr,
        /// File to send.
        file: PathBuf,
        /// `tahoe` (1) or `reno` (2).
        #[arg(short, long, default_value = "tahoe")]
        mode: CongestionMode,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = DEFAULT_INITIAL_SSTHRESH)]
        ssthresh: u32,
        #[arg(long, default_value_t = 200)]
        initial_rto_ms: u64,
        #[arg(long, default_value_t = 10)]
        min_rto_ms: u64,
        #[arg(long, default_value_t = 5000)]
        max_rto_ms: u64,
        /// Stop after this many sending rounds.
        #[arg(long)]
        max_rounds: Option<u32>,
        /// Give up after this many consecutive timeouts of one packet.
        #[arg(long)]
        max_retransmits: Option<u32>,
        /// Write the per-round "round : cwnd" trace here.
        #[arg(short, long)]
        trace: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            upload_dir,
            loss,
            seed,
        } => {
            let config = ServerConfig {
                bind,
                upload_dir,
                loss_probability: loss,
                seed,
            };
            server::run(config).await.context("server failed")?;
        }
        Mode::Client {
            server,
            file,
            mode,
            chunk_size,
            ssthresh,
            initial_rto_ms,
            min_rto_ms,
            max_rto_ms,
            max_rounds,
            max_retransmits,
            trace,
        } => {
            let config = TransferConfig {
                chunk_size,
                initial_ssthresh: ssthresh,
                mode,
                initial_rto: Duration::from_millis(initial_rto_ms),
                min_rto: Duration::from_millis(min_rto_ms),
                max_rto: Duration::from_millis(max_rto_ms),
                max_rounds,
                max_retransmits,
                ..Default::default()
            };
            let report = client::send_file(server, &file, &config)
                .await
                .with_context(|| format!("sending {} to {server}", file.display()))?;

            log::info!(
                "done: {} packet(s), {} round(s), {} retransmission(s) ({} timeout, {} fast), final cwnd={} ssthresh={}{}",
                report.packets,
                report.rounds.len(),
                report.retransmissions,
                report.timeouts,
                report.fast_retransmits,
                report.final_cwnd,
                report.final_ssthresh,
                if report.completed { "" } else { " [round cap hit]" }
            );

            if let Some(path) = trace {
                let out = std::fs::File::create(&path)
                    .with_context(|| format!("creating trace file {}", path.display()))?;
                report
                    .write_trace(std::io::BufWriter::new(out))
                    .with_context(|| format!("writing trace file {}", path.display()))?;
            }
        }
    }
    Ok(())
}
