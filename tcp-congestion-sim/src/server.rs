//! Receiving server: accept loop and per-connection session.
//!
//! ```text
//!  TcpListener ──accept──▶ handle_connection (one task per client)
//!                            1. greeting            ──▶
//!                            2. file name           ◀──
//!                            3. receive_stream      (packets in, ACKs out)
//! ```
//!
//! Connection ids start at 1 and label every log line (`[recv:C3]`) and the
//! stored upload (`received_C3_<name>`).  A failing session is logged and
//! closed; it never takes the server down.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::TransferError;
use crate::packet;
use crate::receiver::{self, ReceiveReport};
use crate::simulator::LossSimulator;

pub const GREETING: &str = "Hello from the congestion-control server";

/// Outcome of one completed upload.
#[derive(Debug)]
pub struct ReceivedFile {
    pub id: u64,
    pub path: PathBuf,
    pub report: ReceiveReport,
}

/// Bind `config.bind` and serve until the process exits.
pub async fn run(config: ServerConfig) -> Result<(), TransferError> {
    config.validate()?;
    let listener = TcpListener::bind(config.bind).await?;
    info!(
        "[server] listening on {} (loss p={}, uploads -> {})",
        listener.local_addr()?,
        config.loss_probability,
        config.upload_dir.display()
    );
    serve(listener, config).await
}

/// Accept connections on an already-bound listener.
pub async fn serve(listener: TcpListener, config: ServerConfig) -> Result<(), TransferError> {
    let config = Arc::new(config);
    let next_id = AtomicU64::new(1);

    loop {
        let (stream, peer) = listener.accept().await?;
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        info!("[server] C{id} connected from {peer}");
        if let Err(e) = stream.set_nodelay(true) {
            error!("[server] C{id}: set_nodelay failed: {e}");
        }

        let config = Arc::clone(&config);
        tokio::spawn(async move {
            match handle_connection(stream, id, &config).await {
                Ok(done) => info!(
                    "[server] C{id} stored {} bytes in {} ({} dropped, {} duplicates)",
                    done.report.bytes_written,
                    done.path.display(),
                    done.report.packets_dropped,
                    done.report.duplicates
                ),
                Err(e) => error!("[server] C{id} failed: {e}"),
            }
        });
    }
}

/// Run one receive session: handshake, then packets until the sentinel.
pub async fn handle_connection<S>(
    stream: S,
    id: u64,
    config: &ServerConfig,
) -> Result<ReceivedFile, TransferError>
where
    S: AsyncRead + AsyncWrite,
{
    let label = format!("recv:C{id}");
    let (mut reader, mut writer) = tokio::io::split(stream);

    packet::write_utf(&mut writer, GREETING).await?;
    writer.flush().await?;

    let requested = packet::read_utf(&mut reader).await?;
    let name = sanitize_file_name(&requested)
        .ok_or_else(|| TransferError::Malformed(format!("unusable file name {requested:?}")))?;
    info!("[{label}] receiving {name:?}");

    tokio::fs::create_dir_all(&config.upload_dir).await?;
    let path = config.upload_dir.join(format!("received_C{id}_{name}"));
    let mut output = BufWriter::new(File::create(&path).await?);

    let seed = config.seed.map(|s| s.wrapping_add(id));
    let mut loss = LossSimulator::random(config.loss_probability, seed);

    let result =
        receiver::receive_stream(&mut reader, &mut writer, &mut output, &mut loss, &label).await;
    let received = match result {
        Ok(report) => output.shutdown().await.map(|()| report).map_err(TransferError::from),
        Err(e) => Err(e),
    };

    match received {
        Ok(report) => Ok(ReceivedFile { id, path, report }),
        Err(e) => {
            drop(output);
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!("[{label}] could not remove partial upload {}: {rm}", path.display());
            }
            Err(e)
        }
    }
}

/// Keep only the final path component; `None` if nothing usable remains.
fn sanitize_file_name(requested: &str) -> Option<String> {
    let name = Path::new(requested.trim()).file_name()?.to_str()?;
    (!name.is_empty()).then(|| name.to_owned())
}
