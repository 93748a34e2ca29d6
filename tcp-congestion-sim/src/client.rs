//! Sending client: connect, handshake, then hand the stream to the sender.

use std::net::SocketAddr;
use std::path::Path;

use log::info;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::packet;
use crate::sender::{self, TransferReport};

/// Upload the file at `path` to the server at `addr`.
pub async fn send_file(
    addr: SocketAddr,
    path: &Path,
    config: &TransferConfig,
) -> Result<TransferReport, TransferError> {
    config.validate()?;
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidConfig(format!("{} has no file name", path.display())))?;

    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    info!("[client] connected to {addr}; sending {name} ({} bytes)", data.len());
    transfer(stream, name, &data, config).await
}

/// Run the handshake on `stream` and transfer `data` as `file_name`.
pub async fn transfer<S>(
    mut stream: S,
    file_name: &str,
    data: &[u8],
    config: &TransferConfig,
) -> Result<TransferReport, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;
    let greeting = packet::read_utf(&mut stream).await?;
    info!("[client] server says: {greeting}");

    packet::write_utf(&mut stream, file_name).await?;
    stream.flush().await?;

    let packets = packet::packetize(data, config.chunk_size);
    info!(
        "[client] {} byte(s) in {} packet(s) of up to {} bytes, mode {}",
        data.len(),
        packets.len(),
        config.chunk_size,
        config.mode
    );
    sender::run_transfer(stream, packets, config).await
}
