//! Raw TCP helpers

use super::TransportError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

/// Connect to `addr`, giving up after `timeout`
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    // Control frames are small; don't let Nagle hold them back
    stream.set_nodelay(true).ok();

    Ok(stream)
}

/// Read one chunk into `buf`. `Ok(0)` means the peer closed the stream.
pub async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, TransportError> {
    Ok(reader.read(buf).await?)
}
