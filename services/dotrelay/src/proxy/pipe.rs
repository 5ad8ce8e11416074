//! Bidirectional byte relay between a client and its upstream.
//!
//! Two independent copy loops run concurrently, one per direction. When one
//! direction reaches EOF, the write side of the opposite stream is shut down
//! so that peer sees the end of input, and the other direction keeps running
//! until it ends too. The first I/O error stops both loops; the streams are
//! dropped (and closed) when this function returns.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::connection::Connection;
use crate::error::{ProxyError, Result};

/// Size of the per-direction copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    /// Client to upstream.
    pub bytes_in: u64,
    /// Upstream to client.
    pub bytes_out: u64,
}

/// Relay bytes between `client` and `upstream` until both directions end.
///
/// Counters on `conn` are updated as bytes move, which also feeds the idle
/// timeout.
pub async fn relay<C, U>(client: C, upstream: U, conn: &Connection) -> Result<RelaySummary>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = copy_half(&mut client_read, &mut upstream_write, |n| {
        conn.record_inbound(n)
    });
    let upstream_to_client = copy_half(&mut upstream_read, &mut client_write, |n| {
        conn.record_outbound(n)
    });

    let (bytes_in, bytes_out) = tokio::try_join!(client_to_upstream, upstream_to_client)
        .map_err(ProxyError::RelayIo)?;

    Ok(RelaySummary {
        bytes_in,
        bytes_out,
    })
}

/// Copy one direction, then half-close the writer.
async fn copy_half<R, W, F>(reader: &mut R, writer: &mut W, record: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(usize),
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            // TLS peers that close without close_notify.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        record(n);
    }

    trace!(bytes = total, "Direction finished, half-closing");
    match writer.shutdown().await {
        Ok(()) => Ok(total),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(total),
        Err(e) => Err(e),
    }
}
