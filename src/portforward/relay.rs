//! Byte relay between an accepted local connection and a pod stream.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::sessions::session::SessionStats;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Counts one live relay pair in `active_connections` for as long as it is
/// held.
pub struct ActiveGuard(Arc<SessionStats>);

impl ActiveGuard {
    pub fn new(stats: Arc<SessionStats>) -> Self {
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Relay bytes both ways until both directions reach EOF.
///
/// EOF on one side is forwarded as a write shutdown to the other, and the
/// opposite direction keeps flowing. An I/O error in either direction ends
/// both. `bytes_in` counts local -> pod, `bytes_out` pod -> local.
pub async fn relay_connection<L, U>(local: L, upstream: U, stats: &SessionStats) -> io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut up_rd, mut up_wr) = tokio::io::split(upstream);

    tokio::try_join!(
        copy_half(&mut local_rd, &mut up_wr, &stats.bytes_in),
        copy_half(&mut up_rd, &mut local_wr, &stats.bytes_out),
    )?;
    Ok(())
}

/// Copy one direction, then half-close the writer.
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let total = copy_counted(reader, writer, counter).await?;
    // The peer may have closed fully already.
    let _ = writer.shutdown().await;
    Ok(total)
}

/// `tokio::io::copy` that bumps `counter` as bytes are written.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
}
