//! Bidirectional relay with traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction during one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to upstream
    pub sent: u64,
    /// Upstream to client
    pub received: u64,
}

/// Pump bytes between `client` and `upstream` until either side ends.
///
/// The two directions run concurrently; the first one to finish (EOF or
/// error) ends the session and both write halves are shut down.
pub async fn relay<A, B>(client: A, upstream: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    tokio::select! {
        result = pump(&mut client_read, &mut upstream_write, &sent) => {
            if let Err(e) = result {
                debug!("client to upstream copy ended: {}", e);
            }
        }
        result = pump(&mut upstream_read, &mut client_write, &received) => {
            if let Err(e) = result {
                debug!("upstream to client copy ended: {}", e);
            }
        }
    }

    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    RelayStats {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (mut client, client_side) = tokio::io::duplex(1024);
        let (upstream_side, mut upstream) = tokio::io::duplex(1024);
        let session = tokio::spawn(relay(client_side, upstream_side));

        client.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        upstream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(upstream);
        let stats = session.await.unwrap();
        assert_eq!(stats, RelayStats { sent: 14, received: 2 });

        // Client leg was shut down when the upstream went away
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_ends_when_client_closes() {
        let (client, client_side) = tokio::io::duplex(64);
        let (upstream_side, mut upstream) = tokio::io::duplex(64);
        let session = tokio::spawn(relay(client_side, upstream_side));

        drop(client);
        let stats = session.await.unwrap();
        assert_eq!(stats, RelayStats::default());

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
