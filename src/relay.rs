//! Transparent byte relay between two streams
//!
//! Each direction owns one fixed buffer and never issues the next read until
//! the previous chunk is fully written, so a slow reader stalls its writer
//! instead of growing memory.

use serde::Serialize;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.client_to_origin + self.origin_to_client
    }
}

/// Byte counters shared between a [`Metered`] stream and its session
#[derive(Debug, Default)]
pub struct ByteCounters {
    read: AtomicU64,
    written: AtomicU64,
}

impl ByteCounters {
    /// Reads from the client are client-to-origin traffic
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            client_to_origin: self.read.load(Ordering::Relaxed),
            origin_to_client: self.written.load(Ordering::Relaxed),
        }
    }
}

/// Counts the bytes that cross a stream in each direction
#[derive(Debug)]
pub struct Metered<S> {
    inner: S,
    counters: Arc<ByteCounters>,
}

impl<S> Metered<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            counters: Arc::new(ByteCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<ByteCounters> {
        Arc::clone(&self.counters)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let n = (buf.filled().len() - before) as u64;
            self.counters.read.fetch_add(n, Ordering::Relaxed);
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            self.counters.written.fetch_add(n as u64, Ordering::Relaxed);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Forward bytes both ways until both directions reach EOF
///
/// EOF on one side shuts down the write half of the other. An error in either
/// direction ends the relay and drops both streams.
pub async fn relay<C, O>(client: C, origin: O, buffer_size: usize) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite,
    O: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);

    let upstream = pump(&mut client_read, &mut origin_write, buffer_size);
    let downstream = pump(&mut origin_read, &mut client_write, buffer_size);

    let (client_to_origin, origin_to_client) = tokio::try_join!(upstream, downstream)?;

    debug!(client_to_origin, origin_to_client, "Relay finished");

    Ok(RelayStats {
        client_to_origin,
        origin_to_client,
    })
}

/// Copy one direction, then half-close the destination
pub async fn pump<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_pump_half_closes_destination() {
        let (mut src_remote, mut src) = duplex(64);
        let (mut dst, mut dst_remote) = duplex(64);

        src_remote.write_all(b"payload").await.unwrap();
        drop(src_remote);

        let n = pump(&mut src, &mut dst, 4).await.unwrap();
        assert_eq!(n, 7);

        let mut out = Vec::new();
        dst_remote.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (mut client_remote, client) = duplex(256);
        let (origin, mut origin_remote) = duplex(256);

        let task = tokio::spawn(relay(client, origin, 16));

        client_remote.write_all(b"request bytes").await.unwrap();
        client_remote.shutdown().await.unwrap();
        origin_remote.write_all(b"response").await.unwrap();
        origin_remote.shutdown().await.unwrap();

        let mut at_origin = Vec::new();
        origin_remote.read_to_end(&mut at_origin).await.unwrap();
        let mut at_client = Vec::new();
        client_remote.read_to_end(&mut at_client).await.unwrap();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(at_origin, b"request bytes");
        assert_eq!(at_client, b"response");
        assert_eq!(stats.client_to_origin, 13);
        assert_eq!(stats.origin_to_client, 8);
        assert_eq!(stats.total(), 21);
    }

    #[tokio::test]
    async fn test_metered_counts_reads_and_writes() {
        let (mut remote, local) = duplex(64);
        let mut metered = Metered::new(local);
        let counters = metered.counters();

        remote.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        metered.read_exact(&mut buf).await.unwrap();
        metered.write_all(b"hi").await.unwrap();

        assert_eq!(
            counters.snapshot(),
            RelayStats {
                client_to_origin: 5,
                origin_to_client: 2,
            }
        );
    }
}
