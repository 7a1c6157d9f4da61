//! Full-duplex byte relay.
//!
//! Both directions are copied concurrently. When one direction reaches EOF
//! the write side of the opposite peer is shut down (half-close) and the
//! relay keeps running until the other direction finishes too. If either
//! direction fails, both are abandoned at once.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes moved by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Bytes copied from the front connection to the backend.
    pub bytes_to_backend: u64,
    /// Bytes copied from the backend to the front connection.
    pub bytes_from_backend: u64,
}

/// Relay bytes between `front` and `back` until both sides are done.
///
/// The byte counts are returned even when the relay ends with an error.
pub async fn relay<F, B>(front: F, back: B, buffer_size: usize) -> (PipeStats, io::Result<()>)
where
    F: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut front_read, mut front_write) = tokio::io::split(front);
    let (mut back_read, mut back_write) = tokio::io::split(back);

    let mut stats = PipeStats::default();
    let result = {
        let to_backend = copy_half(
            &mut front_read,
            &mut back_write,
            buffer_size,
            &mut stats.bytes_to_backend,
        );
        let from_backend = copy_half(
            &mut back_read,
            &mut front_write,
            buffer_size,
            &mut stats.bytes_from_backend,
        );
        tokio::try_join!(to_backend, from_backend).map(|_| ())
    };

    (stats, result)
}

/// Copy `reader` into `writer` until EOF, then shut down the writer.
///
/// A read ending in `UnexpectedEof` counts as EOF. TLS peers that drop the
/// socket without `close_notify` surface that way.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
    writer.shutdown().await
}
