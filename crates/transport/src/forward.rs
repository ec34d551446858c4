use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::limit::FlowLimiter;

pub const COPY_BUFFER_SIZE: usize = 2 * 1024;

/// Deadline applied to every read and write of a relayed flow.
pub const RELAY_IO_TIMEOUT: Duration = Duration::from_secs(180);

/// How long a starved pump waits before retrying the limiter.
const STARVED_PAUSE: Duration = Duration::from_millis(33);

/// Pumps bytes from `reader` to `writer` until EOF, an I/O failure, a missed
/// deadline or cancellation, metering each chunk through the shared limiter.
///
/// A starved pump sleeps [`STARVED_PAUSE`] and then forces a single byte
/// through so two flows sharing an exhausted limiter cannot deadlock.
pub async fn copy_rate_limited<R, W>(
    mut reader: R,
    mut writer: W,
    limiter: Arc<FlowLimiter>,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut transferred = 0u64;

    loop {
        let read = tokio::select! {
            read = tokio::time::timeout(RELAY_IO_TIMEOUT, reader.read(&mut buf)) => read,
            () = cancel.cancelled() => return Ok(transferred),
        };
        let n = match read {
            Ok(result) => result?,
            Err(_elapsed) => return Err(io::Error::new(io::ErrorKind::TimedOut, "relay read timed out")),
        };
        if n == 0 {
            return Ok(transferred);
        }

        let mut pos = 0;
        while pos < n {
            let mut granted = limiter.read_size(n - pos);
            if granted == 0 {
                tokio::select! {
                    () = tokio::time::sleep(STARVED_PAUSE) => {}
                    () = cancel.cancelled() => return Ok(transferred),
                }
                granted = 1;
            }

            let end = pos + granted;
            match tokio::time::timeout(RELAY_IO_TIMEOUT, writer.write_all(&buf[pos..end])).await {
                Ok(result) => result?,
                Err(_elapsed) => return Err(io::Error::new(io::ErrorKind::TimedOut, "relay write timed out")),
            }

            transferred += granted as u64;
            pos = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_to_eof_and_reports_the_byte_count() {
        let (client, mut far_client) = tokio::io::duplex(256);
        let (server, mut far_server) = tokio::io::duplex(256);

        let limiter = Arc::new(FlowLimiter::new(0, 0));
        let pump = tokio::spawn(async move {
            let (reader, _) = tokio::io::split(client);
            let (_, writer) = tokio::io::split(server);
            copy_rate_limited(reader, writer, limiter, CancellationToken::new()).await
        });

        far_client.write_all(b"forwarded through the pump").await.unwrap();
        drop(far_client);

        let mut received = Vec::new();
        far_server.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"forwarded through the pump");
        assert_eq!(pump.await.unwrap().unwrap(), received.len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn starved_pump_still_makes_progress() {
        let (client, mut far_client) = tokio::io::duplex(256);
        let (server, mut far_server) = tokio::io::duplex(256);

        // A one-byte-per-second budget: everything past the first byte goes
        // through the forced single-byte path.
        let limiter = Arc::new(FlowLimiter::new(1, 1));
        let pump = tokio::spawn(async move {
            let (reader, _) = tokio::io::split(client);
            let (_, writer) = tokio::io::split(server);
            copy_rate_limited(reader, writer, limiter, CancellationToken::new()).await
        });

        far_client.write_all(b"trickle").await.unwrap();
        drop(far_client);

        let mut received = Vec::new();
        far_server.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"trickle");
        assert_eq!(pump.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump() {
        let (client, mut far_client) = tokio::io::duplex(256);
        let (server, _far_server) = tokio::io::duplex(256);

        let cancel = CancellationToken::new();
        let limiter = Arc::new(FlowLimiter::new(0, 0));
        let pump = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let (reader, _) = tokio::io::split(client);
                let (_, writer) = tokio::io::split(server);
                copy_rate_limited(reader, writer, limiter, cancel).await
            }
        });

        far_client.write_all(b"some bytes").await.unwrap();
        tokio::task::yield_now().await;
        cancel.cancel();

        assert!(pump.await.unwrap().is_ok());
    }
}
