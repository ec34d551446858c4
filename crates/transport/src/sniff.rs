use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type SniffCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

pin_project_lite::pin_project! {
    /// One-shot first-payload capture around the client side of a relayed
    /// flow.
    ///
    /// Bytes read from the wrapped stream are accumulated until the first
    /// write back to it; at that point the callback receives everything
    /// captured so far, synchronously, and the wrapper degrades to a plain
    /// pass-through. The first write-back only happens once the upstream
    /// answered, so the capture spans the client's complete opening payload
    /// even when it arrived in several reads.
    pub struct SniffStream<S> {
        #[pin]
        inner: S,
        capture: Option<Vec<u8>>,
        callback: Option<SniffCallback>,
    }
}

impl<S> SniffStream<S> {
    pub fn new(inner: S, callback: impl FnOnce(Vec<u8>) + Send + 'static) -> Self {
        Self {
            inner,
            capture: Some(Vec::new()),
            callback: Some(Box::new(callback)),
        }
    }
}

impl<S> AsyncRead for SniffStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();

        let before = buf.filled().len();
        let poll = this.inner.poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &poll {
            if let Some(capture) = this.capture.as_mut() {
                capture.extend_from_slice(&buf.filled()[before..]);
            }
        }

        poll
    }
}

impl<S> AsyncWrite for SniffStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();

        if let Some(callback) = this.callback.take() {
            let captured = this.capture.take().unwrap_or_default();
            callback(captured);
        }

        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn captures_reads_until_the_first_write() {
        let (tx, rx) = mpsc::channel();
        let inner = tokio_test::io::Builder::new()
            .read(b"client ")
            .read(b"hello")
            .write(b"server reply")
            .read(b"more client data")
            .build();

        let mut stream = SniffStream::new(inner, move |payload| tx.send(payload).expect("send capture"));

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"client ");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        // Nothing delivered until the first write-back.
        assert!(rx.try_recv().is_err());

        stream.write_all(b"server reply").await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"client hello");

        // Later reads are no longer captured.
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"more client data");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn callback_fires_once_with_an_empty_capture_when_nothing_was_read() {
        let (tx, rx) = mpsc::channel();
        let inner = tokio_test::io::Builder::new().write(b"x").write(b"y").build();

        let mut stream = SniffStream::new(inner, move |payload| tx.send(payload).expect("send capture"));

        stream.write_all(b"x").await.unwrap();
        stream.write_all(b"y").await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), Vec::<u8>::new());
        assert!(rx.try_recv().is_err());
    }
}
