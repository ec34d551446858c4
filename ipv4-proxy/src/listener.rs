//! Accept loops and protocol demultiplexing.
//!
//! Every listening socket serves both protocols: the first read decides.
//! A first segment of at most 8 bytes can only be a SOCKS5 greeting (the
//! greeting itself is at most 3 bytes), so those bytes are replayed to the
//! SOCKS5 state machine; anything longer is treated as an HTTP request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use ipv4_proxy_task::{ChildTask, ShutdownSignal, Task};
use tokio::io::AsyncReadExt as _;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;
use transport::Rewind;

use crate::ProxyState;
use crate::http_client::HttpClient;
use crate::socks_client::SocksClient;

/// Parallel accept loops sharing one listening socket.
pub const ACCEPT_WORKERS: usize = 8;

const DEMUX_BUFFER_SIZE: usize = 2 * 1024;
const SOCKS_DEMUX_THRESHOLD: usize = 8;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_HEADER_BLOCK: usize = 8 * 1024;

pub struct ProxyListener {
    addr: SocketAddr,
    listener: TcpListener,
    state: ProxyState,
}

impl ProxyListener {
    pub fn init_and_bind(addr: SocketAddr, state: ProxyState) -> anyhow::Result<Self> {
        info!(%addr, "Initiating listener…");

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(addr).context("failed to bind TCP socket")?;

        let listener = socket.listen(64).context("failed to listen with the bound TCP socket")?;
        let addr = listener.local_addr().context("bound address")?;

        info!(%addr, "Listener started successfully");

        Ok(Self { addr, listener, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = Arc::new(self.listener);

        let workers: Vec<_> = (0..ACCEPT_WORKERS)
            .map(|_| {
                let listener = Arc::clone(&listener);
                let state = self.state.clone();
                ChildTask::spawn(accept_loop(listener, state))
            })
            .collect();

        // Accept loops only return on listener failure.
        futures::future::join_all(workers.into_iter().map(ChildTask::join)).await;

        Ok(())
    }
}

#[async_trait]
impl Task for ProxyListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "proxy listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn accept_loop(listener: Arc<TcpListener>, state: ProxyState) {
    loop {
        match listener.accept().await.context("failed to accept connection") {
            Ok((stream, peer_addr)) => {
                let state = state.clone();

                let fut = async move {
                    if let Err(e) = handle_peer(stream, state, peer_addr).await {
                        error!(error = format!("{e:#}"), "Peer failure");
                    }
                }
                .instrument(info_span!("peer", client = %peer_addr));

                ChildTask::spawn(fut).detach();
            }
            Err(e) => error!(error = format!("{e:#}"), "Listener failure"),
        }
    }
}

async fn handle_peer(mut stream: TcpStream, state: ProxyState, peer_addr: SocketAddr) -> anyhow::Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        error!("set_nodelay on TcpStream failed: {}", e);
    }

    let local_addr = stream.local_addr().context("couldn't read the accepted local address")?;

    let mut buf = vec![0u8; DEMUX_BUFFER_SIZE];
    let n = stream.read(&mut buf).await.context("first read failed")?;
    if n == 0 {
        return Ok(());
    }
    buf.truncate(n);

    if n <= SOCKS_DEMUX_THRESHOLD {
        SocksClient::builder()
            .state(state)
            .client_addr(peer_addr)
            .local_addr(local_addr)
            .stream(Rewind::new(Bytes::from(buf), stream))
            .build()
            .serve()
            .await
    } else {
        complete_http_head(&mut stream, &mut buf).await?;

        HttpClient::builder()
            .state(state)
            .client_addr(peer_addr)
            .local_addr(local_addr)
            .stream(stream)
            .head(buf)
            .build()
            .serve()
            .await
    }
}

/// Keeps reading until the HTTP header block terminator arrives. Bails on
/// oversized blocks, EOF, or a stalled client.
async fn complete_http_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> anyhow::Result<()> {
    loop {
        if contains_header_terminator(buf) {
            return Ok(());
        }

        anyhow::ensure!(buf.len() < MAX_HEADER_BLOCK, "HTTP header block too large");

        let mut chunk = [0u8; DEMUX_BUFFER_SIZE];
        let n = tokio::time::timeout(HEADER_READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .context("timed out reading the HTTP header block")?
            .context("failed reading the HTTP header block")?;
        anyhow::ensure!(n > 0, "connection closed inside the HTTP header block");

        buf.extend_from_slice(&chunk[..n]);
    }
}

fn contains_header_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_terminator_detection() {
        assert!(contains_header_terminator(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(contains_header_terminator(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody"));
        assert!(!contains_header_terminator(b"GET / HTTP/1.1\r\nHost: x\r\n"));
    }
}
