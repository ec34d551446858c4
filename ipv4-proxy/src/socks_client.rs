//! SOCKS5 session handler.
//!
//! Wire order: greeting → username/password subnegotiation → store
//! validation → per-IP admission (refusals answer `CONNECTION_REFUSED`
//! before the auth status byte is written) → auth-OK → request → upstream
//! dial → success reply with the outbound bind address → relay.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use proxy_socks::{DestAddr, Socks5Acceptor, Socks5FailureCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use typed_builder::TypedBuilder;

use crate::proxy::Proxy;
use crate::target_addr::TargetAddr;
use crate::{ProxyState, auth, utils};

/// Deadline on every framing step of the handshake.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(TypedBuilder)]
pub struct SocksClient<S> {
    state: ProxyState,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    stream: S,
}

impl<S> SocksClient<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub async fn serve(self) -> anyhow::Result<()> {
        let Self {
            state,
            client_addr,
            local_addr,
            stream,
        } = self;

        let server_ip = local_addr.ip();
        let server_ip_str = server_ip.to_string();

        let mut acceptor = timeout(NEGOTIATION_TIMEOUT, Socks5Acceptor::start(stream))
            .await
            .context("greeting timed out")?
            .context("bad SOCKS5 greeting")?;

        let (username, password) = timeout(NEGOTIATION_TIMEOUT, acceptor.read_credentials())
            .await
            .context("credential read timed out")?
            .context("bad credential subnegotiation")?;

        if let Err(error) = auth::validate(state.identity_store.as_ref(), &username, &password, &server_ip_str).await {
            warn!(%error, username, client = %client_addr, "SOCKS5 authentication failed");
            acceptor.deny_authentication().await?;
            return Ok(());
        }

        let Some(_admission) = state.sessions.admit(&server_ip_str) else {
            warn!(
                username,
                server_ip = %server_ip_str,
                client = %client_addr,
                "Per-IP connection cap reached, refusing"
            );
            acceptor.failed(Socks5FailureCode::ConnectionRefused).await?;
            return Ok(());
        };

        acceptor.grant_authentication().await?;

        let request = match timeout(NEGOTIATION_TIMEOUT, acceptor.read_request())
            .await
            .context("request read timed out")?
        {
            Ok(request) => request,
            Err(error) if error.kind() == io::ErrorKind::Unsupported => {
                acceptor.failed(Socks5FailureCode::AddressTypeNotSupported).await?;
                return Ok(());
            }
            Err(error) => return Err(anyhow::Error::new(error).context("bad SOCKS5 request")),
        };

        if !request.is_connect() {
            debug!(username, command = ?request.command, "Unsupported SOCKS5 command");
            acceptor.failed(Socks5FailureCode::CommandNotSupported).await?;
            return Ok(());
        }

        let target = TargetAddr::from(&request.dest);

        let upstream = match utils::dial_upstream(&target, server_ip).await {
            Ok(upstream) => upstream,
            Err(error) => {
                warn!(%error, username, target_host = %target, client = %client_addr, "Upstream dial failed");
                acceptor.failed(utils::socks_code_for_dial_error(&error)).await?;
                return Ok(());
            }
        };

        let bind_addr = upstream.local_addr().context("upstream local address")?;

        info!(
            username,
            server_ip = %server_ip_str,
            client = %client_addr,
            target_host = %target,
            "SOCKS5 relay established"
        );

        let stream = acceptor.connected(DestAddr::Ip(bind_addr)).await?;

        Proxy::builder()
            .state(state)
            .username(username)
            .client(stream)
            .upstream(upstream)
            .client_addr(client_addr)
            .local_addr(local_addr)
            .target(target)
            .sniff(true)
            .build()
            .run()
            .await
    }
}
