//! Relay loop shared by the SOCKS5 and HTTP session handlers.
//!
//! After the protocol handshake both handlers converge here: the flow joins
//! the per-`user:server_ip` connection context, the client side optionally
//! grows a first-payload sniffer, and two rate-limited pumps move bytes
//! until one of them stops, the context is cancelled, the service shuts
//! down, or the blacklist watchdog trips.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use ipv4_proxy_task::ChildTask;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use transport::SniffStream;
use typed_builder::TypedBuilder;

use crate::ProxyState;
use crate::session::context_key;
use crate::target_addr::TargetAddr;

const BLACKLIST_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(TypedBuilder)]
pub struct Proxy<C, U> {
    state: ProxyState,
    username: String,
    client: C,
    upstream: U,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    target: TargetAddr,
    #[builder(default)]
    initial_domain: Option<String>,
    #[builder(default = false)]
    sniff: bool,
}

impl<C, U> Proxy<C, U>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            state,
            username,
            client,
            upstream,
            client_addr,
            local_addr,
            target,
            initial_domain,
            sniff,
        } = self;

        let server_ip = local_addr.ip().to_string();
        let key = context_key(&username, &server_ip);

        let ctx = state.sessions.acquire(&key);

        let domain: Arc<ArcSwapOption<String>> = Arc::new(ArcSwapOption::new(initial_domain.map(Arc::new)));

        let (client_read, client_write): (BoxedReader, BoxedWriter) = if sniff {
            let pointer = Arc::clone(&domain);
            let sniffer = SniffStream::new(client, move |payload| {
                if let Some(host) = sniff_proto::detect_host(&payload) {
                    pointer.store(Some(Arc::new(host)));
                }
            });
            let (read, write) = tokio::io::split(sniffer);
            (Box::new(read), Box::new(write))
        } else {
            let (read, write) = tokio::io::split(client);
            (Box::new(read), Box::new(write))
        };
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let (pump_tx, mut pump_rx) = mpsc::channel::<io::Result<u64>>(2);

        let upload = ChildTask::spawn({
            let limiter = Arc::clone(&ctx.limiter);
            let cancel = ctx.cancel.clone();
            let pump_tx = pump_tx.clone();
            async move {
                let result = transport::copy_rate_limited(client_read, upstream_write, limiter, cancel).await;
                let _ = pump_tx.send(result).await;
            }
        });
        let download = ChildTask::spawn({
            let limiter = Arc::clone(&ctx.limiter);
            let cancel = ctx.cancel.clone();
            async move {
                let result = transport::copy_rate_limited(upstream_read, client_write, limiter, cancel).await;
                let _ = pump_tx.send(result).await;
            }
        });

        let mut shutdown_signal = state.shutdown_signal.clone();
        let mut hit_site = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(BLACKLIST_RECHECK_INTERVAL) => {
                    let Some(current) = domain.load_full() else { continue };
                    if let Some(site) = state.blacklist.lookup(&current) {
                        error!(
                            domain = %current,
                            site,
                            username,
                            client = %client_addr,
                            target_host = %target,
                            "Blacklisted domain detected, closing the flow"
                        );
                        hit_site = Some(site);
                        break;
                    }
                }
                finished = pump_rx.recv() => {
                    if let Some(Err(error)) = finished {
                        warn!(
                            %error,
                            username,
                            client = %client_addr,
                            target_host = %target,
                            "Relay closed on error"
                        );
                    }
                    break;
                }
                () = ctx.cancel.cancelled() => break,
                _ = shutdown_signal.wait() => break,
            }
        }

        // Dropping the pumps aborts them and closes both halves of each
        // stream.
        drop(upload);
        drop(download);

        if let Some(site) = &hit_site {
            state.access_logs.record_blacklist_hit(site, &username, &server_ip);
        }

        let final_domain = domain
            .load_full()
            .map(|domain| domain.as_ref().clone())
            .filter(|domain| !domain.is_empty())
            .unwrap_or_else(|| target.host().to_owned());
        state.access_logs.record_access(&username, &final_domain, &local_addr.to_string());

        state.sessions.release(&key, &ctx);

        Ok(())
    }
}
