#[macro_use]
extern crate tracing;

mod service;

use anyhow::Context as _;
use ipv4_proxy::config::ConfHandle;
use tap::prelude::*;

use crate::service::ProxyService;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);

    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-path" => {
                config_path = Some(args.next().context("missing value for --config-path")?);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            unexpected => anyhow::bail!("unexpected argument: {unexpected} (see --help)"),
        }
    }

    let conf_handle = ConfHandle::init(config_path.as_deref()).context("unable to initialize configuration")?;

    let mut service = ProxyService::load(conf_handle).context("service loading failed")?;

    service
        .start()
        .tap_err(|error| error!(error = format!("{error:#}"), "Failed to start"))?;

    // Waiting for some stop signal (CTRL-C…)
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the async runtime")?;
    rt.block_on(build_signals_fut())?;

    service.stop();

    Ok(())
}

fn print_help() {
    println!(
        r#"{name} {version}

USAGE:
    {name} [--config-path <CONFIG_PATH>]

The configuration path may also be given through the
IPV4_PROXY_CONFIG_PATH environment variable.
"#,
        name = service::SERVICE_NAME,
        version = env!("CARGO_PKG_VERSION"),
    );
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
