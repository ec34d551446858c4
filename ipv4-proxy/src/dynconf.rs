//! Dynamically tunable knobs: rate-limiter parameters and the per-IP
//! connection cap.
//!
//! The snapshot lives behind an `ArcSwap`; admission and registry code read
//! it lock-free. A watcher task re-reads the tuning document every minute
//! and walks the live limiters when something changed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipv4_proxy_task::{ShutdownSignal, Task};
use serde::{Deserialize, Serialize};

use crate::config::ConfHandle;
use crate::session::SessionRegistry;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LimitedReaderTuning {
    #[serde(default)]
    pub read_rate: i64,
    #[serde(default)]
    pub read_burst: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tuning {
    #[serde(default)]
    pub limited_reader: LimitedReaderTuning,
    #[serde(default)]
    pub one_ip_max_conn: i64,
}

#[derive(Clone)]
pub struct TuningHandle {
    inner: Arc<arc_swap::ArcSwap<Tuning>>,
}

impl TuningHandle {
    pub fn new(initial: Tuning) -> Self {
        Self {
            inner: Arc::new(arc_swap::ArcSwap::from_pointee(initial)),
        }
    }

    pub fn load(&self) -> Arc<Tuning> {
        self.inner.load_full()
    }

    pub fn store(&self, tuning: Tuning) {
        self.inner.store(Arc::new(tuning));
    }
}

/// Periodic configuration refresh: re-reads the static configuration file,
/// then the tuning document, and reparameterises every live rate limiter on
/// change.
pub struct TuningWatcherTask {
    pub conf_handle: ConfHandle,
    pub tuning: TuningHandle,
    pub sessions: Arc<SessionRegistry>,
}

#[async_trait]
impl Task for TuningWatcherTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "tuning watcher";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                _ = shutdown_signal.wait() => return Ok(()),
            }

            if let Err(error) = self.refresh() {
                warn!(error = format!("{error:#}"), "Configuration refresh failed");
            }
        }
    }
}

impl TuningWatcherTask {
    fn refresh(&self) -> anyhow::Result<()> {
        if self.conf_handle.reload()? {
            info!("Static configuration reloaded");
        }

        let next = read_tuning(&self.conf_handle)?;
        let current = self.tuning.load();

        if *current != next {
            info!(
                read_rate = next.limited_reader.read_rate,
                read_burst = next.limited_reader.read_burst,
                one_ip_max_conn = next.one_ip_max_conn,
                "Tuning changed"
            );
            self.tuning.store(next);
            self.sessions
                .apply_limits(next.limited_reader.read_rate, next.limited_reader.read_burst);
        }

        Ok(())
    }
}

/// Resolves the current tuning: the dedicated tuning document when
/// configured, otherwise the static configuration's inline values.
pub fn read_tuning(conf_handle: &ConfHandle) -> anyhow::Result<Tuning> {
    use anyhow::Context as _;

    let conf = conf_handle.get_conf();

    match &conf.tuning_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path).with_context(|| format!("couldn't read {path}"))?;
            serde_json::from_str(&contents).with_context(|| format!("invalid tuning document {path}"))
        }
        None => Ok(conf.static_tuning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_document_field_names() {
        let tuning: Tuning = serde_json::from_str(
            r#"{"LimitedReader": {"ReadRate": 30720, "ReadBurst": 102400000}, "OneIpMaxConn": 50}"#,
        )
        .unwrap();

        assert_eq!(tuning.limited_reader.read_rate, 30720);
        assert_eq!(tuning.limited_reader.read_burst, 102_400_000);
        assert_eq!(tuning.one_ip_max_conn, 50);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let tuning: Tuning = serde_json::from_str("{}").unwrap();
        assert_eq!(tuning, Tuning::default());
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = TuningHandle::new(Tuning::default());
        assert_eq!(handle.load().one_ip_max_conn, 0);

        handle.store(Tuning {
            one_ip_max_conn: 3,
            ..Tuning::default()
        });
        assert_eq!(handle.load().one_ip_max_conn, 3);
    }
}
