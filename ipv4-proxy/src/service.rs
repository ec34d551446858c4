use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ipv4_proxy_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use ipv4_proxy::ProxyState;
use ipv4_proxy::access_log::{AccessLogTask, access_log_channel};
use ipv4_proxy::amqp::{AmqpPublisher, ControlPlaneTask};
use ipv4_proxy::auth::RedisStore;
use ipv4_proxy::blacklist::Blacklist;
use ipv4_proxy::config::ConfHandle;
use ipv4_proxy::dynconf::{TuningHandle, TuningWatcherTask, read_tuning};
use ipv4_proxy::listener::ProxyListener;
use ipv4_proxy::log::{self, LoggerGuard};
use ipv4_proxy::session::SessionRegistry;
use tap::prelude::*;
use tokio::runtime::{self, Runtime};

pub const SERVICE_NAME: &str = "ipv4-proxy";

/// Grace granted to in-flight flows at shutdown.
const STOP_GRACE: Duration = Duration::from_secs(5);

enum ProxyServiceState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        sessions: Arc<SessionRegistry>,
        runtime: Runtime,
    },
}

pub struct ProxyService {
    conf_handle: ConfHandle,
    state: ProxyServiceState,
    _logger_guard: LoggerGuard,
}

impl ProxyService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard = log::init(&conf.log_file, conf.log_directive.as_deref()).context("failed to setup logger")?;

        info!(service = SERVICE_NAME, version = env!("CARGO_PKG_VERSION"));

        Ok(ProxyService {
            conf_handle,
            state: ProxyServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // spawn_tasks needs to run inside the runtime in order to bind the
        // sockets and reach the credential store.
        let tasks = runtime.block_on(spawn_tasks(self.conf_handle.clone()))?;

        trace!("Tasks created");

        let sessions = Arc::clone(&tasks.sessions);

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ProxyServiceState::Running {
            shutdown_handle: tasks.shutdown_handle,
            sessions,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ProxyServiceState::Stopped) {
            ProxyServiceState::Stopped => {
                info!("Attempted to stop the proxy service, but it's already stopped");
            }
            ProxyServiceState::Running {
                shutdown_handle,
                sessions,
                runtime,
            } => {
                info!("Stopping the proxy service");

                // Stop accepting, cancel every relayed flow, then wait.
                shutdown_handle.signal();
                sessions.cancel_all();

                runtime.block_on(async {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(STOP_GRACE) => {
                            warn!("Some flows were still alive after the stop grace");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = ProxyServiceState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
    sessions: Arc<SessionRegistry>,
}

impl Tasks {
    fn new(sessions: Arc<SessionRegistry>, shutdown_handle: ShutdownHandle, shutdown_signal: ShutdownSignal) -> Self {
        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
            sessions,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: ipv4_proxy_task::Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = ipv4_proxy_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let conf = conf_handle.get_conf();

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let tuning = read_tuning(&conf_handle)
        .tap_err(|error| warn!(error = format!("{error:#}"), "Tuning unavailable, starting with the inline defaults"))
        .unwrap_or(conf.static_tuning)
        .pipe(TuningHandle::new);

    let sessions = Arc::new(SessionRegistry::new(tuning.clone()));

    let identity_store = RedisStore::connect(&conf.redis_url)
        .await
        .context("couldn't reach the credential store")?
        .pipe(Arc::new);

    let (access_logs, access_log_receivers) = access_log_channel();
    let publisher = Arc::new(AmqpPublisher::new());

    let mut tasks = Tasks::new(Arc::clone(&sessions), shutdown_handle, shutdown_signal);

    let state = ProxyState {
        conf_handle: conf_handle.clone(),
        tuning: tuning.clone(),
        sessions: Arc::clone(&sessions),
        identity_store,
        blacklist: Arc::new(Blacklist::new()),
        access_logs,
        shutdown_signal: tasks.shutdown_signal.clone(),
    };

    conf.listeners
        .iter()
        .map(|addr| {
            ProxyListener::init_and_bind(*addr, state.clone()).with_context(|| format!("failed to initialize {addr}"))
        })
        .collect::<anyhow::Result<Vec<ProxyListener>>>()
        .context("failed to bind listener")?
        .into_iter()
        .for_each(|listener| tasks.register(listener));

    tasks.register(ControlPlaneTask {
        state: state.clone(),
        publisher: Arc::clone(&publisher),
    });

    tasks.register(AccessLogTask {
        receivers: access_log_receivers,
        publisher,
        conf: Arc::clone(&conf),
    });

    tasks.register(TuningWatcherTask {
        conf_handle,
        tuning,
        sessions,
    });

    Ok(tasks)
}
