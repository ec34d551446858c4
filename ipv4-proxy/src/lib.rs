#[macro_use]
extern crate tracing;

pub mod access_log;
pub mod amqp;
pub mod auth;
pub mod blacklist;
pub mod bus;
pub mod config;
pub mod dynconf;
pub mod http_client;
pub mod listener;
pub mod log;
pub mod proxy;
pub mod session;
pub mod socks_client;
pub mod target_addr;
pub mod utils;

use std::sync::Arc;

use ipv4_proxy_task::ShutdownSignal;

/// Shared handles threaded through every accepted connection.
#[derive(Clone)]
pub struct ProxyState {
    pub conf_handle: config::ConfHandle,
    pub tuning: dynconf::TuningHandle,
    pub sessions: Arc<session::SessionRegistry>,
    pub identity_store: Arc<dyn auth::IdentityStore>,
    pub blacklist: Arc<blacklist::Blacklist>,
    pub access_logs: access_log::AccessLogSender,
    pub shutdown_signal: ShutdownSignal,
}
