use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use parking_lot::RwLock;
use tap::Pipe as _;

use crate::dynconf::{LimitedReaderTuning, Tuning};

const CONFIG_PATH_ENV: &str = "IPV4_PROXY_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "ipv4-proxy.json";

pub mod dto {
    use super::*;
    use serde::{Deserialize, Serialize};

    /// On-disk configuration document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Addresses the proxy accepts SOCKS5/HTTP clients on.
        pub tcp_listeners: Vec<String>,

        /// This instance's address as known to the control plane; used to
        /// derive the per-instance queue names.
        pub local_ip: String,
        pub process_name: String,

        pub redis: RedisConf,
        pub rabbitmq: RabbitmqConf,

        /// Inline tuning defaults; the dynamic tuning document overrides
        /// them when configured.
        #[serde(default)]
        pub limited_reader: LimitedReaderTuning,
        #[serde(default)]
        pub one_ip_max_conn: i64,

        pub log_file: Utf8PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub log_directive: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tuning_file: Option<Utf8PathBuf>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct RedisConf {
        pub url: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct RabbitmqConf {
        pub host: String,
        pub port: u16,
        pub user: String,
        pub password: String,
        pub virtual_host: String,
        pub blacklist_exchange: String,
        pub blacklist_accesslog_queue: String,
        pub accesslog_to_influx_db_queue: String,
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub listeners: Vec<SocketAddr>,
    pub local_ip: String,
    pub process_name: String,
    pub redis_url: String,
    pub amqp_uri: String,
    pub blacklist_exchange: String,
    pub blacklist_accesslog_queue: String,
    pub accesslog_queue: String,
    pub log_file: Utf8PathBuf,
    pub log_directive: Option<String>,
    pub tuning_file: Option<Utf8PathBuf>,
    pub static_tuning: Tuning,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        anyhow::ensure!(!conf_file.tcp_listeners.is_empty(), "at least one TCP listener is required");

        let listeners = conf_file
            .tcp_listeners
            .iter()
            .map(|addr| addr.parse().with_context(|| format!("bad listener address {addr}")))
            .collect::<anyhow::Result<Vec<SocketAddr>>>()?;

        let rabbitmq = &conf_file.rabbitmq;
        let amqp_uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            rabbitmq.user,
            rabbitmq.password,
            rabbitmq.host,
            rabbitmq.port,
            rabbitmq.virtual_host.trim_start_matches('/'),
        );

        Ok(Conf {
            listeners,
            local_ip: conf_file.local_ip.clone(),
            process_name: conf_file.process_name.clone(),
            redis_url: conf_file.redis.url.clone(),
            amqp_uri,
            blacklist_exchange: rabbitmq.blacklist_exchange.clone(),
            blacklist_accesslog_queue: rabbitmq.blacklist_accesslog_queue.clone(),
            accesslog_queue: rabbitmq.accesslog_to_influx_db_queue.clone(),
            log_file: conf_file.log_file.clone(),
            log_directive: conf_file.log_directive.clone(),
            tuning_file: conf_file.tuning_file.clone(),
            static_tuning: Tuning {
                limited_reader: conf_file.limited_reader,
                one_ip_max_conn: conf_file.one_ip_max_conn,
            },
        })
    }
}

struct ConfHandleInner {
    path: Utf8PathBuf,
    conf: RwLock<Arc<Conf>>,
    conf_file: RwLock<Arc<dto::ConfFile>>,
    changed: tokio::sync::Notify,
}

/// Cloneable handle over the current configuration snapshot.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

impl ConfHandle {
    /// Loads the configuration from `path`, the `IPV4_PROXY_CONFIG_PATH`
    /// environment variable, or the default location, in that order.
    pub fn init(path: Option<&str>) -> anyhow::Result<Self> {
        let path = path
            .map(ToOwned::to_owned)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned())
            .pipe(Utf8PathBuf::from);

        let conf_file = load_conf_file(&path)?;
        let conf = Conf::from_conf_file(&conf_file)?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                path,
                conf: RwLock::new(Arc::new(conf)),
                conf_file: RwLock::new(Arc::new(conf_file)),
                changed: tokio::sync::Notify::new(),
            }),
        })
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner.conf.read())
    }

    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        Arc::clone(&self.inner.conf_file.read())
    }

    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }

    /// Re-reads the configuration file. Returns whether anything changed.
    pub fn reload(&self) -> anyhow::Result<bool> {
        let conf_file = load_conf_file(&self.inner.path)?;

        if *self.get_conf_file() == conf_file {
            return Ok(false);
        }

        let conf = Conf::from_conf_file(&conf_file)?;
        *self.inner.conf.write() = Arc::new(conf);
        *self.inner.conf_file.write() = Arc::new(conf_file);
        self.inner.changed.notify_waiters();

        Ok(true)
    }
}

fn load_conf_file(path: &Utf8PathBuf) -> anyhow::Result<dto::ConfFile> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("couldn't read {path}"))?;
    serde_json::from_str(&contents).with_context(|| format!("invalid configuration file {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_conf_file() -> dto::ConfFile {
        serde_json::from_str(
            r#"{
                "TcpListeners": ["0.0.0.0:1080", "0.0.0.0:8118"],
                "LocalIp": "10.0.0.1",
                "ProcessName": "proxy1",
                "Redis": {"Url": "redis://127.0.0.1:6379/0"},
                "Rabbitmq": {
                    "Host": "mq.internal",
                    "Port": 5672,
                    "User": "proxy",
                    "Password": "pw",
                    "VirtualHost": "/",
                    "BlacklistExchange": "blacklist_broadcast",
                    "BlacklistAccesslogQueue": "blacklist_access_log",
                    "AccesslogToInfluxDbQueue": "access_log_influx"
                },
                "OneIpMaxConn": 100,
                "LogFile": "/var/log/ipv4-proxy/proxy"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn conf_resolves_listeners_and_amqp_uri() {
        let conf = Conf::from_conf_file(&sample_conf_file()).unwrap();

        assert_eq!(conf.listeners.len(), 2);
        assert_eq!(conf.listeners[0], "0.0.0.0:1080".parse().unwrap());
        assert_eq!(conf.amqp_uri, "amqp://proxy:pw@mq.internal:5672/");
        assert_eq!(conf.static_tuning.one_ip_max_conn, 100);
        assert_eq!(conf.accesslog_queue, "access_log_influx");
    }

    #[test]
    fn a_listener_is_required() {
        let mut conf_file = sample_conf_file();
        conf_file.tcp_listeners.clear();

        assert!(Conf::from_conf_file(&conf_file).is_err());
    }

    #[test]
    fn bad_listener_addresses_are_rejected() {
        let mut conf_file = sample_conf_file();
        conf_file.tcp_listeners = vec!["not-an-address".to_owned()];

        assert!(Conf::from_conf_file(&conf_file).is_err());
    }
}
