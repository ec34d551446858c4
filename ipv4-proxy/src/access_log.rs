//! Access-log fan-out towards the control-plane bus.
//!
//! Records are serialised and spread round-robin over sharded in-process
//! FIFOs; a small pool of drainers per shard forwards them to the external
//! bus. Enqueueing never blocks the relay, and a failed publish is logged
//! and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ipv4_proxy_task::{ChildTask, ShutdownSignal, Task};
use prost::Message as _;
use tokio::sync::mpsc;

use crate::bus::{AccessRecordsToInfluxDb, BlackListAccessLog, BusPublisher};
use crate::config::Conf;

pub const QUEUE_SHARDS: usize = 8;
pub const DRAINERS_PER_SHARD: usize = 4;

const FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Only regular accounts exist on this wire today.
const ACCOUNT_TYPE_USER: i32 = 1;

#[derive(Debug)]
pub enum LogRecord {
    Access(AccessRecordsToInfluxDb),
    BlacklistHit(BlackListAccessLog),
}

/// Cheap cloneable producer side of the sharded queues.
#[derive(Clone)]
pub struct AccessLogSender {
    shards: Arc<[mpsc::UnboundedSender<LogRecord>]>,
    cursor: Arc<AtomicU64>,
}

impl AccessLogSender {
    /// One record per relayed flow, emitted at teardown.
    pub fn record_access(&self, username: &str, domain: &str, server_address: &str) {
        self.enqueue(LogRecord::Access(AccessRecordsToInfluxDb {
            user_name: username.to_owned(),
            domain: domain.to_owned(),
            ip: server_address.to_owned(),
            proxy_type: "ipv4".to_owned(),
        }));
    }

    pub fn record_blacklist_hit(&self, site: &str, account: &str, exit_ip: &str) {
        self.enqueue(LogRecord::BlacklistHit(BlackListAccessLog {
            site: site.to_owned(),
            account_type: ACCOUNT_TYPE_USER,
            account: account.to_owned(),
            exit_ip: exit_ip.to_owned(),
        }));
    }

    fn enqueue(&self, record: LogRecord) {
        let shard = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % QUEUE_SHARDS;
        if self.shards[shard].send(record).is_err() {
            warn!("Access-log queues are closed, dropping a record");
        }
    }
}

pub fn access_log_channel() -> (AccessLogSender, Vec<mpsc::UnboundedReceiver<LogRecord>>) {
    let mut senders = Vec::with_capacity(QUEUE_SHARDS);
    let mut receivers = Vec::with_capacity(QUEUE_SHARDS);

    for _ in 0..QUEUE_SHARDS {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        receivers.push(rx);
    }

    (
        AccessLogSender {
            shards: senders.into(),
            cursor: Arc::new(AtomicU64::new(0)),
        },
        receivers,
    )
}

/// Owns the drainer pool. Drainers exit once the queues are closed and
/// drained; shutdown grants them a bounded flush grace.
pub struct AccessLogTask {
    pub receivers: Vec<mpsc::UnboundedReceiver<LogRecord>>,
    pub publisher: Arc<dyn BusPublisher>,
    pub conf: Arc<Conf>,
}

#[async_trait]
impl Task for AccessLogTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "access log fanout";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut drainers = Vec::with_capacity(QUEUE_SHARDS * DRAINERS_PER_SHARD);

        for receiver in self.receivers {
            let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

            for _ in 0..DRAINERS_PER_SHARD {
                let receiver = Arc::clone(&receiver);
                let publisher = Arc::clone(&self.publisher);
                let conf = Arc::clone(&self.conf);

                drainers.push(ChildTask::spawn(async move {
                    drain(receiver, publisher, conf).await;
                }));
            }
        }

        shutdown_signal.wait().await;

        // Senders die with the other tasks; give the drainers a bounded
        // window to flush what is already queued.
        let flush = futures::future::join_all(drainers.into_iter().map(ChildTask::join));
        if tokio::time::timeout(FLUSH_GRACE, flush).await.is_err() {
            warn!("Some access-log records were still queued after the flush grace");
        }

        Ok(())
    }
}

async fn drain(
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<LogRecord>>>,
    publisher: Arc<dyn BusPublisher>,
    conf: Arc<Conf>,
) {
    loop {
        let record = { receiver.lock().await.recv().await };

        let (queue, payload) = match record {
            Some(LogRecord::Access(record)) => (conf.accesslog_queue.as_str(), record.encode_to_vec()),
            Some(LogRecord::BlacklistHit(record)) => (conf.blacklist_accesslog_queue.as_str(), record.encode_to_vec()),
            None => return,
        };

        if let Err(error) = publisher.publish(queue, payload).await {
            warn!(error = format!("{error:#}"), queue, "Failed to publish an access-log record");
        }
    }
}
