//! Control-plane bus plumbing over AMQP.
//!
//! One task owns the connection: it spawns a consumer per control queue,
//! exposes a publish channel for the access-log fan-out, and reconnects
//! with a fixed backoff when the broker drops the connection. Handler
//! failures never propagate past their own delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::StreamExt as _;
use ipv4_proxy_task::{ShutdownSignal, Task};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use prost::Message as _;

use crate::bus::{self, AuthInfo, BusPublisher, DisconnectInfo};
use crate::{ProxyState, auth};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Disconnect commands are stale after a minute.
const DISCONNECT_QUEUE_TTL_MS: i32 = 60 * 1000;

/// Publisher over the connection owned by [`ControlPlaneTask`]; publishes
/// fail fast while the connection is down.
#[derive(Default)]
pub struct AmqpPublisher {
    channel: ArcSwapOption<Channel>,
}

impl AmqpPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BusPublisher for AmqpPublisher {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let channel = self.channel.load_full().context("bus connection is down")?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .context("basic publish")?
            .await
            .context("publisher confirmation")?;

        Ok(())
    }
}

pub struct ControlPlaneTask {
    pub state: ProxyState,
    pub publisher: Arc<AmqpPublisher>,
}

#[async_trait]
impl Task for ControlPlaneTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "control plane bus";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            tokio::select! {
                _ = shutdown_signal.wait() => return Ok(()),
                ended = serve_connection(&self.state, &self.publisher) => {
                    self.publisher.channel.store(None);
                    match ended {
                        Ok(()) => warn!("Bus connection ended"),
                        Err(error) => warn!(error = format!("{error:#}"), "Bus connection failed"),
                    }
                }
            }

            tokio::select! {
                _ = shutdown_signal.wait() => return Ok(()),
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }
}

async fn serve_connection(state: &ProxyState, publisher: &AmqpPublisher) -> anyhow::Result<()> {
    let conf = state.conf_handle.get_conf();

    let connection = Connection::connect(&conf.amqp_uri, ConnectionProperties::default())
        .await
        .context("AMQP connect")?;

    let publish_channel = connection.create_channel().await.context("publish channel")?;
    publish_channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .context("confirm select")?;
    publisher.channel.store(Some(Arc::new(publish_channel)));

    info!("Control-plane bus connected");

    // Every consumer runs until its stream closes; the first one to stop
    // tears the whole connection down and triggers a reconnect.
    tokio::try_join!(
        consume_blacklist(&connection, state),
        consume_set_user_data(&connection, state),
        consume_delete_user_data(&connection, state),
        consume_disconnect(&connection, state),
    )?;

    Ok(())
}

async fn consume_blacklist(connection: &Connection, state: &ProxyState) -> anyhow::Result<()> {
    let conf = state.conf_handle.get_conf();
    let queue = bus::blacklist_queue(&conf.local_ip, &conf.process_name);

    let channel = connection.create_channel().await.context("blacklist channel")?;
    channel
        .queue_declare(&queue, durable_queue(), FieldTable::default())
        .await
        .context("blacklist queue declare")?;
    // Fanout exchange: the routing key is ignored.
    channel
        .queue_bind(
            &queue,
            &conf.blacklist_exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("blacklist queue bind")?;

    let mut deliveries = channel
        .basic_consume(&queue, "", auto_ack(), FieldTable::default())
        .await
        .context("blacklist consume")?;

    while let Some(delivery) = deliveries.next().await {
        let delivery = delivery.context("blacklist delivery")?;
        handle_blacklist_broadcast(state, &delivery.data);
    }

    anyhow::bail!("blacklist consumer closed")
}

async fn consume_set_user_data(connection: &Connection, state: &ProxyState) -> anyhow::Result<()> {
    let conf = state.conf_handle.get_conf();
    let queue = bus::set_user_data_queue(&conf.local_ip, &conf.process_name);

    let channel = connection.create_channel().await.context("set-user-data channel")?;
    channel
        .queue_declare(&queue, durable_queue(), FieldTable::default())
        .await
        .context("set-user-data queue declare")?;

    let mut deliveries = channel
        .basic_consume(&queue, "", BasicConsumeOptions::default(), FieldTable::default())
        .await
        .context("set-user-data consume")?;

    while let Some(delivery) = deliveries.next().await {
        let delivery = delivery.context("set-user-data delivery")?;

        match handle_set_user_data(state, &delivery.data).await {
            Ok(username) => {
                delivery.ack(BasicAckOptions::default()).await.context("ack")?;
                info!(username, "User data stored");
            }
            Err(SetUserDataError::Discard(error)) => {
                error!(error = format!("{error:#}"), "Dropping an unusable SetUserData message");
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await
                    .context("nack")?;
            }
            Err(SetUserDataError::Retry(error)) => {
                error!(error = format!("{error:#}"), "Store write failed, requeueing SetUserData");
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
                    .context("nack")?;
            }
        }
    }

    anyhow::bail!("set-user-data consumer closed")
}

async fn consume_delete_user_data(connection: &Connection, state: &ProxyState) -> anyhow::Result<()> {
    let conf = state.conf_handle.get_conf();
    let queue = bus::delete_user_data_queue(&conf.local_ip, &conf.process_name);

    let channel = connection.create_channel().await.context("delete-user-data channel")?;
    channel
        .queue_declare(&queue, durable_queue(), FieldTable::default())
        .await
        .context("delete-user-data queue declare")?;

    let mut deliveries = channel
        .basic_consume(&queue, "", auto_ack(), FieldTable::default())
        .await
        .context("delete-user-data consume")?;

    while let Some(delivery) = deliveries.next().await {
        let delivery = delivery.context("delete-user-data delivery")?;
        handle_delete_user_data(state, &delivery.data).await;
    }

    anyhow::bail!("delete-user-data consumer closed")
}

async fn consume_disconnect(connection: &Connection, state: &ProxyState) -> anyhow::Result<()> {
    let conf = state.conf_handle.get_conf();
    let queue = bus::disconnect_queue(&conf.local_ip, &conf.process_name);

    let channel = connection.create_channel().await.context("disconnect channel")?;

    let mut args = FieldTable::default();
    args.insert(ShortString::from("x-message-ttl"), AMQPValue::LongInt(DISCONNECT_QUEUE_TTL_MS));
    channel
        .queue_declare(&queue, durable_queue(), args)
        .await
        .context("disconnect queue declare")?;

    let mut deliveries = channel
        .basic_consume(&queue, "", auto_ack(), FieldTable::default())
        .await
        .context("disconnect consume")?;

    while let Some(delivery) = deliveries.next().await {
        let delivery = delivery.context("disconnect delivery")?;
        info!("Disconnect command received");
        handle_disconnect(state, &delivery.data);
    }

    anyhow::bail!("disconnect consumer closed")
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn auto_ack() -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_ack: true,
        ..BasicConsumeOptions::default()
    }
}

// Handlers. These are plain functions over `ProxyState` so they can be
// exercised without a broker.

pub(crate) fn handle_blacklist_broadcast(state: &ProxyState, body: &[u8]) {
    let broadcast: bus::BlacklistBroadcast = match serde_json::from_slice(body) {
        Ok(broadcast) => broadcast,
        Err(error) => {
            error!(%error, "Unusable blacklist broadcast");
            return;
        }
    };

    let entries: HashSet<String> = broadcast.blacklist.into_iter().collect();
    info!(entries = entries.len(), ts = broadcast.ts, "Blacklist replaced");
    state.blacklist.replace(entries);
}

pub(crate) enum SetUserDataError {
    /// The message itself is unusable; drop it.
    Discard(anyhow::Error),
    /// The store write failed; the message is fine, requeue it.
    Retry(anyhow::Error),
}

pub(crate) async fn handle_set_user_data(state: &ProxyState, body: &[u8]) -> Result<String, SetUserDataError> {
    let mut info = AuthInfo::decode(body).map_err(|error| SetUserDataError::Discard(error.into()))?;

    let ips = std::mem::take(&mut info.ips);
    let record = auth::IdentityRecord {
        username: info.username.clone(),
        password: info.password,
        update_unix: time::OffsetDateTime::now_utc().unix_timestamp(),
    };
    let record_json = serde_json::to_string(&record).map_err(|error| SetUserDataError::Discard(error.into()))?;

    state
        .identity_store
        .set_user(&info.username, &record_json, &ips)
        .await
        .map_err(|error| SetUserDataError::Retry(error.into()))?;

    Ok(info.username)
}

pub(crate) async fn handle_delete_user_data(state: &ProxyState, body: &[u8]) {
    let info = match AuthInfo::decode(body) {
        Ok(info) => info,
        Err(error) => {
            error!(%error, "Unusable DeleteUserData message");
            return;
        }
    };

    if let Err(error) = state.identity_store.delete_user(&info.username).await {
        error!(%error, username = info.username, "Store delete failed");
    }

    // Whatever the store said, the user must not keep any live flow.
    state.sessions.close_user(&info.username);
    info!(username = info.username, "User deleted and flows cancelled");
}

pub(crate) fn handle_disconnect(state: &ProxyState, body: &[u8]) {
    let info = match DisconnectInfo::decode(body) {
        Ok(info) => info,
        Err(error) => {
            error!(%error, "Unusable Disconnect message");
            return;
        }
    };

    if info.username.is_empty() {
        error!("Disconnect command without a username");
        return;
    }

    if info.ips.is_empty() {
        state.sessions.close_user(&info.username);
        return;
    }

    for ip in &info.ips {
        let key = crate::session::context_key(&info.username, ip);
        if let Err(error) = state.sessions.force_close(&key) {
            error!(%error, "Disconnect by user and IP failed");
        }
    }
}
