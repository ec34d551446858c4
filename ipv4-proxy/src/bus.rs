//! Control-plane message types and the publisher seam.
//!
//! Queue payloads are protobuf-encoded except the blacklist broadcast,
//! which is JSON.

use async_trait::async_trait;

/// User record as carried on the `SetUserData`/`DeleteUserData` queues.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthInfo {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
    #[prost(string, repeated, tag = "3")]
    pub ips: Vec<String>,
    #[prost(int64, tag = "4")]
    pub update_unix: i64,
}

/// Force-close command: all flows of `username`, or only those bound to the
/// listed server IPs.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectInfo {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, repeated, tag = "2")]
    pub ips: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlackListAccessLog {
    #[prost(string, tag = "1")]
    pub site: String,
    #[prost(int32, tag = "2")]
    pub account_type: i32,
    #[prost(string, tag = "3")]
    pub account: String,
    #[prost(string, tag = "4")]
    pub exit_ip: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AccessRecordsToInfluxDb {
    #[prost(string, tag = "1")]
    pub user_name: String,
    #[prost(string, tag = "2")]
    pub domain: String,
    #[prost(string, tag = "3")]
    pub ip: String,
    #[prost(string, tag = "4")]
    pub proxy_type: String,
}

/// Blacklist broadcast payload (JSON on a fanout exchange).
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct BlacklistBroadcast {
    pub ts: i64,
    pub blacklist: Vec<String>,
}

/// Outbound bus seam; failures are the caller's to log and drop.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

// Per-process queue names: each proxy instance consumes its own queues,
// suffixed with the local IP and process name.

pub fn set_user_data_queue(local_ip: &str, process_name: &str) -> String {
    format!("SetUserData_{local_ip}_{process_name}")
}

pub fn delete_user_data_queue(local_ip: &str, process_name: &str) -> String {
    format!("DeleteUserData_{local_ip}_{process_name}")
}

pub fn disconnect_queue(local_ip: &str, process_name: &str) -> String {
    format!("Disconnect_{local_ip}_{process_name}")
}

pub fn blacklist_queue(local_ip: &str, process_name: &str) -> String {
    format!("new_blackListMsg_{local_ip}_{process_name}")
}
