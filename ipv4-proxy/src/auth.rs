//! Credential validation against the external key/value + set store.
//!
//! Store layout, per user: `auth_user_data_<username>` holds the
//! JSON-encoded identity record and `user_ip_set_<username>` the set of
//! allowed server-side IPs. The proxy only reads on the hot path; writes
//! come from the control-plane handlers and go through atomic scripts.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const AUTH_USER_DATA_PREFIX: &str = "auth_user_data";
pub const USER_IP_SET_PREFIX: &str = "user_ip_set";

// SET the record, reset the IP set, fill it: one atomic step.
const SET_USER_SCRIPT: &str = r"redis.call('SET', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
for i = 2, #ARGV do
    redis.call('SADD', KEYS[2], ARGV[i])
end
return 1";

// Same, but extends the existing IP set instead of resetting it.
const ADD_USER_SCRIPT: &str = r"redis.call('SET', KEYS[1], ARGV[1])
for i = 2, #ARGV do
    redis.call('SADD', KEYS[2], ARGV[i])
end
return 1";

pub fn user_data_key(username: &str) -> String {
    format!("{AUTH_USER_DATA_PREFIX}_{username}")
}

pub fn user_ip_set_key(username: &str) -> String {
    format!("{USER_IP_SET_PREFIX}_{username}")
}

/// Identity record stored as a JSON blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityRecord {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub update_unix: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("credential store failure: {0}")]
pub struct StoreError(pub String);

/// Combined result of the GET + SISMEMBER pipeline.
pub struct StoreFetch {
    pub record: Option<String>,
    pub ip_allowed: bool,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Single atomic pipeline: record blob and IP membership for `server_ip`.
    async fn fetch(&self, username: &str, server_ip: &str) -> Result<StoreFetch, StoreError>;

    /// Atomic set: write the record and replace the IP set.
    async fn set_user(&self, username: &str, record_json: &str, ips: &[String]) -> Result<(), StoreError>;

    /// Atomic add: write the record and extend the IP set.
    async fn add_user(&self, username: &str, record_json: &str, ips: &[String]) -> Result<(), StoreError>;

    /// Removes both keys of the user.
    async fn delete_user(&self, username: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no user data for {0}")]
    UserNotFound(String),
    #[error("{0}")]
    Store(String),
    #[error("bad credentials for user {0}")]
    BadCredentials(String),
    #[error("server IP {ip} is not allowed for user {username}")]
    IpNotAllowed { username: String, ip: String },
}

impl From<StoreError> for AuthError {
    fn from(error: StoreError) -> Self {
        AuthError::Store(error.to_string())
    }
}

/// Validates `(username, password, server_ip)` against the store and yields
/// the identity record.
pub async fn validate(
    store: &dyn IdentityStore,
    username: &str,
    password: &str,
    server_ip: &str,
) -> Result<IdentityRecord, AuthError> {
    let fetch = store.fetch(username, server_ip).await?;

    let raw = fetch
        .record
        .ok_or_else(|| AuthError::UserNotFound(username.to_owned()))?;

    let record: IdentityRecord = serde_json::from_str(&raw)
        .map_err(|error| AuthError::Store(format!("malformed user data for {username}: {error}")))?;

    if record.username != username || record.password != password {
        return Err(AuthError::BadCredentials(username.to_owned()));
    }

    if !fetch.ip_allowed {
        return Err(AuthError::IpNotAllowed {
            username: username.to_owned(),
            ip: server_ip.to_owned(),
        });
    }

    Ok(record)
}

/// Store implementation over a shared Redis connection.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    set_script: redis::Script,
    add_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;

        Ok(Self {
            manager,
            set_script: redis::Script::new(SET_USER_SCRIPT),
            add_script: redis::Script::new(ADD_USER_SCRIPT),
        })
    }

    async fn run_user_script(
        &self,
        script: &redis::Script,
        username: &str,
        record_json: &str,
        ips: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();

        let mut invocation = script.prepare_invoke();
        invocation.key(user_data_key(username));
        invocation.key(user_ip_set_key(username));
        invocation.arg(record_json);
        for ip in ips {
            invocation.arg(ip.as_str());
        }

        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|error| StoreError(error.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl IdentityStore for RedisStore {
    async fn fetch(&self, username: &str, server_ip: &str) -> Result<StoreFetch, StoreError> {
        let mut conn = self.manager.clone();

        let (record, ip_allowed): (Option<String>, bool) = redis::pipe()
            .get(user_data_key(username))
            .sismember(user_ip_set_key(username), server_ip)
            .query_async(&mut conn)
            .await
            .map_err(|error| StoreError(error.to_string()))?;

        Ok(StoreFetch { record, ip_allowed })
    }

    async fn set_user(&self, username: &str, record_json: &str, ips: &[String]) -> Result<(), StoreError> {
        self.run_user_script(&self.set_script, username, record_json, ips).await
    }

    async fn add_user(&self, username: &str, record_json: &str, ips: &[String]) -> Result<(), StoreError> {
        self.run_user_script(&self.add_script, username, record_json, ips).await
    }

    async fn delete_user(&self, username: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();

        let _: () = redis::pipe()
            .del(user_data_key(username))
            .del(user_ip_set_key(username))
            .query_async(&mut conn)
            .await
            .map_err(|error| StoreError(error.to_string()))?;

        Ok(())
    }
}

/// Process-local store used by tests and local development.
#[derive(Default)]
pub struct InMemoryStore {
    users: parking_lot::Mutex<HashMap<String, (String, HashSet<String>)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience seeding in the store's JSON shape.
    pub fn insert_user(&self, username: &str, password: &str, ips: &[&str]) {
        let record = IdentityRecord {
            username: username.to_owned(),
            password: password.to_owned(),
            update_unix: 0,
        };
        let json = serde_json::to_string(&record).expect("record serialization");
        self.users.lock().insert(
            username.to_owned(),
            (json, ips.iter().map(|ip| (*ip).to_owned()).collect()),
        );
    }
}

#[async_trait]
impl IdentityStore for InMemoryStore {
    async fn fetch(&self, username: &str, server_ip: &str) -> Result<StoreFetch, StoreError> {
        let users = self.users.lock();

        Ok(match users.get(username) {
            Some((record, ips)) => StoreFetch {
                record: Some(record.clone()),
                ip_allowed: ips.contains(server_ip),
            },
            None => StoreFetch {
                record: None,
                ip_allowed: false,
            },
        })
    }

    async fn set_user(&self, username: &str, record_json: &str, ips: &[String]) -> Result<(), StoreError> {
        self.users.lock().insert(
            username.to_owned(),
            (record_json.to_owned(), ips.iter().cloned().collect()),
        );
        Ok(())
    }

    async fn add_user(&self, username: &str, record_json: &str, ips: &[String]) -> Result<(), StoreError> {
        let mut users = self.users.lock();
        let entry = users
            .entry(username.to_owned())
            .or_insert_with(|| (String::new(), HashSet::new()));
        entry.0 = record_json.to_owned();
        entry.1.extend(ips.iter().cloned());
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<(), StoreError> {
        self.users.lock().remove(username);
        Ok(())
    }
}
