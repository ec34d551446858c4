//! Per-user connection registry and per-IP admission control.
//!
//! Both maps are sharded; every count or refcount decision runs inside the
//! owning shard lock so concurrent flows can never lose an update.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use transport::FlowLimiter;

use crate::dynconf::TuningHandle;

/// Coordination object shared by every simultaneous flow of one
/// `user:server_ip` pair: one cancellation token, one rate limiter.
pub struct ConnContext {
    pub cancel: CancellationToken,
    pub limiter: Arc<FlowLimiter>,
    refs: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
#[error("no live connection context for {0}")]
pub struct UnknownContext(pub String);

pub fn context_key(username: &str, server_ip: &str) -> String {
    format!("{username}:{server_ip}")
}

pub struct SessionRegistry {
    contexts: DashMap<String, Arc<ConnContext>>,
    ip_counts: DashMap<String, AtomicI64>,
    tuning: TuningHandle,
    root: CancellationToken,
}

impl SessionRegistry {
    pub fn new(tuning: TuningHandle) -> Self {
        Self {
            contexts: DashMap::new(),
            ip_counts: DashMap::new(),
            tuning,
            root: CancellationToken::new(),
        }
    }

    /// Cancels every live flow; used at service stop.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// Joins the context for `key`, creating it with a fresh limiter when
    /// this is the first flow.
    pub fn acquire(&self, key: &str) -> Arc<ConnContext> {
        match self.contexts.entry(key.to_owned()) {
            Entry::Occupied(entry) => {
                let ctx = entry.get();
                ctx.refs.fetch_add(1, Ordering::AcqRel);
                Arc::clone(ctx)
            }
            Entry::Vacant(entry) => {
                let tuning = self.tuning.load();
                let ctx = Arc::new(ConnContext {
                    cancel: self.root.child_token(),
                    limiter: Arc::new(FlowLimiter::new(
                        tuning.limited_reader.read_rate,
                        tuning.limited_reader.read_burst,
                    )),
                    refs: AtomicU64::new(1),
                });
                entry.insert(Arc::clone(&ctx));
                ctx
            }
        }
    }

    /// Leaves the context. The entry is only touched while it still refers
    /// to the same context object; when the last flow leaves, the entry is
    /// removed and its token fired.
    pub fn release(&self, key: &str, ctx: &Arc<ConnContext>) {
        let removed = self.contexts.remove_if(key, |_, current| {
            if !Arc::ptr_eq(current, ctx) {
                return false;
            }
            current.refs.fetch_sub(1, Ordering::AcqRel) == 1
        });

        if let Some((_, ctx)) = removed {
            ctx.cancel.cancel();
        }
    }

    /// Pops the context regardless of its reference count and fires its
    /// token. Flows arriving afterwards create a fresh context.
    pub fn force_close(&self, key: &str) -> Result<(), UnknownContext> {
        match self.contexts.remove(key) {
            Some((_, ctx)) => {
                ctx.cancel.cancel();
                Ok(())
            }
            None => Err(UnknownContext(key.to_owned())),
        }
    }

    /// Force-closes every context of the user, whatever the server IP.
    pub fn close_user(&self, username: &str) {
        let prefix = format!("{username}:");
        let keys: Vec<String> = self
            .contexts
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            let _ = self.force_close(&key);
        }
    }

    /// Reparameterises every live limiter.
    pub fn apply_limits(&self, read_rate: i64, read_burst: i64) {
        for entry in self.contexts.iter() {
            entry.value().limiter.update(read_rate, read_burst);
        }
    }

    pub fn context_refs(&self, key: &str) -> Option<u64> {
        self.contexts.get(key).map(|ctx| ctx.refs.load(Ordering::Acquire))
    }

    /// Admits one more connection on the given server-local IP, or refuses
    /// when the configured cap is reached. The returned guard releases the
    /// slot on drop.
    pub fn admit(self: &Arc<Self>, server_ip: &str) -> Option<IpAdmission> {
        let cap = self.tuning.load().one_ip_max_conn;

        let admitted = match self.ip_counts.entry(server_ip.to_owned()) {
            Entry::Occupied(entry) => {
                let count = entry.get();
                if cap > 0 && count.load(Ordering::Acquire) >= cap {
                    false
                } else {
                    count.fetch_add(1, Ordering::AcqRel);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(AtomicI64::new(1));
                true
            }
        };

        admitted.then(|| IpAdmission {
            registry: Arc::clone(self),
            server_ip: server_ip.to_owned(),
        })
    }

    fn release_ip(&self, server_ip: &str) {
        self.ip_counts
            .remove_if(server_ip, |_, count| count.fetch_sub(1, Ordering::AcqRel) == 1);
    }

    pub fn ip_connection_count(&self, server_ip: &str) -> i64 {
        self.ip_counts
            .get(server_ip)
            .map(|count| count.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// One admitted connection slot on a server-local IP.
pub struct IpAdmission {
    registry: Arc<SessionRegistry>,
    server_ip: String,
}

impl Drop for IpAdmission {
    fn drop(&mut self) {
        self.registry.release_ip(&self.server_ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynconf::Tuning;

    fn registry(one_ip_max_conn: i64) -> Arc<SessionRegistry> {
        let tuning = TuningHandle::new(Tuning {
            one_ip_max_conn,
            ..Tuning::default()
        });
        Arc::new(SessionRegistry::new(tuning))
    }

    #[test]
    fn contexts_are_shared_and_reference_counted() {
        let registry = registry(0);

        let first = registry.acquire("alice:10.0.0.1");
        let second = registry.acquire("alice:10.0.0.1");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.context_refs("alice:10.0.0.1"), Some(2));

        registry.release("alice:10.0.0.1", &first);
        assert_eq!(registry.context_refs("alice:10.0.0.1"), Some(1));
        assert!(!second.cancel.is_cancelled());

        registry.release("alice:10.0.0.1", &second);
        assert_eq!(registry.context_refs("alice:10.0.0.1"), None);
        assert!(second.cancel.is_cancelled());
    }

    #[test]
    fn release_ignores_a_superseded_context() {
        let registry = registry(0);

        let stale = registry.acquire("alice:10.0.0.1");
        registry.force_close("alice:10.0.0.1").unwrap();

        // A new flow arrives and creates a fresh context under the same key.
        let fresh = registry.acquire("alice:10.0.0.1");
        assert!(!Arc::ptr_eq(&stale, &fresh));

        // The stale flow's teardown must not disturb the fresh context.
        registry.release("alice:10.0.0.1", &stale);
        assert_eq!(registry.context_refs("alice:10.0.0.1"), Some(1));
        assert!(!fresh.cancel.is_cancelled());
    }

    #[test]
    fn force_close_cancels_and_is_idempotent() {
        let registry = registry(0);

        let ctx = registry.acquire("alice:10.0.0.1");
        registry.acquire("alice:10.0.0.1");

        registry.force_close("alice:10.0.0.1").unwrap();
        assert!(ctx.cancel.is_cancelled());

        let err = registry.force_close("alice:10.0.0.1").unwrap_err();
        assert_eq!(err.to_string(), "no live connection context for alice:10.0.0.1");
    }

    #[test]
    fn close_user_sweeps_every_server_ip_of_that_user() {
        let registry = registry(0);

        let a1 = registry.acquire("alice:10.0.0.1");
        let a2 = registry.acquire("alice:10.0.0.2");
        let bob = registry.acquire("bob:10.0.0.1");

        registry.close_user("alice");

        assert!(a1.cancel.is_cancelled());
        assert!(a2.cancel.is_cancelled());
        assert!(!bob.cancel.is_cancelled());
    }

    #[test]
    fn cancel_all_reaches_child_tokens() {
        let registry = registry(0);
        let ctx = registry.acquire("alice:10.0.0.1");

        registry.cancel_all();
        assert!(ctx.cancel.is_cancelled());
    }

    #[test]
    fn per_ip_cap_refuses_the_overflowing_connection() {
        let registry = registry(2);

        let first = registry.admit("10.0.0.5").expect("first admitted");
        let _second = registry.admit("10.0.0.5").expect("second admitted");
        assert!(registry.admit("10.0.0.5").is_none());
        assert_eq!(registry.ip_connection_count("10.0.0.5"), 2);

        // Releasing one slot lets the next connection in.
        drop(first);
        assert!(registry.admit("10.0.0.5").is_some());
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let registry = registry(0);

        let guards: Vec<_> = (0..64).map(|_| registry.admit("10.0.0.5").expect("admitted")).collect();
        assert_eq!(registry.ip_connection_count("10.0.0.5"), 64);

        drop(guards);
        assert_eq!(registry.ip_connection_count("10.0.0.5"), 0);
    }

    #[test]
    fn count_entry_disappears_when_it_reaches_zero() {
        let registry = registry(0);

        let guard = registry.admit("10.0.0.5").expect("admitted");
        drop(guard);

        assert!(registry.ip_counts.get("10.0.0.5").is_none());
    }
}
