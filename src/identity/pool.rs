use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::account::BackendAccount;
use crate::backend::{BackendConnector, BackendSession, SharedSession};
use crate::error::GateError;

struct PoolEntry {
    session: SharedSession,
    expires_at: Mutex<Instant>,
}

impl PoolEntry {
    fn live_for(&self, account: &BackendAccount, now: Instant) -> bool {
        *self.expires_at.lock() > now && self.session.account() == account
    }
}

/// A session removed from the pool that still has to be released.
pub struct Evicted {
    pub key: String,
    pub session: SharedSession,
}

/// Release evicted sessions. Failures are logged and do not stop the remaining releases.
pub fn release_evicted(events: Vec<Evicted>) {
    for ev in events {
        match ev.session.release() {
            Ok(()) => tracing::debug!(key = %ev.key, "pool: released evicted session"),
            Err(e) => tracing::warn!(key = %ev.key, error = %e, "pool: failed to release evicted session"),
        }
    }
}

enum Placement {
    Inserted,
    Pooled(SharedSession),
    Unpooled,
}

/// A session the pool does not own. Released when the last reference drops.
struct Unpooled {
    key: String,
    session: SharedSession,
    released: AtomicBool,
}

impl Unpooled {
    fn new(key: String, session: SharedSession) -> Self {
        Self { key, session, released: AtomicBool::new(false) }
    }
}

impl BackendSession for Unpooled {
    fn account(&self) -> &BackendAccount {
        self.session.account()
    }

    fn call(&self, operation: &str, paths: &[String], args: &Value) -> anyhow::Result<Value> {
        self.session.call(operation, paths, args)
    }

    fn release(&self) -> anyhow::Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.release()
    }
}

impl Drop for Unpooled {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(key = %self.key, error = %e, "pool: failed to release unpooled session");
        }
    }
}

/// Backend sessions keyed by client user, each with an idle deadline refreshed on every hit.
pub struct SessionPool {
    connector: Arc<dyn BackendConnector>,
    ttl: Duration,
    entries: RwLock<HashMap<String, PoolEntry>>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn BackendConnector>, ttl: Duration) -> Self {
        Self { connector, ttl, entries: RwLock::new(HashMap::new()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Return the pooled session for `account.client_user`, opening one on a miss.
    ///
    /// An entry is reused only while it is unexpired and was opened for an identical account.
    /// The backend connect runs outside the lock, and the existing entry is left alone until it
    /// succeeds. A live entry opened with other credentials keeps its slot; the caller gets an
    /// unpooled session instead, released once its last holder drops it.
    pub fn get(&self, account: &BackendAccount) -> Result<SharedSession, GateError> {
        let key = account.client_user.clone();
        let now = Instant::now();

        if let Some(entry) = self.entries.read().get(&key) {
            if entry.live_for(account, now) {
                *entry.expires_at.lock() = now + self.ttl;
                return Ok(entry.session.clone());
            }
        }

        tracing::debug!(user = %key, "pool: opening backend session");
        let session = self.connector.open(account).map_err(|e| GateError::BackendSessionUnavailable {
            user: key.clone(),
            reason: format!("{:#}", e),
        })?;

        let now = Instant::now();
        let mut replaced = Vec::new();
        let outcome = {
            let mut map = self.entries.write();
            match map.get(&key) {
                Some(existing) if existing.live_for(account, now) => {
                    *existing.expires_at.lock() = now + self.ttl;
                    Placement::Pooled(existing.session.clone())
                }
                Some(existing) if *existing.expires_at.lock() > now => Placement::Unpooled,
                _ => {
                    let entry = PoolEntry { session: session.clone(), expires_at: Mutex::new(now + self.ttl) };
                    if let Some(old) = map.insert(key.clone(), entry) {
                        replaced.push(Evicted { key: key.clone(), session: old.session });
                    }
                    Placement::Inserted
                }
            }
        };
        release_evicted(replaced);

        match outcome {
            Placement::Inserted => Ok(session),
            Placement::Pooled(pooled) => {
                // another caller inserted first; ours was never shared
                release_evicted(vec![Evicted { key, session }]);
                Ok(pooled)
            }
            Placement::Unpooled => {
                tracing::debug!(user = %key, "pool: live entry holds other credentials, handing out an unpooled session");
                Ok(Arc::new(Unpooled::new(key, session)))
            }
        }
    }

    /// Remove every expired entry and release its session.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<Evicted> = {
            let mut map = self.entries.write();
            let expired: Vec<String> = map
                .iter()
                .filter(|(_, e)| *e.expires_at.lock() <= now)
                .map(|(k, _)| k.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|k| map.remove(&k).map(|e| Evicted { key: k, session: e.session }))
                .collect()
        };
        let n = evicted.len();
        if n > 0 {
            tracing::info!(count = n, "pool: evicted idle sessions");
        }
        release_evicted(evicted);
        n
    }

    /// Drop and release every session, used at shutdown.
    pub fn clear(&self) {
        let evicted: Vec<Evicted> = self
            .entries
            .write()
            .drain()
            .map(|(key, e)| Evicted { key, session: e.session })
            .collect();
        release_evicted(evicted);
    }
}
