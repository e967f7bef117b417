//! Named advisory process locks.
//!
//! Acquire is a compare-and-swap on the lock record inside one write
//! transaction: it succeeds when no record exists or the existing one has
//! expired. Contention is a normal outcome, reported as [`LockState::Held`].

use crate::collection::{Change, Collection};
use crate::store::MetaStoreResult;
use crate::types::ProcessLock;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of an acquire attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Acquired(ProcessLock),
    /// Somebody else holds an unexpired lock
    Held(ProcessLock),
}

impl LockState {
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Lock table handle. Every handle carries its own holder id.
#[derive(Debug, Clone)]
pub struct ProcessLocks {
    locks: Collection<ProcessLock>,
    holder: Uuid,
    host: String,
}

impl ProcessLocks {
    pub(crate) fn new(locks: Collection<ProcessLock>) -> Self {
        let host = hostname().unwrap_or_else(|| "unknown".to_string());
        Self {
            locks,
            holder: Uuid::new_v4(),
            host,
        }
    }

    pub(crate) const fn collection(&self) -> &Collection<ProcessLock> {
        &self.locks
    }

    pub const fn holder(&self) -> Uuid {
        self.holder
    }

    pub fn acquire(&self, name: &str, ttl: Duration) -> MetaStoreResult<LockState> {
        self.acquire_at(name, ttl, Utc::now())
    }

    pub(crate) fn acquire_at(
        &self,
        name: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> MetaStoreResult<LockState> {
        let expires_at = expiry(now, ttl);
        let state = self.locks.modify(name, |current| match current {
            Some(existing) if !existing.is_expired(now) => {
                (Change::Keep, LockState::Held(existing))
            }
            stale => {
                if let Some(stale) = stale {
                    warn!(
                        "Taking over expired lock '{}' from {} on {}",
                        name, stale.holder, stale.host
                    );
                }
                let lock = ProcessLock {
                    name: name.to_string(),
                    holder: self.holder,
                    host: self.host.clone(),
                    acquired_at: now,
                    expires_at,
                };
                (Change::Put(lock.clone()), LockState::Acquired(lock))
            }
        })?;
        debug!("Lock '{}': acquired={}", name, state.is_acquired());
        Ok(state)
    }

    /// Push the expiry of a lock this handle took forward by `ttl`.
    ///
    /// Returns `false` when the lock is gone or was taken over by another
    /// holder. An expired lock nobody took over is still renewed.
    pub fn renew(&self, name: &str, ttl: Duration) -> MetaStoreResult<bool> {
        self.renew_at(name, ttl, Utc::now())
    }

    pub(crate) fn renew_at(
        &self,
        name: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> MetaStoreResult<bool> {
        self.locks.modify(name, |current| match current {
            Some(mut lock) if lock.holder == self.holder => {
                lock.expires_at = expiry(now, ttl);
                (Change::Put(lock), true)
            }
            _ => (Change::Keep, false),
        })
    }

    /// Push the expiry of a shared lock forward whoever took it. Used for
    /// locks that several processes work under in turn (the staging cycle).
    pub fn extend(&self, name: &str, ttl: Duration) -> MetaStoreResult<bool> {
        let now = Utc::now();
        self.locks.modify(name, |current| match current {
            Some(mut lock) => {
                lock.expires_at = expiry(now, ttl);
                (Change::Put(lock), true)
            }
            None => (Change::Keep, false),
        })
    }

    /// Release unconditionally. Locks are routinely released by a later
    /// process than the one that took them (cycle teardown).
    pub fn release(&self, name: &str) -> MetaStoreResult<bool> {
        self.locks.delete(name)
    }

    /// Release every lock whose name starts with `prefix`
    pub fn release_prefix(&self, prefix: &str) -> MetaStoreResult<usize> {
        self.locks.delete_many(|lock| lock.name.starts_with(prefix))
    }

    /// Whether an unexpired lock exists
    pub fn is_held(&self, name: &str) -> MetaStoreResult<bool> {
        let now = Utc::now();
        Ok(self
            .locks
            .get(name)?
            .is_some_and(|lock| !lock.is_expired(now)))
    }

    /// Whether a lock record exists, expired or not
    pub fn is_present(&self, name: &str) -> MetaStoreResult<bool> {
        Ok(self.locks.get(name)?.is_some())
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
}
