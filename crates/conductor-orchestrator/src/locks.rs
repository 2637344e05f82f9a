use chrono::{DateTime, Duration, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Lease mode on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Sole holder.
    Exclusive,
    /// Compatible with other shared-read holders only.
    SharedRead,
    /// Announced write; excludes every other holder like `Exclusive`.
    SharedWrite,
}

/// A lease on a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource: String,
    pub owner: String,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Blocks writers other than the owner.
    pub fn is_writer(&self) -> bool {
        self.lock_type != LockType::SharedRead
    }
}

/// TTL-based resource leases.
///
/// A single mutex covers the whole table; expired leases are dropped lazily on
/// every access and are never honored.
pub struct LockManager {
    locks: Mutex<HashMap<String, Vec<ResourceLock>>>,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn purge_expired(locks: &mut HashMap<String, Vec<ResourceLock>>, now: DateTime<Utc>) {
        for holders in locks.values_mut() {
            holders.retain(|l| !l.is_expired_at(now));
        }
        locks.retain(|_, holders| !holders.is_empty());
    }

    /// Acquire (or renew) a lease on `resource` for `agent`.
    ///
    /// Re-acquiring a resource the agent already holds extends its TTL in place
    /// and switches it to the requested type, provided the other holders allow it.
    pub fn acquire(
        &self,
        resource: &str,
        agent: &str,
        lock_type: LockType,
        ttl: Option<Duration>,
    ) -> ConductorResult<ResourceLock> {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut locks = self.locks.lock();
        Self::purge_expired(&mut locks, now);

        let holders = locks.entry(resource.to_string()).or_default();
        if let Some(blocking) = holders.iter().find(|l| {
            l.owner != agent
                && !(l.lock_type == LockType::SharedRead && lock_type == LockType::SharedRead)
        }) {
            return Err(ConductorError::Lock(format!(
                "{resource} is locked by {} ({:?})",
                blocking.owner, blocking.lock_type
            )));
        }

        if let Some(existing) = holders.iter_mut().find(|l| l.owner == agent) {
            existing.expires_at = now + ttl;
            existing.lock_type = lock_type;
            debug!(resource, agent, "Lock renewed");
            return Ok(existing.clone());
        }

        let lock = ResourceLock {
            resource: resource.to_string(),
            owner: agent.to_string(),
            lock_type,
            acquired_at: now,
            expires_at: now + ttl,
        };
        holders.push(lock.clone());
        debug!(resource, agent, lock_type = ?lock_type, "Lock acquired");
        Ok(lock)
    }

    /// Release `agent`'s lease on `resource`. Returns false if it held none.
    pub fn release(&self, resource: &str, agent: &str) -> bool {
        let mut locks = self.locks.lock();
        Self::purge_expired(&mut locks, Utc::now());
        let Some(holders) = locks.get_mut(resource) else {
            return false;
        };
        let before = holders.len();
        holders.retain(|l| l.owner != agent);
        let released = holders.len() < before;
        if holders.is_empty() {
            locks.remove(resource);
        }
        released
    }

    /// Release every lease held by `agent`.
    pub fn release_all(&self, agent: &str) -> usize {
        let mut locks = self.locks.lock();
        Self::purge_expired(&mut locks, Utc::now());
        let mut released = 0;
        for holders in locks.values_mut() {
            let before = holders.len();
            holders.retain(|l| l.owner != agent);
            released += before - holders.len();
        }
        locks.retain(|_, holders| !holders.is_empty());
        released
    }

    /// Live leases on `resource`.
    pub fn holders(&self, resource: &str) -> Vec<ResourceLock> {
        let mut locks = self.locks.lock();
        Self::purge_expired(&mut locks, Utc::now());
        locks.get(resource).cloned().unwrap_or_default()
    }

    /// The agent other than `agent` holding a writer lease on `resource`, if any.
    pub fn writer_other_than(&self, resource: &str, agent: &str) -> Option<String> {
        self.holders(resource)
            .into_iter()
            .find(|l| l.owner != agent && l.is_writer())
            .map(|l| l.owner)
    }

    pub fn active_locks(&self) -> Vec<ResourceLock> {
        let mut locks = self.locks.lock();
        Self::purge_expired(&mut locks, Utc::now());
        let mut all: Vec<ResourceLock> = locks.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.resource.cmp(&b.resource).then(a.owner.cmp(&b.owner)));
        all
    }

    pub fn active_count(&self) -> usize {
        let mut locks = self.locks.lock();
        Self::purge_expired(&mut locks, Utc::now());
        locks.values().map(Vec::len).sum()
    }
}
