//! Leases: short-lived pins that keep objects alive through GC.
//!
//! A lease pins blobs and snapshots by key. Pins are written through the
//! metadata store, so a pin added before a GC pass starts is seen by it.
//! Pinning an object that does not exist yet is allowed; that is how a
//! build protects the snapshot it is about to commit.

use crate::error::{Error, Result};
use crate::metadata::{Db, LeaseRecord, Resource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identifier of a lease.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(String);

impl LeaseId {
    /// A fresh random id.
    pub fn generate() -> Self {
        LeaseId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LeaseId {
    fn from(s: &str) -> Self {
        LeaseId(s.to_string())
    }
}

impl From<String> for LeaseId {
    fn from(s: String) -> Self {
        LeaseId(s)
    }
}

/// Public view of a lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub id: LeaseId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub pins: Vec<Resource>,
}

impl Lease {
    fn from_record(id: &str, record: &LeaseRecord) -> Self {
        Self {
            id: LeaseId::from(id),
            created_at: record.created_at,
            expires_at: record.expires_at,
            labels: record.labels.clone(),
            pins: record.pins.iter().cloned().collect(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Creates, pins and releases leases.
#[derive(Debug)]
pub struct LeaseManager {
    db: Arc<Db>,
}

impl LeaseManager {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Create a lease with no expiry and no labels.
    pub fn create(&self) -> Result<LeaseId> {
        self.create_with(None, BTreeMap::new())
    }

    /// Create a lease that expires after `ttl`, if given.
    pub fn create_with(
        &self,
        ttl: Option<Duration>,
        labels: BTreeMap<String, String>,
    ) -> Result<LeaseId> {
        let now = Utc::now();
        let expires_at = match ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| Error::config(format!("invalid lease ttl: {}", e)))?;
                Some(now + ttl)
            }
            None => None,
        };

        let id = LeaseId::generate();
        self.db.update(|tables| {
            tables.leases.insert(
                id.as_str().to_string(),
                LeaseRecord {
                    created_at: now,
                    expires_at,
                    labels,
                    pins: Default::default(),
                },
            );
            Ok(())
        })?;

        debug!(lease = %id, expires_at = ?expires_at, "created lease");
        Ok(id)
    }

    /// Pin `resource` to a live lease.
    pub fn add_pin(&self, id: &LeaseId, resource: Resource) -> Result<()> {
        let now = Utc::now();
        self.db.update(|tables| {
            let lease = tables
                .leases
                .get_mut(id.as_str())
                .filter(|lease| !lease.is_expired(now))
                .ok_or_else(|| Error::not_found("lease", id.as_str()))?;
            lease.pins.insert(resource.clone());
            Ok(())
        })?;

        debug!(lease = %id, resource = %resource, "pinned resource");
        Ok(())
    }

    /// Unpin `resource`, returning whether it was pinned.
    pub fn remove_pin(&self, id: &LeaseId, resource: &Resource) -> Result<bool> {
        self.db.update(|tables| {
            let lease = tables
                .leases
                .get_mut(id.as_str())
                .ok_or_else(|| Error::not_found("lease", id.as_str()))?;
            Ok(lease.pins.remove(resource))
        })
    }

    /// Delete a lease; its pins stop protecting anything.
    pub fn release(&self, id: &LeaseId) -> Result<()> {
        self.db.update(|tables| {
            tables
                .leases
                .remove(id.as_str())
                .map(|_| ())
                .ok_or_else(|| Error::not_found("lease", id.as_str()))
        })?;

        debug!(lease = %id, "released lease");
        Ok(())
    }

    pub fn get(&self, id: &LeaseId) -> Result<Lease> {
        self.db.view(|tables| {
            tables
                .leases
                .get(id.as_str())
                .map(|record| Lease::from_record(id.as_str(), record))
                .ok_or_else(|| Error::not_found("lease", id.as_str()))
        })
    }

    /// All leases, expired ones included until GC removes them.
    pub fn list(&self) -> Result<Vec<Lease>> {
        self.db.view(|tables| {
            Ok(tables
                .leases
                .iter()
                .map(|(id, record)| Lease::from_record(id, record))
                .collect())
        })
    }

    /// Create a lease released when the guard is dropped.
    pub fn guard(&self) -> Result<LeaseGuard<'_>> {
        let id = self.create()?;
        Ok(LeaseGuard {
            manager: self,
            id,
            released: false,
        })
    }
}

/// A lease tied to a scope.
#[derive(Debug)]
pub struct LeaseGuard<'a> {
    manager: &'a LeaseManager,
    id: LeaseId,
    released: bool,
}

impl LeaseGuard<'_> {
    pub fn id(&self) -> &LeaseId {
        &self.id
    }

    pub fn pin(&self, resource: Resource) -> Result<()> {
        self.manager.add_pin(&self.id, resource)
    }

    /// Release now, reporting failure.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.id)
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.manager.release(&self.id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(lease = %self.id, error = %e, "failed to release lease"),
        }
    }
}
