//! Identity pool: mutually exclusive test accounts, partitioned by role.
//!
//! Allocation correctness rests on the `Available -> Reserved` flip alone,
//! which happens under one lock acquisition with no await in between.

use crate::error::{HarnessError, HarnessResult};
use campus_common::{IdentityConfig, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(u64);

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "identity-{}", self.0)
    }
}

/// Session tokens extracted after a successful login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access: String,
    pub refresh: String,
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    Available,
    Reserved,
    /// Returned to the pool; a caller's copy ends in this state.
    Released,
}

/// One test account. Callers hold snapshots; the pool holds the truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub role: Role,
    pub email: String,
    pub password: String,
    pub tokens: Option<SessionTokens>,
    pub state: IdentityState,
    pub reserved_by: Option<String>,
    /// Reservation generation. A copy only acts on the pool while its lease
    /// matches the stored one.
    pub lease: u64,
    /// Created on demand rather than seeded.
    pub synthesized: bool,
}

/// Per-role occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStats {
    pub total: usize,
    pub available: usize,
    pub reserved: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    records: HashMap<Role, Vec<IdentityRecord>>,
    next_id: u64,
    next_lease: u64,
}

impl PoolInner {
    fn insert(&mut self, role: Role, email: String, password: String, synthesized: bool) -> &mut IdentityRecord {
        let id = IdentityId(self.next_id);
        self.next_id += 1;
        let records = self.records.entry(role).or_default();
        records.push(IdentityRecord {
            id,
            role,
            email,
            password,
            tokens: None,
            state: IdentityState::Available,
            reserved_by: None,
            lease: 0,
            synthesized,
        });
        let last = records.len() - 1;
        &mut records[last]
    }

    fn issue_lease(&mut self) -> u64 {
        self.next_lease += 1;
        self.next_lease
    }

    /// The stored record `copy` was taken from, if that reservation is still live.
    fn live_lease_mut(&mut self, copy: &IdentityRecord) -> Option<&mut IdentityRecord> {
        self.find_mut(copy.id)
            .filter(|stored| stored.state == IdentityState::Reserved && stored.lease == copy.lease)
    }

    fn find_mut(&mut self, id: IdentityId) -> Option<&mut IdentityRecord> {
        self.records
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|record| record.id == id)
    }

    fn email_taken(&self, email: &str) -> bool {
        self.records
            .values()
            .flatten()
            .any(|record| record.email.eq_ignore_ascii_case(email))
    }
}

/// Process-scoped registry of test identities.
#[derive(Debug)]
pub struct IdentityPool {
    inner: Mutex<PoolInner>,
    email_domain: String,
    default_password: String,
}

impl IdentityPool {
    /// Empty pool; every acquisition synthesizes until records are returned.
    pub fn new(email_domain: impl Into<String>, default_password: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            email_domain: email_domain.into(),
            default_password: default_password.into(),
        }
    }

    /// Pool seeded with the configured accounts.
    pub fn from_config(config: &IdentityConfig) -> Self {
        let pool = Self::new(config.email_domain.clone(), config.default_password.clone());
        {
            let mut inner = pool.lock();
            for seed in &config.seed {
                if inner.email_taken(&seed.email) {
                    debug!(email = %seed.email, "Skipping duplicate seed account");
                    continue;
                }
                inner.insert(seed.role, seed.email.clone(), seed.password.clone(), false);
            }
        }
        pool
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve an available identity of `role` for `test_id`, growing the pool if none is free.
    pub fn acquire(&self, role: Role, test_id: &str) -> IdentityRecord {
        let mut inner = self.lock();
        let lease = inner.issue_lease();

        let free = inner
            .records
            .get_mut(&role)
            .and_then(|records| records.iter_mut().find(|r| r.state == IdentityState::Available));
        if let Some(record) = free {
            record.state = IdentityState::Reserved;
            record.reserved_by = Some(test_id.to_string());
            record.lease = lease;
            debug!(test_id, %role, email = %record.email, lease, "Identity reserved");
            return record.clone();
        }

        let email = loop {
            let candidate = synthesized_email(role, &self.email_domain);
            if !inner.email_taken(&candidate) {
                break candidate;
            }
        };
        let record = inner.insert(role, email, self.default_password.clone(), true);
        record.state = IdentityState::Reserved;
        record.reserved_by = Some(test_id.to_string());
        record.lease = lease;
        info!(test_id, %role, email = %record.email, "Identity synthesized");
        record.clone()
    }

    /// Return a reserved identity. Releasing anything else, including a copy
    /// from an earlier reservation of the same record, is a no-op.
    ///
    /// Returns whether a reservation was actually cleared.
    pub fn release(&self, record: &IdentityRecord) -> bool {
        let mut inner = self.lock();
        let Some(stored) = inner.live_lease_mut(record) else {
            debug!(id = %record.id, lease = record.lease, "Ignoring release of a lapsed reservation");
            return false;
        };
        debug!(
            test_id = stored.reserved_by.as_deref().unwrap_or(""),
            email = %stored.email,
            "Identity released"
        );
        stored.tokens = None;
        stored.reserved_by = None;
        stored.state = IdentityState::Available;
        true
    }

    /// Store session tokens on the reservation `record` was handed out under.
    pub fn attach_tokens(&self, record: &IdentityRecord, tokens: SessionTokens) -> HarnessResult<IdentityRecord> {
        let mut inner = self.lock();
        match inner.live_lease_mut(record) {
            Some(stored) => {
                stored.tokens = Some(tokens);
                Ok(stored.clone())
            }
            None => Err(HarnessError::UnknownIdentity(record.id.to_string())),
        }
    }

    pub fn get(&self, id: IdentityId) -> Option<IdentityRecord> {
        self.lock().find_mut(id).map(|record| record.clone())
    }

    /// Identities currently reserved by `test_id`.
    pub fn reserved_by(&self, test_id: &str) -> Vec<IdentityRecord> {
        self.lock()
            .records
            .values()
            .flatten()
            .filter(|r| r.state == IdentityState::Reserved && r.reserved_by.as_deref() == Some(test_id))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BTreeMap<Role, RoleStats> {
        let inner = self.lock();
        let mut stats = BTreeMap::new();
        for (role, records) in &inner.records {
            let entry: &mut RoleStats = stats.entry(*role).or_default();
            for record in records {
                entry.total += 1;
                match record.state {
                    IdentityState::Reserved => entry.reserved += 1,
                    IdentityState::Available | IdentityState::Released => entry.available += 1,
                }
            }
        }
        stats
    }
}

fn synthesized_email(role: Role, domain: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}@{}", role, &suffix[..8], domain)
}
