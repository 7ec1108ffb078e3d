//! Visitor, session and client identifiers
//!
//! Records are written through to a [`ScopedStorage`] and mirrored into an
//! in-process map. When storage is unavailable the map keeps identity stable
//! for the lifetime of the process, but nothing survives a restart.

mod storage;

pub use storage::{MemoryStorage, ScopedStorage, SqliteStorage};

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::IdentityPolicy;
use crate::types::{IdentityKind, IdentityRecord, IdentitySnapshot, Ids};

/// Generate a new identifier: base36 epoch millis, a dot, base36 random.
pub fn generate_id(now_ms: i64) -> String {
    let random = uuid::Uuid::new_v4().as_u128() as u64;
    format!("{}.{}", to_base36(now_ms.max(0) as u64), to_base36(random))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Identity store backed by scoped storage with an in-memory fallback.
pub struct IdentityStore {
    storage: Box<dyn ScopedStorage>,
    fallback: HashMap<&'static str, String>,
    policy: IdentityPolicy,
    clock: Arc<dyn Clock>,
    referrer: Option<String>,
}

impl IdentityStore {
    pub fn new(storage: Box<dyn ScopedStorage>, policy: IdentityPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            fallback: HashMap::new(),
            policy,
            clock,
            referrer: None,
        }
    }

    /// Referrer recorded as `origReferrer` on newly issued identifiers.
    pub fn with_referrer(mut self, referrer: Option<String>) -> Self {
        self.referrer = referrer.filter(|r| !r.is_empty());
        self
    }

    pub fn set_referrer(&mut self, referrer: Option<String>) {
        self.referrer = referrer.filter(|r| !r.is_empty());
    }

    fn ttl_ms(&self, kind: IdentityKind) -> Option<i64> {
        let secs = match kind {
            IdentityKind::Vid => self.policy.vid_ttl_secs,
            IdentityKind::Sid => self.policy.sid_ttl_secs,
            IdentityKind::Cid => self.policy.cid_ttl_secs,
        };
        secs.filter(|s| *s > 0).map(|s| (s as i64).saturating_mul(1000))
    }

    /// Return the record for `kind`, issuing a new one on miss, decode failure
    /// or expiry. Hits come back with `is_new = false` and a refreshed
    /// `last_seen`.
    pub fn get_or_create(&mut self, kind: IdentityKind) -> IdentityRecord {
        let now = self.clock.now_ms();

        let record = match self.load(kind) {
            Some(existing) if !self.is_expired(kind, &existing, now) => IdentityRecord {
                last_seen: now,
                is_new: false,
                ..existing
            },
            stale => {
                if let Some(stale) = stale {
                    tracing::debug!(kind = %kind, id = %stale.id, "Identity expired");
                }
                let record = IdentityRecord {
                    id: generate_id(now),
                    created_at: now,
                    last_seen: now,
                    orig_referrer: self.referrer.clone(),
                    is_new: true,
                };
                tracing::debug!(kind = %kind, id = %record.id, "New identity issued");
                record
            }
        };

        self.store(kind, &record);
        record
    }

    /// Initialize every identity kind.
    pub fn init_ids(&mut self) -> IdentitySnapshot {
        let mut snapshot = IdentitySnapshot::default();
        for kind in IdentityKind::ALL {
            snapshot.set(kind, self.get_or_create(kind));
        }
        snapshot
    }

    /// Stored record without creating or refreshing it.
    pub fn get(&self, kind: IdentityKind) -> Option<IdentityRecord> {
        self.load(kind)
    }

    /// Stored records for every kind, as sent in `properties.zar`.
    pub fn snapshot(&self) -> IdentitySnapshot {
        let mut snapshot = IdentitySnapshot::default();
        for kind in IdentityKind::ALL {
            if let Some(record) = self.load(kind) {
                snapshot.set(kind, record);
            }
        }
        snapshot
    }

    pub fn ids(&self) -> Ids {
        Ids {
            vid: self.load(IdentityKind::Vid).map(|r| r.id),
            sid: self.load(IdentityKind::Sid).map(|r| r.id),
            cid: self.load(IdentityKind::Cid).map(|r| r.id),
        }
    }

    /// Forget the record for `kind`; the next access issues a new one.
    pub fn reset(&mut self, kind: IdentityKind) {
        let key = kind.storage_key();
        if let Err(e) = self.storage.remove(key) {
            tracing::warn!(kind = %kind, error = %e, "Failed to remove identity from storage");
        }
        self.fallback.remove(key);
    }

    /// Reconcile a server-issued identifier. Returns true when the stored id changed.
    pub fn adopt(&mut self, kind: IdentityKind, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let now = self.clock.now_ms();
        let record = match self.load(kind) {
            Some(existing) if existing.id == id => return false,
            Some(existing) => IdentityRecord {
                id: id.to_string(),
                last_seen: now,
                is_new: false,
                ..existing
            },
            None => IdentityRecord {
                id: id.to_string(),
                created_at: now,
                last_seen: now,
                orig_referrer: self.referrer.clone(),
                is_new: false,
            },
        };
        tracing::debug!(kind = %kind, id = %id, "Adopted server identity");
        self.store(kind, &record);
        true
    }

    fn is_expired(&self, kind: IdentityKind, record: &IdentityRecord, now: i64) -> bool {
        let Some(ttl) = self.ttl_ms(kind) else {
            return false;
        };
        let seen = if record.last_seen > 0 {
            record.last_seen
        } else {
            record.created_at
        };
        now.saturating_sub(seen) > ttl
    }

    fn load(&self, kind: IdentityKind) -> Option<IdentityRecord> {
        let key = kind.storage_key();
        let raw = match self.storage.get(key) {
            Ok(Some(raw)) => Some(raw),
            Ok(None) => self.fallback.get(key).cloned(),
            Err(e) => {
                tracing::debug!(kind = %kind, error = %e, "Storage read failed, using fallback");
                self.fallback.get(key).cloned()
            }
        }?;

        match serde_json::from_str::<IdentityRecord>(&raw) {
            Ok(record) if !record.id.is_empty() => Some(record),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(kind = %kind, error = %e, "Discarding undecodable identity");
                None
            }
        }
    }

    fn store(&mut self, kind: IdentityKind, record: &IdentityRecord) {
        let key = kind.storage_key();
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Failed to encode identity");
                return;
            }
        };
        if let Err(e) = self.storage.set(key, &raw) {
            tracing::debug!(kind = %kind, error = %e, "Storage write failed, keeping in memory");
        }
        self.fallback.insert(key, raw);
    }
}
