//! Blacklist registry: time-bounded or permanent suppression of instances.
//!
//! Single writer, many readers. Bounded at `max_entries`; when full, the
//! entry nearest to expiry is evicted — never a permanent one. A
//! `max_entries` of zero disables blacklisting entirely while the scheduler
//! keeps functioning. Expired entries are dropped by the periodic sweep and
//! opportunistically at selection time.

use crate::error::ErrorCode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// One suppression entry. `permanent` implies no expiry.
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub instance_id: String,
    pub reason: ErrorCode,
    pub blacklisted_at: Instant,
    /// `None` for permanent entries.
    pub expires_at: Option<Instant>,
    pub permanent: bool,
}

impl BlacklistEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => !self.permanent && now >= expires_at,
            None => false,
        }
    }
}

/// Registry of suppressed instances.
#[derive(Debug)]
pub struct BlacklistRegistry {
    entries: RwLock<HashMap<String, BlacklistEntry>>,
    max_entries: usize,
}

impl BlacklistRegistry {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Whether blacklisting is active at all.
    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }

    /// Insert or overwrite an entry. `duration: None` means permanent.
    /// An existing permanent entry is never downgraded.
    pub fn add(&self, instance_id: &str, reason: ErrorCode, duration: Option<Duration>) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let permanent = duration.is_none();
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(instance_id) {
            if existing.permanent {
                return;
            }
        }

        if !entries.contains_key(instance_id) && entries.len() >= self.max_entries {
            // Evict the entry nearest to expiry; permanents are untouchable.
            let victim = entries
                .values()
                .filter(|e| !e.permanent)
                .min_by_key(|e| e.expires_at)
                .map(|e| e.instance_id.clone());
            match victim {
                Some(id) => {
                    entries.remove(&id);
                }
                None => {
                    tracing::warn!(
                        instance = instance_id,
                        "blacklist full of permanent entries, dropping new entry"
                    );
                    return;
                }
            }
        }

        tracing::info!(
            instance = instance_id,
            code = reason.0,
            permanent,
            duration_ms = duration.map(|d| d.as_millis() as u64),
            "instance blacklisted"
        );
        entries.insert(
            instance_id.to_string(),
            BlacklistEntry {
                instance_id: instance_id.to_string(),
                reason,
                blacklisted_at: now,
                expires_at: duration.map(|d| now + d),
                permanent,
            },
        );
    }

    pub fn is_blacklisted(&self, instance_id: &str, now: Instant) -> bool {
        self.entries
            .read()
            .get(instance_id)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn remove(&self, instance_id: &str) -> bool {
        self.entries.write().remove(instance_id).is_some()
    }

    pub fn list(&self) -> Vec<BlacklistEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop expired non-permanent entries. Returns how many were removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}
