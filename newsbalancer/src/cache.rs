//! Result cache and in-flight registry.
//!
//! Both maps live in one struct so the orchestrator can check the cache and
//! claim a fingerprint under a single lock.

use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::article::Fingerprint;
use crate::llm::PerspectiveResult;
use crate::storage::CompositeScore;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub composite: CompositeScore,
    pub results: Vec<PerspectiveResult>,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

pub struct ResultCache {
    entries: HashMap<Fingerprint, CacheEntry>,
    in_flight: HashSet<Fingerprint>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashSet::new(),
            ttl,
        }
    }

    pub fn lookup(&mut self, fingerprint: &Fingerprint) -> Option<&CacheEntry> {
        self.lookup_at(fingerprint, Instant::now())
    }

    /// Unexpired entry for `fingerprint`. Expired entries are evicted on the way.
    pub fn lookup_at(&mut self, fingerprint: &Fingerprint, now: Instant) -> Option<&CacheEntry> {
        let expired = self
            .entries
            .get(fingerprint)
            .map(|e| e.is_expired(now))
            .unwrap_or(false);
        if expired {
            debug!(fingerprint = fingerprint.short(), "cache entry expired");
            self.entries.remove(fingerprint);
        }

        match self.entries.get(fingerprint) {
            Some(entry) => {
                counter!("newsbalancer_cache_hits_total").increment(1);
                Some(entry)
            }
            None => {
                counter!("newsbalancer_cache_misses_total").increment(1);
                None
            }
        }
    }

    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.in_flight.contains(fingerprint)
    }

    /// Register a job for `fingerprint`. False when one is already running.
    pub fn try_claim(&mut self, fingerprint: &Fingerprint) -> bool {
        self.in_flight.insert(fingerprint.clone())
    }

    pub fn release(&mut self, fingerprint: &Fingerprint) {
        self.in_flight.remove(fingerprint);
    }

    pub fn insert(&mut self, fingerprint: Fingerprint, composite: CompositeScore, results: Vec<PerspectiveResult>) {
        self.insert_at(fingerprint, composite, results, Instant::now());
    }

    pub fn insert_at(
        &mut self,
        fingerprint: Fingerprint,
        composite: CompositeScore,
        results: Vec<PerspectiveResult>,
        now: Instant,
    ) {
        self.entries.insert(
            fingerprint,
            CacheEntry {
                composite,
                results,
                inserted_at: now,
                ttl: self.ttl,
            },
        );
    }

    /// Drop every entry computed under another perspective config version.
    /// Returns how many were removed.
    pub fn retain_version(&mut self, config_version: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.composite.config_version == config_version);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
