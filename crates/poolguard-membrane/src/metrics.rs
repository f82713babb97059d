//! Atomic counters for runtime observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-runtime operation counters.
#[derive(Debug)]
pub struct RuntimeMetrics {
    pub pools_created: AtomicU64,
    pub pools_destroyed: AtomicU64,
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    pub registrations: AtomicU64,
    pub unregistrations: AtomicU64,
    /// Checks answered by the exact (statically sized) fast path.
    pub fast_checks: AtomicU64,
    /// Checks that needed a registry lookup.
    pub registry_checks: AtomicU64,
    pub cache_hits: AtomicU64,
    pub rewrites: AtomicU64,
    /// Rewritten pointers that came back in bounds.
    pub token_reentries: AtomicU64,
    pub violations: AtomicU64,
    pub shadows_created: AtomicU64,
    pub shadows_recycled: AtomicU64,
    pub shadow_failures: AtomicU64,
    /// Dangling faults resumed by exposing the stale shadow.
    pub faults_resumed: AtomicU64,
}

impl RuntimeMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pools_created: AtomicU64::new(0),
            pools_destroyed: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            unregistrations: AtomicU64::new(0),
            fast_checks: AtomicU64::new(0),
            registry_checks: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            rewrites: AtomicU64::new(0),
            token_reentries: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            shadows_created: AtomicU64::new(0),
            shadows_recycled: AtomicU64::new(0),
            shadow_failures: AtomicU64::new(0),
            faults_resumed: AtomicU64::new(0),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pools_created: Self::get(&self.pools_created),
            pools_destroyed: Self::get(&self.pools_destroyed),
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            registrations: Self::get(&self.registrations),
            unregistrations: Self::get(&self.unregistrations),
            fast_checks: Self::get(&self.fast_checks),
            registry_checks: Self::get(&self.registry_checks),
            cache_hits: Self::get(&self.cache_hits),
            rewrites: Self::get(&self.rewrites),
            token_reentries: Self::get(&self.token_reentries),
            violations: Self::get(&self.violations),
            shadows_created: Self::get(&self.shadows_created),
            shadows_recycled: Self::get(&self.shadows_recycled),
            shadow_failures: Self::get(&self.shadow_failures),
            faults_resumed: Self::get(&self.faults_resumed),
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pools_created: u64,
    pub pools_destroyed: u64,
    pub allocations: u64,
    pub frees: u64,
    pub registrations: u64,
    pub unregistrations: u64,
    pub fast_checks: u64,
    pub registry_checks: u64,
    pub cache_hits: u64,
    pub rewrites: u64,
    pub token_reentries: u64,
    pub violations: u64,
    pub shadows_created: u64,
    pub shadows_recycled: u64,
    pub shadow_failures: u64,
    pub faults_resumed: u64,
}

impl MetricsSnapshot {
    /// Share of registry checks answered from the object cache, in permille.
    #[must_use]
    pub fn cache_hit_permille(&self) -> u64 {
        if self.registry_checks == 0 {
            return 0;
        }
        self.cache_hits.saturating_mul(1000) / self.registry_checks
    }
}
