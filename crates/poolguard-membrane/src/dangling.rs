//! Dangling-pointer detection through shadow pages.
//!
//! Every heap object handed to the program lives at a *shadow* address: an
//! alias mapping of the slab page(s) that hold its canonical cell. Freeing the
//! object protects that alias while the canonical cell goes back to the slab,
//! so a stale pointer faults on its next access while the physical memory is
//! reused through other aliases.
//!
//! Shadows are grouped by the canonical page run they alias. A run keeps at
//! most [`ShadowPolicy::max_protected`] protected shadows; past that the
//! oldest protected one is recycled for the next object.
//!
//! A protected shadow that faulted can be *exposed*: unprotected so the
//! faulting access completes, but never handed out again until it is
//! recycled like a protected one.
//!
//! The detector also keeps a record of every freed heap object so that a
//! later check or free touching it is attributed to the right allocation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::ShadowPolicy;
use crate::page::{PageError, PageManager, PageRun};
use crate::registry::{ObjectClass, ObjectSpan, Provenance};

/// Canonical page run a shadow aliases: `(first page, page count)`.
type RunKey = (usize, usize);

/// State of one alias mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// The public address of a live object.
    InUse,
    /// Belonged to a freed object; every access faults.
    Protected,
    /// Belonged to a freed object and was unprotected after a reported fault.
    Exposed,
    /// Accessible and unused.
    Free,
}

#[derive(Debug, Clone, Copy)]
struct Shadow {
    addr: usize,
    state: ShadowState,
    stamp: u64,
}

#[derive(Debug, Clone, Copy)]
struct LiveShadow {
    canonical: usize,
    key: RunKey,
    alias: usize,
}

/// How [`DanglingDetector::shadow`] obtained the alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowSource {
    Reused,
    Recycled,
    Created,
}

/// Retained bounds and provenance of a freed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreedRecord {
    pub span: ObjectSpan,
    pub class: ObjectClass,
    pub pool: Option<u32>,
    pub provenance: Option<Provenance>,
}

/// Shadow mappings and freed-object records of one runtime.
pub struct DanglingDetector {
    pages: Arc<PageManager>,
    policy: ShadowPolicy,
    sets: HashMap<RunKey, Vec<Shadow>>,
    by_alias: BTreeMap<usize, RunKey>,
    live: HashMap<usize, LiveShadow>,
    freed: BTreeMap<usize, FreedRecord>,
    stamp: u64,
    protect_failures: u64,
}

impl DanglingDetector {
    #[must_use]
    pub fn new(pages: Arc<PageManager>, policy: ShadowPolicy) -> Self {
        Self {
            pages,
            policy,
            sets: HashMap::new(),
            by_alias: BTreeMap::new(),
            live: HashMap::new(),
            freed: BTreeMap::new(),
            stamp: 0,
            protect_failures: 0,
        }
    }

    fn run_key(&self, canonical: usize, len: usize) -> RunKey {
        let page = self.pages.page_size();
        let first = canonical - canonical % page;
        let end = canonical.saturating_add(len.max(1));
        (first, (end - first).div_ceil(page))
    }

    fn run_bytes(&self, key: RunKey) -> usize {
        key.1 * self.pages.page_size()
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Give the object at `canonical` a public shadow address.
    pub fn shadow(
        &mut self,
        canonical: usize,
        len: usize,
    ) -> Result<(usize, ShadowSource), PageError> {
        let key = self.run_key(canonical, len);
        let offset = canonical - key.0;
        let run_len = self.run_bytes(key);
        let stamp = self.next_stamp();
        let set = self.sets.entry(key).or_default();

        let oldest = |set: &[Shadow], pick: fn(ShadowState) -> bool| {
            set.iter()
                .enumerate()
                .filter(|(_, s)| pick(s.state))
                .min_by_key(|(_, s)| s.stamp)
                .map(|(i, _)| i)
        };
        let retired =
            |state: ShadowState| matches!(state, ShadowState::Protected | ShadowState::Exposed);

        let (slot, source) = if let Some(i) = oldest(set, |s| s == ShadowState::Free) {
            (i, ShadowSource::Reused)
        } else if set.iter().filter(|s| retired(s.state)).count() >= self.policy.max_protected
            && let Some(i) = oldest(set, retired)
        {
            self.pages.provider().unprotect(set[i].addr, run_len)?;
            let alias = ObjectSpan::new(set[i].addr, run_len);
            drop_freed_within(&mut self.freed, alias);
            (i, ShadowSource::Recycled)
        } else {
            let addr = self.pages.provider().map_alias(key.0, run_len)?;
            set.push(Shadow {
                addr,
                state: ShadowState::Free,
                stamp,
            });
            self.by_alias.insert(addr, key);
            (set.len() - 1, ShadowSource::Created)
        };

        let shadow = &mut set[slot];
        shadow.state = ShadowState::InUse;
        shadow.stamp = stamp;
        let public = shadow.addr + offset;
        self.live.insert(
            public,
            LiveShadow {
                canonical,
                key,
                alias: shadow.addr,
            },
        );
        Ok((public, source))
    }

    /// Protect the shadow behind `public` and return the canonical address to
    /// free. Addresses that were never shadowed come back unchanged.
    pub fn unshadow(&mut self, public: usize) -> usize {
        let Some(live) = self.live.remove(&public) else {
            return public;
        };
        let run_len = self.run_bytes(live.key);
        let protected = self.pages.provider().protect(live.alias, run_len).is_ok();
        if !protected {
            self.protect_failures += 1;
        }
        let stamp = self.next_stamp();
        if let Some(shadow) = self
            .sets
            .get_mut(&live.key)
            .and_then(|set| set.iter_mut().find(|s| s.addr == live.alias))
        {
            shadow.state = if protected {
                ShadowState::Protected
            } else {
                ShadowState::Free
            };
            shadow.stamp = stamp;
        }
        live.canonical
    }

    /// Canonical address of a live shadowed object, if `public` is one.
    #[must_use]
    pub fn canonical(&self, public: usize) -> Option<usize> {
        self.live.get(&public).map(|l| l.canonical)
    }

    /// State of the shadow mapping covering `addr`.
    #[must_use]
    pub fn shadow_state(&self, addr: usize) -> Option<ShadowState> {
        let (&alias, &key) = self.by_alias.range(..=addr).next_back()?;
        if addr - alias >= self.run_bytes(key) {
            return None;
        }
        self.sets
            .get(&key)?
            .iter()
            .find(|s| s.addr == alias)
            .map(|s| s.state)
    }

    #[must_use]
    pub fn is_protected(&self, addr: usize) -> bool {
        self.shadow_state(addr) == Some(ShadowState::Protected)
    }

    /// Does `addr` fall in the shadow of a freed object, protected or exposed?
    #[must_use]
    pub fn is_retired(&self, addr: usize) -> bool {
        matches!(
            self.shadow_state(addr),
            Some(ShadowState::Protected | ShadowState::Exposed)
        )
    }

    /// Unprotect the protected shadow covering `addr` so a faulting access
    /// can complete. Returns `false` when `addr` is not in a protected shadow.
    pub fn expose(&mut self, addr: usize) -> Result<bool, PageError> {
        let Some((&alias, &key)) = self.by_alias.range(..=addr).next_back() else {
            return Ok(false);
        };
        let run_len = self.run_bytes(key);
        if addr - alias >= run_len {
            return Ok(false);
        }
        let Some(shadow) = self
            .sets
            .get_mut(&key)
            .and_then(|set| set.iter_mut().find(|s| s.addr == alias))
        else {
            return Ok(false);
        };
        if shadow.state != ShadowState::Protected {
            return Ok(false);
        }
        self.pages.provider().unprotect(alias, run_len)?;
        shadow.state = ShadowState::Exposed;
        Ok(true)
    }

    /// Number of shadow mappings currently held.
    #[must_use]
    pub fn shadow_count(&self) -> usize {
        self.by_alias.len()
    }

    #[must_use]
    pub fn protect_failures(&self) -> u64 {
        self.protect_failures
    }

    /// Unmap every shadow of canonical pages inside `run`.
    pub fn release_run(&mut self, run: PageRun) {
        let span = ObjectSpan::new(run.base, run.len_bytes(self.pages.page_size()));
        let keys: Vec<RunKey> = self
            .sets
            .keys()
            .copied()
            .filter(|key| span.contains(key.0))
            .collect();
        for key in keys {
            let Some(set) = self.sets.remove(&key) else {
                continue;
            };
            let run_len = self.run_bytes(key);
            for shadow in set {
                self.by_alias.remove(&shadow.addr);
                drop_freed_within(&mut self.freed, ObjectSpan::new(shadow.addr, run_len));
                let _ = self.pages.provider().unmap(shadow.addr, run_len);
            }
            self.live.retain(|_, l| l.key != key);
        }
        drop_freed_within(&mut self.freed, span);
    }

    /// Remember a freed object for later attribution.
    pub fn record_freed(&mut self, record: FreedRecord) {
        if record.span.is_empty() {
            return;
        }
        drop_freed_within(&mut self.freed, record.span);
        self.freed.insert(record.span.start, record);
    }

    /// Freed record covering `addr`.
    #[must_use]
    pub fn freed_at(&self, addr: usize) -> Option<&FreedRecord> {
        let (_, rec) = self.freed.range(..=addr).next_back()?;
        rec.span.contains(addr).then_some(rec)
    }

    /// Freed record starting exactly at `addr`.
    #[must_use]
    pub fn freed_starting_at(&self, addr: usize) -> Option<&FreedRecord> {
        self.freed.get(&addr)
    }

    /// Forget freed records overlapping a newly registered object.
    pub fn evict_freed(&mut self, span: ObjectSpan) {
        drop_freed_within(&mut self.freed, span);
    }

    #[must_use]
    pub fn freed_count(&self) -> usize {
        self.freed.len()
    }

    /// Forget every freed record belonging to `pool`.
    pub fn forget_pool(&mut self, pool: u32) {
        self.freed.retain(|_, r| r.pool != Some(pool));
    }
}

fn drop_freed_within(freed: &mut BTreeMap<usize, FreedRecord>, span: ObjectSpan) {
    let doomed: Vec<usize> = freed
        .range(..span.end)
        .rev()
        .take_while(|(_, r)| r.span.end > span.start || r.span.start >= span.start)
        .filter(|(_, r)| r.span.overlaps(span))
        .map(|(&start, _)| start)
        .collect();
    for start in doomed {
        freed.remove(&start);
    }
}

impl Drop for DanglingDetector {
    fn drop(&mut self) {
        let page = self.pages.page_size();
        for (key, set) in self.sets.drain() {
            for shadow in set {
                let _ = self.pages.provider().unmap(shadow.addr, key.1 * page);
            }
        }
    }
}
