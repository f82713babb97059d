//! The runtime context: pools, registries, detector, tokens and reporting.
//!
//! Every entry point goes through a [`Runtime`]. Each pool pairs a
//! [`SlabPool`] with the [`Registry`] of objects it holds and sits behind its
//! own mutex. Objects that belong to no pool go to the external registry.
//!
//! Lock order: pool table, pool, external registry, detector, token table,
//! page manager. The event log and the violation log are leaves.

use std::ffi::CStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::dangling::{DanglingDetector, FreedRecord, ShadowSource, ShadowState};
use crate::log::{Event, EventLog, LogLevel, RuntimeLogRecord};
use crate::metrics::{MetricsSnapshot, RuntimeMetrics};
use crate::oob::TokenTable;
use crate::page::{MmapPages, PageError, PageManager, PageProvider, copy_bytes, zero_bytes};
use crate::pool::{AllocError, PoolStats, SlabPool, StackMark};
use crate::registry::{
    ObjectClass, ObjectMeta, ObjectRef, ObjectSpan, Provenance, RegisterOutcome, Registry,
    SourceLoc,
};
use crate::report::{Violation, ViolationKind, ViolationLog};

/// Handle of a pool created by [`Runtime::create_pool`].
///
/// The raw value is the pool's slot index plus one, so zero never names a
/// pool and can stand for "no pool" across the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(u32);

impl PoolId {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    const fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

/// Errors that are not memory-safety violations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown pool handle {0}")]
    UnknownPool(u32),
    #[error("too many pools")]
    PoolTableFull,
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("violation log: {0}")]
    Log(#[from] std::io::Error),
}

/// Allocator and objects of one pool.
pub struct PoolState {
    pub allocator: SlabPool,
    pub objects: Registry,
    /// Stack objects in allocation order, popped by [`Runtime::stack_release`].
    stack_objects: Vec<usize>,
}

/// Program counter and source location of an allocation or free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSite {
    pub pc: usize,
    pub source: Option<SourceLoc>,
}

impl CallSite {
    #[must_use]
    pub fn new(pc: usize) -> Self {
        Self { pc, source: None }
    }

    #[must_use]
    pub fn with_source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source = Some(SourceLoc::new(file, line));
        self
    }
}

/// Result of [`Runtime::free`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The allocation was returned to its slab.
    Freed { bytes: usize },
    /// Null pointer, or checks are off.
    Ignored,
    /// Invalid or double free; nothing was released.
    Rejected(Box<Violation>),
}

/// Promoted-stack position plus the stack objects registered before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMark {
    stack: StackMark,
    objects: usize,
}

impl FrameMark {
    /// Flatten into `[stack depth, stack top, object count]` for callers that
    /// keep marks outside Rust.
    #[must_use]
    pub const fn to_raw(self) -> [usize; 3] {
        let (depth, top) = self.stack.parts();
        [depth, top, self.objects]
    }

    /// Rebuild a mark from [`FrameMark::to_raw`]. A mark that was never
    /// produced by this pool releases at most down to the bottom of the stack.
    #[must_use]
    pub const fn from_raw(raw: [usize; 3]) -> Self {
        Self {
            stack: StackMark::from_parts(raw[0], raw[1]),
            objects: raw[2],
        }
    }
}

/// A memory-safety runtime instance.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pages: Arc<PageManager>,
    pools: RwLock<Vec<Option<Arc<Mutex<PoolState>>>>>,
    external: Mutex<Registry>,
    pub(crate) detector: Mutex<DanglingDetector>,
    pub(crate) tokens: Mutex<TokenTable>,
    violations: ViolationLog,
    events: Mutex<EventLog>,
    pub(crate) metrics: RuntimeMetrics,
    next_alloc_id: AtomicU64,
    next_free_id: AtomicU64,
}

impl Runtime {
    /// Runtime over `mmap`-backed pages.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_provider(config, Box::new(MmapPages::new()))
    }

    pub fn with_provider(
        config: RuntimeConfig,
        provider: Box<dyn PageProvider>,
    ) -> Result<Self, RuntimeError> {
        let tokens = TokenTable::reserve(provider.as_ref(), config.token_region)?;
        let pages = Arc::new(PageManager::new(provider));
        let detector = DanglingDetector::new(Arc::clone(&pages), config.shadow);
        let violations = ViolationLog::open(&config.log)?;
        let events = EventLog::new(config.log_level);
        Ok(Self {
            config,
            pages,
            pools: RwLock::new(Vec::new()),
            external: Mutex::new(Registry::new()),
            detector: Mutex::new(detector),
            tokens: Mutex::new(tokens),
            violations,
            events: Mutex::new(events),
            metrics: RuntimeMetrics::new(),
            next_alloc_id: AtomicU64::new(1),
            next_free_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    pub(crate) fn event(&self, event: Event<'_>, details: impl FnOnce() -> String) {
        self.events.lock().record(event, details);
    }

    fn pool(&self, id: PoolId) -> Result<Arc<Mutex<PoolState>>, RuntimeError> {
        self.pools
            .read()
            .get(id.index())
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(RuntimeError::UnknownPool(id.raw()))
    }

    // ---- pools --------------------------------------------------------------

    /// Create a pool of `node_size`-byte cells (zero is treated as one).
    pub fn create_pool(&self, node_size: usize) -> Result<PoolId, RuntimeError> {
        let state = PoolState {
            allocator: SlabPool::new(node_size, Arc::clone(&self.pages)),
            objects: Registry::new(),
            stack_objects: Vec::new(),
        };
        let id = {
            let mut pools = self.pools.write();
            let raw = u32::try_from(pools.len() + 1).map_err(|_| RuntimeError::PoolTableFull)?;
            pools.push(Some(Arc::new(Mutex::new(state))));
            PoolId(raw)
        };
        RuntimeMetrics::inc(&self.metrics.pools_created);
        self.event(
            Event::new(LogLevel::Debug, "pool_init", "init", "ok").pool(Some(id.raw())),
            || format!("node_size={}", node_size.max(1)),
        );
        Ok(id)
    }

    /// Destroy a pool: release its slabs, forget its objects, unmap their
    /// shadows and drop tokens derived from them.
    pub fn destroy_pool(&self, id: PoolId) -> Result<(), RuntimeError> {
        let state = self
            .pools
            .write()
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(RuntimeError::UnknownPool(id.raw()))?;
        let mut state = state.lock();
        let objects = state.objects.len();
        let runs = state.allocator.destroy();
        state.objects.clear();
        state.stack_objects.clear();
        {
            let mut detector = self.detector.lock();
            for run in &runs {
                detector.release_run(*run);
            }
            detector.forget_pool(id.raw());
        }
        self.tokens.lock().forget_pool(id);
        RuntimeMetrics::inc(&self.metrics.pools_destroyed);
        self.event(
            Event::new(LogLevel::Debug, "pool_destroy", "destroy", "ok").pool(Some(id.raw())),
            || format!("runs={} live_objects={objects}", runs.len()),
        );
        Ok(())
    }

    /// Slab population of a pool.
    pub fn pool_stats(&self, id: PoolId) -> Result<PoolStats, RuntimeError> {
        Ok(self.pool(id)?.lock().allocator.stats())
    }

    /// Element size of `id`.
    pub fn pool_node_size(&self, id: PoolId) -> Result<usize, RuntimeError> {
        Ok(self.pool(id)?.lock().allocator.node_size())
    }

    // ---- allocation ---------------------------------------------------------

    pub fn alloc(&self, pool: PoolId, bytes: usize) -> Result<usize, RuntimeError> {
        self.alloc_at(pool, bytes, &CallSite::default())
    }

    /// Allocate `bytes` and register the result as a heap object.
    ///
    /// With dangling detection on, the returned address is a shadow alias of
    /// the slab cell; if no shadow can be made the canonical cell is returned.
    pub fn alloc_at(
        &self,
        pool: PoolId,
        bytes: usize,
        site: &CallSite,
    ) -> Result<usize, RuntimeError> {
        let state = self.pool(pool)?;
        let mut state = state.lock();
        let canonical = state.allocator.alloc(bytes)?;
        let len = bytes.max(1);
        let public = if self.config.dangling {
            self.shadow(canonical, len)
        } else {
            canonical
        };
        let provenance = Provenance {
            alloc_id: self.next_alloc_id.fetch_add(1, Ordering::Relaxed),
            alloc_pc: site.pc,
            canonical,
            alloc_site: site.source.clone(),
            ..Provenance::default()
        };
        state.objects.register(
            public,
            len,
            ObjectMeta::new(ObjectClass::Heap).with_provenance(provenance),
        );
        drop(state);
        if self.config.dangling {
            self.detector.lock().evict_freed(ObjectSpan::new(public, len));
        }
        RuntimeMetrics::inc(&self.metrics.allocations);
        RuntimeMetrics::inc(&self.metrics.registrations);
        self.event(
            Event::new(LogLevel::Trace, "pool_alloc", "alloc", "ok")
                .pool(Some(pool.raw()))
                .ptr(public)
                .size(bytes),
            || format!("canonical={canonical:#x}"),
        );
        Ok(public)
    }

    fn shadow(&self, canonical: usize, len: usize) -> usize {
        match self.detector.lock().shadow(canonical, len) {
            Ok((public, source)) => {
                match source {
                    ShadowSource::Created => RuntimeMetrics::inc(&self.metrics.shadows_created),
                    ShadowSource::Recycled => RuntimeMetrics::inc(&self.metrics.shadows_recycled),
                    ShadowSource::Reused => {}
                }
                public
            }
            Err(err) => {
                RuntimeMetrics::inc(&self.metrics.shadow_failures);
                self.event(
                    Event::new(LogLevel::Warn, "pool_alloc", "shadow", "unshadowed")
                        .ptr(canonical)
                        .size(len),
                    || err.to_string(),
                );
                canonical
            }
        }
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn calloc(&self, pool: PoolId, count: usize, size: usize) -> Result<usize, RuntimeError> {
        let bytes = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
        let addr = self.alloc(pool, bytes)?;
        zero_bytes(addr, bytes);
        Ok(addr)
    }

    /// Copy `s`, terminator included, into a new object of `pool`.
    pub fn strdup(&self, pool: PoolId, s: &CStr) -> Result<usize, RuntimeError> {
        let bytes = s.to_bytes_with_nul();
        let addr = self.alloc(pool, bytes.len())?;
        copy_bytes(bytes.as_ptr() as usize, addr, bytes.len());
        Ok(addr)
    }

    /// Resize an allocation. A null `ptr` allocates; a zero size frees and
    /// returns null. A `ptr` that is not a live heap object is reported as an
    /// invalid free and yields null.
    ///
    /// Without dangling detection a request that fits the cells already
    /// backing `ptr` resizes the object in place.
    pub fn realloc(&self, pool: PoolId, ptr: usize, bytes: usize) -> Result<usize, RuntimeError> {
        if ptr == 0 {
            return self.alloc(pool, bytes);
        }
        if bytes == 0 {
            self.free(pool, ptr)?;
            return Ok(0);
        }
        let old_len = {
            let state = self.pool(pool)?;
            let mut state = state.lock();
            let old_len = state
                .objects
                .find(ptr)
                .filter(|o| o.span.start == ptr && o.class == ObjectClass::Heap)
                .map(|o| o.span.len());
            if let Some(len) = old_len
                && !self.config.dangling
                && state.allocator.allocation_size(ptr).is_some_and(|cap| bytes <= cap)
                && let Some((_, meta)) = state.objects.unregister(ptr)
            {
                state.objects.register(ptr, bytes, meta);
                drop(state);
                self.event(
                    Event::new(LogLevel::Trace, "pool_realloc", "resize", "in_place")
                        .pool(Some(pool.raw()))
                        .ptr(ptr)
                        .size(bytes),
                    || format!("old_len={len}"),
                );
                return Ok(ptr);
            }
            old_len
        };
        let Some(old_len) = old_len else {
            self.free(pool, ptr)?;
            return Ok(0);
        };
        let new = self.alloc(pool, bytes)?;
        copy_bytes(ptr, new, old_len.min(bytes));
        self.free(pool, ptr)?;
        Ok(new)
    }

    pub fn free(&self, pool: PoolId, ptr: usize) -> Result<FreeOutcome, RuntimeError> {
        self.free_at(pool, ptr, &CallSite::default())
    }

    /// Free a heap object.
    ///
    /// Only the start of a live heap object of `pool` is released. Anything
    /// else is classified as [`ViolationKind::DoubleFree`] or
    /// [`ViolationKind::InvalidFree`], reported, and left alone.
    pub fn free_at(
        &self,
        pool: PoolId,
        ptr: usize,
        site: &CallSite,
    ) -> Result<FreeOutcome, RuntimeError> {
        if ptr == 0 {
            return Ok(FreeOutcome::Ignored);
        }
        let state = self.pool(pool)?;
        let mut state = state.lock();
        let found = state.objects.find(ptr);
        let valid = found.is_some_and(|o| o.span.start == ptr && o.class == ObjectClass::Heap);
        if !valid {
            drop(state);
            if !self.config.mode.checks_enabled() {
                return Ok(FreeOutcome::Ignored);
            }
            let violation = self.classify_free(pool, ptr, found, site);
            self.report(&violation, "pool_free");
            return Ok(FreeOutcome::Rejected(Box::new(violation)));
        }

        let Some((span, meta)) = state.objects.unregister(ptr) else {
            return Ok(FreeOutcome::Ignored);
        };
        let mut provenance = meta.provenance.map(|p| *p).unwrap_or_default();
        provenance.free_id = self.next_free_id.fetch_add(1, Ordering::Relaxed);
        provenance.free_pc = site.pc;
        provenance.free_site = site.source.clone();
        let canonical = if self.config.dangling {
            let mut detector = self.detector.lock();
            let canonical = detector.unshadow(ptr);
            detector.record_freed(FreedRecord {
                span,
                class: ObjectClass::Heap,
                pool: Some(pool.raw()),
                provenance: Some(provenance),
            });
            canonical
        } else if provenance.canonical != 0 {
            provenance.canonical
        } else {
            ptr
        };
        let bytes = state.allocator.free(canonical).unwrap_or(0);
        drop(state);
        RuntimeMetrics::inc(&self.metrics.frees);
        RuntimeMetrics::inc(&self.metrics.unregistrations);
        self.event(
            Event::new(LogLevel::Trace, "pool_free", "free", "ok")
                .pool(Some(pool.raw()))
                .ptr(ptr)
                .size(bytes),
            || format!("canonical={canonical:#x}"),
        );
        Ok(FreeOutcome::Freed { bytes })
    }

    fn classify_free(
        &self,
        pool: PoolId,
        ptr: usize,
        found: Option<ObjectRef>,
        site: &CallSite,
    ) -> Violation {
        let base = |kind| {
            Violation::new(kind, ptr)
                .with_pc(site.pc)
                .with_pool(Some(pool.raw()))
                .with_source(site.source.clone())
        };
        if let Some(obj) = found {
            let v = base(ViolationKind::InvalidFree).with_object(obj.span, Some(obj.class));
            return if obj.class == ObjectClass::Heap {
                v.with_detail("pointer is inside the object, not at its start")
            } else {
                v.with_cwe(590)
                    .with_detail(format!("{} object is not heap memory", obj.class.as_str()))
            };
        }
        let detector = self.detector.lock();
        if let Some(rec) = detector.freed_starting_at(ptr) {
            return base(ViolationKind::DoubleFree)
                .with_object(rec.span, Some(rec.class))
                .with_provenance(rec.provenance.clone());
        }
        if let Some(rec) = detector.freed_at(ptr) {
            return base(ViolationKind::InvalidFree)
                .with_object(rec.span, Some(rec.class))
                .with_provenance(rec.provenance.clone())
                .with_detail("pointer is inside a freed object");
        }
        base(ViolationKind::InvalidFree).with_detail("no object at this address")
    }

    // ---- promoted stack -----------------------------------------------------

    /// Allocate a stack object promoted to the heap and register it.
    pub fn stack_alloc(&self, pool: PoolId, bytes: usize) -> Result<usize, RuntimeError> {
        let state = self.pool(pool)?;
        let mut state = state.lock();
        let addr = state.allocator.stack_alloc(bytes)?;
        state
            .objects
            .register(addr, bytes.max(1), ObjectMeta::new(ObjectClass::Stack));
        state.stack_objects.push(addr);
        RuntimeMetrics::inc(&self.metrics.registrations);
        Ok(addr)
    }

    pub fn stack_mark(&self, pool: PoolId) -> Result<FrameMark, RuntimeError> {
        let state = self.pool(pool)?;
        let state = state.lock();
        Ok(FrameMark {
            stack: state.allocator.stack_mark(),
            objects: state.stack_objects.len(),
        })
    }

    /// Pop the promoted stack back to `mark`, unregistering its objects.
    pub fn stack_release(&self, pool: PoolId, mark: FrameMark) -> Result<(), RuntimeError> {
        let state = self.pool(pool)?;
        let mut state = state.lock();
        let mut released = 0;
        while state.stack_objects.len() > mark.objects {
            let Some(addr) = state.stack_objects.pop() else {
                break;
            };
            if state.objects.unregister(addr).is_some() {
                released += 1;
            }
        }
        state.allocator.stack_release(mark.stack);
        RuntimeMetrics::add(&self.metrics.unregistrations, released);
        Ok(())
    }

    // ---- registration -------------------------------------------------------

    /// Register a heap object of `len` bytes at `start`.
    pub fn register(
        &self,
        pool: Option<PoolId>,
        start: usize,
        len: usize,
    ) -> Result<RegisterOutcome, RuntimeError> {
        self.register_with(pool, start, len, ObjectMeta::new(ObjectClass::Heap))
    }

    pub fn register_stack(
        &self,
        pool: Option<PoolId>,
        start: usize,
        len: usize,
    ) -> Result<RegisterOutcome, RuntimeError> {
        self.register_with(pool, start, len, ObjectMeta::new(ObjectClass::Stack))
    }

    pub fn register_global(
        &self,
        pool: Option<PoolId>,
        start: usize,
        len: usize,
    ) -> Result<RegisterOutcome, RuntimeError> {
        self.register_with(pool, start, len, ObjectMeta::new(ObjectClass::Global))
    }

    /// Register with explicit metadata (debug provenance, completeness).
    ///
    /// `pool == None` registers into the external registry. Null starts and
    /// zero lengths are ignored.
    pub fn register_with(
        &self,
        pool: Option<PoolId>,
        start: usize,
        len: usize,
        meta: ObjectMeta,
    ) -> Result<RegisterOutcome, RuntimeError> {
        let class = meta.class;
        let outcome = match pool {
            Some(id) => self.pool(id)?.lock().objects.register(start, len, meta),
            None => self.external.lock().register(start, len, meta),
        };
        if outcome == RegisterOutcome::Ignored {
            return Ok(outcome);
        }
        if self.config.dangling {
            self.detector.lock().evict_freed(ObjectSpan::new(start, len));
        }
        RuntimeMetrics::inc(&self.metrics.registrations);
        self.event(
            Event::new(LogLevel::Trace, "register", class.as_str(), outcome_label(&outcome))
                .pool(pool.map(PoolId::raw))
                .ptr(start)
                .size(len),
            || format!("{outcome:?}"),
        );
        Ok(outcome)
    }

    /// Remove the object starting at `start`.
    ///
    /// A heap object leaves a freed record behind when dangling detection is
    /// on. Unknown pointers are ignored.
    pub fn unregister(
        &self,
        pool: Option<PoolId>,
        start: usize,
    ) -> Result<Option<ObjectSpan>, RuntimeError> {
        let Some((span, meta)) = self.remove_object(pool, start)? else {
            return Ok(None);
        };
        if self.config.dangling && meta.class == ObjectClass::Heap {
            let mut provenance = meta.provenance.map(|p| *p).unwrap_or_default();
            provenance.free_id = self.next_free_id.fetch_add(1, Ordering::Relaxed);
            self.detector.lock().record_freed(FreedRecord {
                span,
                class: meta.class,
                pool: pool.map(PoolId::raw),
                provenance: Some(provenance),
            });
        }
        Ok(Some(span))
    }

    /// Move a registration after a foreign `realloc`: a null `old` only
    /// registers `new`, a zero `len` only unregisters `old`.
    pub fn reregister(
        &self,
        pool: Option<PoolId>,
        new: usize,
        old: usize,
        len: usize,
    ) -> Result<Option<RegisterOutcome>, RuntimeError> {
        if old != 0 {
            self.unregister(pool, old)?;
        }
        if old != 0 && len == 0 {
            return Ok(None);
        }
        self.register(pool, new, len).map(Some)
    }

    /// Remove a stack object. Never leaves a freed record.
    pub fn unregister_stack(
        &self,
        pool: Option<PoolId>,
        start: usize,
    ) -> Result<Option<ObjectSpan>, RuntimeError> {
        Ok(self.remove_object(pool, start)?.map(|(span, _)| span))
    }

    fn remove_object(
        &self,
        pool: Option<PoolId>,
        start: usize,
    ) -> Result<Option<(ObjectSpan, ObjectMeta)>, RuntimeError> {
        let removed = match pool {
            Some(id) => self.pool(id)?.lock().objects.unregister(start),
            None => self.external.lock().unregister(start),
        };
        if let Some((span, _)) = &removed {
            RuntimeMetrics::inc(&self.metrics.unregistrations);
            self.event(
                Event::new(LogLevel::Trace, "unregister", "unregister", "ok")
                    .pool(pool.map(PoolId::raw))
                    .ptr(start)
                    .size(span.len()),
                String::new,
            );
        }
        Ok(removed)
    }

    // ---- lookups used by the check engine -----------------------------------

    /// Object covering `addr` in `pool`, then in the external registry.
    pub(crate) fn lookup(
        &self,
        pool: Option<PoolId>,
        addr: usize,
    ) -> Result<Option<(ObjectRef, Option<PoolId>)>, RuntimeError> {
        RuntimeMetrics::inc(&self.metrics.registry_checks);
        if let Some(id) = pool {
            let state = self.pool(id)?;
            let mut state = state.lock();
            let hits = state.objects.stats().cache_hits;
            let found = state.objects.find(addr);
            if state.objects.stats().cache_hits > hits {
                RuntimeMetrics::inc(&self.metrics.cache_hits);
            }
            if let Some(obj) = found {
                return Ok(Some((obj, Some(id))));
            }
        }
        let mut external = self.external.lock();
        let hits = external.stats().cache_hits;
        let found = external.find(addr);
        if external.stats().cache_hits > hits {
            RuntimeMetrics::inc(&self.metrics.cache_hits);
        }
        Ok(found.map(|obj| (obj, None)))
    }

    /// Live object near `addr` (within its own length), for attributing raw
    /// out-of-bounds pointers.
    pub(crate) fn nearest(
        &self,
        pool: Option<PoolId>,
        addr: usize,
    ) -> Result<Option<(ObjectRef, Option<PoolId>)>, RuntimeError> {
        let local = match pool {
            Some(id) => self.pool(id)?.lock().objects.nearest(addr),
            None => None,
        };
        let external = self.external.lock().nearest(addr);
        Ok(match (local, external) {
            (Some(l), Some(e)) if e.span.distance(addr) < l.span.distance(addr) => {
                Some((e, None))
            }
            (Some(l), _) => Some((l, pool)),
            (None, Some(e)) => Some((e, None)),
            (None, None) => None,
        })
    }

    /// Provenance of the live object starting at `start`.
    pub(crate) fn provenance(&self, pool: Option<PoolId>, start: usize) -> Option<Provenance> {
        match pool {
            Some(id) => {
                let state = self.pool(id).ok()?;
                let mut state = state.lock();
                state.objects.meta(start).and_then(|m| m.provenance.as_deref().cloned())
            }
            None => self
                .external
                .lock()
                .meta(start)
                .and_then(|m| m.provenance.as_deref().cloned()),
        }
    }

    /// Bounds of the live object covering `addr`, if any.
    pub fn object_at(
        &self,
        pool: Option<PoolId>,
        addr: usize,
    ) -> Result<Option<ObjectSpan>, RuntimeError> {
        Ok(self.lookup(pool, addr)?.map(|(obj, _)| obj.span))
    }

    /// Shadow state of `addr` when it lies in a shadow mapping.
    #[must_use]
    pub fn shadow_state(&self, addr: usize) -> Option<ShadowState> {
        self.detector.lock().shadow_state(addr)
    }

    // ---- reporting ----------------------------------------------------------

    /// Log a violation and apply the terminate policy.
    pub(crate) fn report(&self, violation: &Violation, symbol: &str) {
        RuntimeMetrics::inc(&self.metrics.violations);
        self.violations.record(violation);
        self.event(
            Event::new(LogLevel::Warn, symbol, "violation", violation.kind.as_str())
                .pool(violation.pool)
                .ptr(violation.fault_addr),
            || violation.alert(),
        );
        if self.config.terminates() {
            self.violations.flush();
            std::process::abort();
        }
    }

    /// Recent violations, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.recent()
    }

    #[must_use]
    pub fn violation_count(&self) -> u64 {
        self.violations.count()
    }

    /// JSONL lines of an in-memory violation log.
    #[must_use]
    pub fn violation_log_lines(&self) -> Vec<String> {
        self.violations.memory_lines()
    }

    pub fn flush(&self) {
        self.violations.flush();
    }

    pub fn drain_events(&self) -> Vec<RuntimeLogRecord> {
        self.events.lock().drain()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Bounds of the reserved token region.
    #[must_use]
    pub fn token_region(&self) -> (usize, usize) {
        self.tokens.lock().region()
    }
}

fn outcome_label(outcome: &RegisterOutcome) -> &'static str {
    match outcome {
        RegisterOutcome::Inserted => "inserted",
        RegisterOutcome::Merged(_) => "merged",
        RegisterOutcome::Replaced(_) => "replaced",
        RegisterOutcome::Ignored => "ignored",
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let ids: Vec<PoolId> = self
            .pools
            .get_mut()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(i, _)| u32::try_from(i + 1).ok().and_then(PoolId::from_raw))
            .collect();
        for id in ids {
            let _ = self.destroy_pool(id);
        }
        let (base, len) = self.tokens.get_mut().region();
        let _ = self.pages.provider().unmap(base, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogDestination;

    fn runtime(dangling: bool) -> Runtime {
        Runtime::new(
            RuntimeConfig::new()
                .with_dangling(dangling)
                .with_log(LogDestination::Memory)
                .with_log_level(LogLevel::Trace)
                .with_token_region(1 << 20),
        )
        .expect("runtime")
    }

    #[test]
    fn pool_ids_never_zero() {
        assert!(PoolId::from_raw(0).is_none());
        assert_eq!(PoolId::from_raw(7).map(PoolId::raw), Some(7));
    }

    #[test]
    fn destroyed_pools_reject_calls() {
        let rt = runtime(false);
        let pool = rt.create_pool(16).unwrap();
        rt.alloc(pool, 8).unwrap();
        rt.destroy_pool(pool).unwrap();
        assert!(matches!(rt.alloc(pool, 8), Err(RuntimeError::UnknownPool(_))));
        assert!(matches!(rt.destroy_pool(pool), Err(RuntimeError::UnknownPool(_))));
        assert_eq!(rt.metrics().pools_destroyed, 1);
    }

    #[test]
    fn alloc_registers_heap_object() {
        let rt = runtime(false);
        let pool = rt.create_pool(16).unwrap();
        let p = rt.alloc(pool, 40).unwrap();
        assert_eq!(rt.object_at(Some(pool), p + 39).unwrap(), Some(ObjectSpan::new(p, 40)));
        assert!(matches!(rt.free(pool, p).unwrap(), FreeOutcome::Freed { bytes: 48 }));
        assert_eq!(rt.object_at(Some(pool), p).unwrap(), None);
        let events = rt.drain_events();
        assert!(events.iter().any(|e| e.symbol == "pool_alloc"));
        assert!(events.iter().any(|e| e.symbol == "pool_free"));
    }

    #[test]
    fn calloc_zeroes_and_realloc_copies() {
        let rt = runtime(false);
        let pool = rt.create_pool(8).unwrap();
        let p = rt.calloc(pool, 4, 8).unwrap();
        let q = rt.realloc(pool, p, 64).unwrap();
        assert_ne!(q, 0);
        assert_eq!(rt.object_at(Some(pool), q).unwrap(), Some(ObjectSpan::new(q, 64)));
        assert_eq!(rt.object_at(Some(pool), p).unwrap(), None);
        assert_eq!(rt.realloc(pool, q, 0).unwrap(), 0);
        assert!(matches!(
            rt.calloc(pool, usize::MAX, 2),
            Err(RuntimeError::Alloc(AllocError::SizeOverflow))
        ));
    }

    #[test]
    fn realloc_within_cells_stays_in_place() {
        let rt = runtime(false);
        let pool = rt.create_pool(16).unwrap();
        let p = rt.alloc(pool, 20).unwrap();
        assert_eq!(rt.realloc(pool, p, 32).unwrap(), p);
        assert_eq!(rt.object_at(Some(pool), p + 31).unwrap(), Some(ObjectSpan::new(p, 32)));
        assert_eq!(rt.realloc(pool, p, 8).unwrap(), p);
        assert_eq!(rt.object_at(Some(pool), p + 8).unwrap(), None);
        assert!(matches!(rt.free(pool, p).unwrap(), FreeOutcome::Freed { bytes: 32 }));
    }

    #[test]
    fn frees_of_non_heap_objects_are_invalid() {
        let rt = runtime(false);
        let pool = rt.create_pool(16).unwrap();
        let s = rt.stack_alloc(pool, 24).unwrap();
        let FreeOutcome::Rejected(v) = rt.free(pool, s).unwrap() else {
            panic!("stack free accepted");
        };
        assert_eq!(v.kind, ViolationKind::InvalidFree);
        assert_eq!(v.cwe, 590);
        assert_eq!(rt.violation_count(), 1);
        assert_eq!(rt.violation_log_lines().len(), 1);
    }

    #[test]
    fn stack_release_unregisters_frame_objects() {
        let rt = runtime(false);
        let pool = rt.create_pool(16).unwrap();
        let outer = rt.stack_alloc(pool, 16).unwrap();
        let mark = rt.stack_mark(pool).unwrap();
        let inner = rt.stack_alloc(pool, 32).unwrap();
        assert!(rt.object_at(Some(pool), inner).unwrap().is_some());
        rt.stack_release(pool, mark).unwrap();
        assert!(rt.object_at(Some(pool), inner).unwrap().is_none());
        assert!(rt.object_at(Some(pool), outer).unwrap().is_some());
        assert_eq!(rt.stack_alloc(pool, 8).unwrap(), inner);
    }

    #[test]
    #[allow(unsafe_code)]
    fn strdup_copies_the_terminator_and_registers_the_copy() {
        let rt = runtime(true);
        let pool = rt.create_pool(8).unwrap();
        let copy = rt.strdup(pool, c"poolguard").unwrap();
        let span = rt.object_at(Some(pool), copy).unwrap().unwrap();
        assert_eq!((span.start, span.len()), (copy, 10));
        // SAFETY: `copy` is a live 10-byte allocation.
        let bytes = unsafe { std::slice::from_raw_parts(copy as *const u8, 10) };
        assert_eq!(bytes, b"poolguard\0");
        assert!(matches!(rt.free(pool, copy).unwrap(), FreeOutcome::Freed { .. }));
    }

    #[test]
    fn reregister_follows_a_foreign_realloc() {
        let rt = runtime(false);
        let old = vec![0u8; 32];
        let new = vec![0u8; 64];
        let (old, new) = (old.as_ptr() as usize, new.as_ptr() as usize);
        assert_eq!(
            rt.reregister(None, old, 0, 32).unwrap(),
            Some(RegisterOutcome::Inserted)
        );
        assert_eq!(
            rt.reregister(None, new, old, 64).unwrap(),
            Some(RegisterOutcome::Inserted)
        );
        assert!(rt.object_at(None, old).unwrap().is_none());
        assert_eq!(rt.object_at(None, new + 63).unwrap(), Some(ObjectSpan::new(new, 64)));
        assert_eq!(rt.reregister(None, 0, new, 0).unwrap(), None);
        assert!(rt.object_at(None, new).unwrap().is_none());
    }

    #[test]
    fn frame_marks_survive_a_raw_round_trip() {
        let rt = runtime(false);
        let pool = rt.create_pool(16).unwrap();
        rt.stack_alloc(pool, 24).unwrap();
        let mark = rt.stack_mark(pool).unwrap();
        let inner = rt.stack_alloc(pool, 8).unwrap();
        rt.stack_release(pool, FrameMark::from_raw(mark.to_raw())).unwrap();
        assert!(rt.object_at(Some(pool), inner).unwrap().is_none());
        assert_eq!(rt.stack_alloc(pool, 8).unwrap(), inner);
        // A bogus mark cannot push the stack past its current top.
        rt.stack_release(pool, FrameMark::from_raw([99, usize::MAX, 99]))
            .unwrap();
        assert!(rt.object_at(Some(pool), inner).unwrap().is_some());
    }

    #[test]
    fn stack_registrations_merge_and_leave_no_freed_record() {
        let rt = runtime(true);
        let buf = [0u8; 64];
        let addr = buf.as_ptr() as usize;
        assert_eq!(rt.register_stack(None, addr, 32).unwrap(), RegisterOutcome::Inserted);
        assert_eq!(
            rt.register_stack(None, addr + 16, 32).unwrap(),
            RegisterOutcome::Merged(ObjectSpan::new(addr, 48))
        );
        assert_eq!(rt.unregister(None, addr).unwrap(), Some(ObjectSpan::new(addr, 48)));
        assert!(rt.detector.lock().freed_at(addr).is_none());
    }

    #[test]
    fn external_registry_serves_null_pool() {
        let rt = runtime(true);
        let buf = [0u8; 32];
        let addr = buf.as_ptr() as usize;
        assert_eq!(rt.register_global(None, addr, 32).unwrap(), RegisterOutcome::Inserted);
        assert_eq!(rt.object_at(None, addr + 31).unwrap(), Some(ObjectSpan::new(addr, 32)));
        let pool = rt.create_pool(16).unwrap();
        assert_eq!(rt.object_at(Some(pool), addr).unwrap(), Some(ObjectSpan::new(addr, 32)));
        assert_eq!(rt.unregister_stack(None, addr).unwrap(), Some(ObjectSpan::new(addr, 32)));
        assert_eq!(rt.unregister(None, addr).unwrap(), None);
    }
}
