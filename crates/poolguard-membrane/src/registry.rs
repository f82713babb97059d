//! Object registry: live address ranges of one pool and their metadata.
//!
//! A 2-entry direct-mapped cache sits in front of the splay tree so the
//! common "same object again" lookup never touches the tree.

use serde::{Deserialize, Serialize};

use crate::splay::RangeMap;

/// Where an object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Global,
    Stack,
    Heap,
}

impl ObjectClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Stack => "stack",
            Self::Heap => "heap",
        }
    }
}

/// Source file and line of an instrumented call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

impl SourceLoc {
    #[must_use]
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Debug provenance of an object: who allocated it and who freed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub alloc_id: u64,
    pub free_id: u64,
    pub alloc_pc: usize,
    pub free_pc: usize,
    /// Address handed out by the slab allocator before shadowing.
    pub canonical: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_site: Option<SourceLoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_site: Option<SourceLoc>,
}

/// Metadata stored with every registered range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub class: ObjectClass,
    /// Set when every use of the object is visible to the instrumentation.
    pub complete: bool,
    pub provenance: Option<Box<Provenance>>,
}

impl ObjectMeta {
    #[must_use]
    pub fn new(class: ObjectClass) -> Self {
        Self {
            class,
            complete: true,
            provenance: None,
        }
    }

    #[must_use]
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(Box::new(provenance));
        self
    }

    #[must_use]
    pub fn incomplete(mut self) -> Self {
        self.complete = false;
        self
    }
}

/// Bounds of a registered object: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectSpan {
    pub start: usize,
    pub end: usize,
}

impl ObjectSpan {
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.end <= self.start
    }

    #[must_use]
    pub const fn contains(self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Distance from `addr` to the nearest byte of the span (0 inside).
    #[must_use]
    pub const fn distance(self, addr: usize) -> usize {
        if addr < self.start {
            self.start - addr
        } else if addr >= self.end {
            addr - self.end + 1
        } else {
            0
        }
    }
}

/// Copyable summary returned by lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub span: ObjectSpan,
    pub class: ObjectClass,
    pub complete: bool,
}

/// Two most recently found objects, replaced alternately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectCache {
    slots: [Option<ObjectRef>; 2],
    next: usize,
}

impl ObjectCache {
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<ObjectRef> {
        self.slots
            .iter()
            .flatten()
            .find(|o| o.span.contains(addr))
            .copied()
    }

    pub fn remember(&mut self, obj: ObjectRef) {
        if self.slots.iter().flatten().any(|o| o.span == obj.span) {
            return;
        }
        self.slots[self.next] = Some(obj);
        self.next ^= 1;
    }

    pub fn evict(&mut self, start: usize) {
        for slot in &mut self.slots {
            if slot.is_some_and(|o| o.span.start == start) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None; 2];
    }
}

/// What [`Registry::register`] did with an overlapping registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// Merged into an existing global or stack object; carries the union.
    Merged(ObjectSpan),
    /// An overlapping heap object was dropped in favour of the new one.
    Replaced(Vec<ObjectSpan>),
    /// Null start or zero length.
    Ignored,
}

/// Cache hit statistics for one registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub cache_hits: u64,
    pub tree_lookups: u64,
}

/// Live objects of one pool.
#[derive(Debug, Default)]
pub struct Registry {
    map: RangeMap<ObjectMeta>,
    cache: ObjectCache,
    stats: LookupStats,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> LookupStats {
        self.stats
    }

    fn first_overlap(&mut self, span: ObjectSpan) -> Option<ObjectSpan> {
        if let Some((s, e, _)) = self.map.find(span.start) {
            return Some(ObjectSpan { start: s, end: e });
        }
        let (s, e) = self.map.successor(span.start)?;
        (s < span.end).then_some(ObjectSpan { start: s, end: e })
    }

    /// Register `[start, start+len)`.
    ///
    /// Overlap with a global or stack object grows that object to the union
    /// of both ranges. Overlap with a heap object replaces it.
    pub fn register(&mut self, start: usize, len: usize, meta: ObjectMeta) -> RegisterOutcome {
        if start == 0 || len == 0 {
            return RegisterOutcome::Ignored;
        }
        let mut span = ObjectSpan::new(start, len);
        let mut replaced = Vec::new();
        let mut merged_meta: Option<ObjectMeta> = None;
        while let Some(existing) = self.first_overlap(span) {
            let Some((s, e, old)) = self.map.remove(existing.start) else {
                break;
            };
            self.cache.evict(s);
            match old.class {
                ObjectClass::Global | ObjectClass::Stack => {
                    span = ObjectSpan {
                        start: span.start.min(s),
                        end: span.end.max(e),
                    };
                    merged_meta.get_or_insert(old);
                }
                ObjectClass::Heap => replaced.push(ObjectSpan { start: s, end: e }),
            }
        }
        let merged = merged_meta.is_some();
        let meta = merged_meta.unwrap_or(meta);
        self.map.insert(span.start, span.end, meta);
        if merged {
            RegisterOutcome::Merged(span)
        } else if replaced.is_empty() {
            RegisterOutcome::Inserted
        } else {
            RegisterOutcome::Replaced(replaced)
        }
    }

    /// Remove the object starting at `start`.
    pub fn unregister(&mut self, start: usize) -> Option<(ObjectSpan, ObjectMeta)> {
        self.cache.evict(start);
        let (s, e, meta) = self.map.remove(start)?;
        Some((ObjectSpan { start: s, end: e }, meta))
    }

    /// Find the object covering `addr`.
    pub fn find(&mut self, addr: usize) -> Option<ObjectRef> {
        if let Some(hit) = self.cache.lookup(addr) {
            self.stats.cache_hits += 1;
            return Some(hit);
        }
        self.stats.tree_lookups += 1;
        let (start, end, meta) = self.map.find(addr)?;
        let obj = ObjectRef {
            span: ObjectSpan { start, end },
            class: meta.class,
            complete: meta.complete,
        };
        self.cache.remember(obj);
        Some(obj)
    }

    /// Full metadata of the object covering `addr`.
    pub fn meta(&mut self, addr: usize) -> Option<&ObjectMeta> {
        self.map.find(addr).map(|(_, _, m)| m)
    }

    /// Closest live object to `addr` whose distance is at most its own length.
    ///
    /// Used to attribute a raw pointer that landed just outside an object.
    pub fn nearest(&mut self, addr: usize) -> Option<ObjectRef> {
        let below = self.map.predecessor(addr).map(|(s, e)| ObjectSpan { start: s, end: e });
        let above = self.map.successor(addr).map(|(s, e)| ObjectSpan { start: s, end: e });
        let best = [below, above]
            .into_iter()
            .flatten()
            .filter(|span| span.distance(addr) <= span.len())
            .min_by_key(|span| span.distance(addr))?;
        let (_, _, meta) = self.map.find(best.start)?;
        Some(ObjectRef {
            span: best,
            class: meta.class,
            complete: meta.complete,
        })
    }

    /// Every live span, in address order.
    #[must_use]
    pub fn spans(&self) -> Vec<ObjectSpan> {
        self.map
            .ranges()
            .into_iter()
            .map(|(start, end, _)| ObjectSpan { start, end })
            .collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.cache.clear();
    }
}
