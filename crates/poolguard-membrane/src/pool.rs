//! Slab pool: same-size-class allocation over slabs from the page manager.
//!
//! Slabs live in an index arena. Every slab id sits on exactly one of the
//! `partial`, `full` or `large` lists (`free_large` holds freed large arrays
//! waiting for a request of the same page count). An ordered index from slab
//! base to id answers "which slab owns this address", fronted by a 2-entry
//! direct-mapped cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::page::{PageError, PageManager, PageRun};
use crate::slab::{Slab, SlabKind};

/// Alignment of stack-promoted allocations.
pub const STACK_ALIGN: usize = 8;

/// Slab-level allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("stack allocation of {0} bytes does not fit in one stack slab")]
    StackOverflow(usize),
    #[error("allocation size overflow")]
    SizeOverflow,
}

type SlabId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabList {
    Partial,
    Full,
    Large,
    FreeLarge,
}

#[derive(Debug)]
struct SlabEntry {
    slab: Slab,
    list: SlabList,
    /// Index of this slab in its list.
    pos: usize,
}

/// Bump region for stack objects promoted to the heap.
#[derive(Debug, Clone, Copy)]
struct StackSlab {
    base: usize,
    top: usize,
}

/// Position in the promoted-stack region, restored by [`SlabPool::stack_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMark {
    depth: usize,
    top: usize,
}

impl StackMark {
    pub(crate) const fn from_parts(depth: usize, top: usize) -> Self {
        Self { depth, top }
    }

    pub(crate) const fn parts(self) -> (usize, usize) {
        (self.depth, self.top)
    }
}

/// Counters describing a pool's slab population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub partial: usize,
    pub full: usize,
    pub large: usize,
    pub stack: usize,
    pub slabs_created: u64,
    pub slabs_recycled: u64,
}

/// A pool of same-size-class cells.
pub struct SlabPool {
    node_size: usize,
    page_size: usize,
    pages: Arc<PageManager>,
    slabs: Vec<Option<SlabEntry>>,
    vacant: Vec<SlabId>,
    partial: Vec<SlabId>,
    full: Vec<SlabId>,
    large: Vec<SlabId>,
    free_large: Vec<SlabId>,
    by_base: BTreeMap<usize, SlabId>,
    addr_cache: [Option<SlabId>; 2],
    cache_slot: usize,
    stack: Vec<StackSlab>,
    free_stack: Vec<usize>,
    slabs_created: u64,
    slabs_recycled: u64,
}

impl SlabPool {
    /// Create a pool of `node_size` cells. A node size of zero is treated as one.
    #[must_use]
    pub fn new(node_size: usize, pages: Arc<PageManager>) -> Self {
        let page_size = pages.page_size();
        Self {
            node_size: node_size.max(1),
            page_size,
            pages,
            slabs: Vec::new(),
            vacant: Vec::new(),
            partial: Vec::new(),
            full: Vec::new(),
            large: Vec::new(),
            free_large: Vec::new(),
            by_base: BTreeMap::new(),
            addr_cache: [None; 2],
            cache_slot: 0,
            stack: Vec::new(),
            free_stack: Vec::new(),
            slabs_created: 0,
            slabs_recycled: 0,
        }
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Cells in one ordinary slab.
    #[must_use]
    pub fn cells_per_slab(&self) -> usize {
        self.page_size / self.node_size
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            partial: self.partial.len(),
            full: self.full.len(),
            large: self.large.len() + self.free_large.len(),
            stack: self.stack.len(),
            slabs_created: self.slabs_created,
            slabs_recycled: self.slabs_recycled,
        }
    }

    /// Live ordinary and large-array slabs.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        self.partial.len() + self.full.len() + self.large.len() + self.free_large.len()
    }

    fn entry(&self, id: SlabId) -> Option<&SlabEntry> {
        self.slabs.get(id)?.as_ref()
    }

    fn entry_mut(&mut self, id: SlabId) -> Option<&mut SlabEntry> {
        self.slabs.get_mut(id)?.as_mut()
    }

    fn list_mut(&mut self, list: SlabList) -> &mut Vec<SlabId> {
        match list {
            SlabList::Partial => &mut self.partial,
            SlabList::Full => &mut self.full,
            SlabList::Large => &mut self.large,
            SlabList::FreeLarge => &mut self.free_large,
        }
    }

    /// Unlink `id` from its list in O(1), patching the index of the slab
    /// swapped into its place.
    fn detach(&mut self, id: SlabId) {
        let Some((list, pos)) = self.entry(id).map(|e| (e.list, e.pos)) else {
            return;
        };
        let ids = self.list_mut(list);
        if ids.get(pos) != Some(&id) {
            return;
        }
        ids.swap_remove(pos);
        let moved = ids.get(pos).copied();
        if let Some(entry) = moved.and_then(|m| self.entry_mut(m)) {
            entry.pos = pos;
        }
    }

    fn attach(&mut self, id: SlabId, list: SlabList) {
        let ids = self.list_mut(list);
        let pos = ids.len();
        ids.push(id);
        if let Some(entry) = self.entry_mut(id) {
            entry.list = list;
            entry.pos = pos;
        }
    }

    fn move_to(&mut self, id: SlabId, to: SlabList) {
        if self.entry(id).is_none_or(|e| e.list == to) {
            return;
        }
        self.detach(id);
        self.attach(id, to);
    }

    fn insert_slab(&mut self, slab: Slab, list: SlabList) -> SlabId {
        let base = slab.base();
        let entry = SlabEntry { slab, list, pos: 0 };
        let id = match self.vacant.pop() {
            Some(id) => {
                self.slabs[id] = Some(entry);
                id
            }
            None => {
                self.slabs.push(Some(entry));
                self.slabs.len() - 1
            }
        };
        self.attach(id, list);
        self.by_base.insert(base, id);
        self.slabs_created += 1;
        id
    }

    fn remove_slab(&mut self, id: SlabId) -> Option<Slab> {
        self.detach(id);
        let entry = self.slabs.get_mut(id)?.take()?;
        self.by_base.remove(&entry.slab.base());
        for slot in &mut self.addr_cache {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        self.vacant.push(id);
        Some(entry.slab)
    }

    /// Allocate `bytes` bytes, returning the canonical cell address.
    pub fn alloc(&mut self, bytes: usize) -> Result<usize, AllocError> {
        let nodes = bytes.div_ceil(self.node_size).max(1);
        let per_slab = self.cells_per_slab();
        if nodes > per_slab {
            return self.alloc_large(nodes);
        }
        let mut promote = None;
        let mut found = None;
        for &id in &self.partial {
            let Some(entry) = self.slabs[id].as_mut() else {
                continue;
            };
            let idx = if nodes == 1 {
                entry.slab.allocate_single()
            } else {
                entry.slab.allocate_multiple(nodes)
            };
            if let Some(idx) = idx {
                found = Some(entry.slab.cell_address(idx));
                if entry.slab.is_full() {
                    promote = Some(id);
                }
                break;
            }
        }
        if let Some(id) = promote {
            self.move_to(id, SlabList::Full);
        }
        if let Some(addr) = found {
            return Ok(addr);
        }

        let page = self.pages.allocate_page()?;
        let mut slab = Slab::ordinary(page, self.page_size, self.node_size);
        let idx = slab
            .allocate_multiple(nodes)
            .ok_or(AllocError::SizeOverflow)?;
        let addr = slab.cell_address(idx);
        let list = if slab.is_full() {
            SlabList::Full
        } else {
            SlabList::Partial
        };
        self.insert_slab(slab, list);
        Ok(addr)
    }

    fn alloc_large(&mut self, nodes: usize) -> Result<usize, AllocError> {
        let bytes = nodes
            .checked_mul(self.node_size)
            .ok_or(AllocError::SizeOverflow)?;
        let pages = bytes.div_ceil(self.page_size);
        pages
            .checked_mul(self.page_size)
            .ok_or(AllocError::SizeOverflow)?;
        let reuse = self
            .free_large
            .iter()
            .copied()
            .find(|&id| self.entry(id).is_some_and(|e| e.slab.pages() == pages));
        let id = match reuse {
            Some(id) => {
                self.move_to(id, SlabList::Large);
                id
            }
            None => {
                let run = self.pages.allocate_run(pages)?;
                let cells = run.len_bytes(self.page_size) / self.node_size;
                let slab = Slab::large_array(run.base, run.pages, self.node_size, cells.max(nodes));
                self.insert_slab(slab, SlabList::Large)
            }
        };
        let entry = self
            .entry_mut(id)
            .ok_or(AllocError::SizeOverflow)?;
        entry.slab.claim_whole();
        Ok(entry.slab.base())
    }

    fn owning_slab(&mut self, addr: usize) -> Option<SlabId> {
        for id in self.addr_cache.iter().flatten() {
            if let Some(entry) = self.slabs[*id].as_ref()
                && entry.slab.contains(addr, self.page_size)
            {
                return Some(*id);
            }
        }
        let (_, &id) = self.by_base.range(..=addr).next_back()?;
        if !self.entry(id)?.slab.contains(addr, self.page_size) {
            return None;
        }
        self.addr_cache[self.cache_slot] = Some(id);
        self.cache_slot ^= 1;
        Some(id)
    }

    /// Does `addr` fall inside a slab owned by this pool?
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.by_base
            .range(..=addr)
            .next_back()
            .and_then(|(_, &id)| self.entry(id))
            .is_some_and(|e| e.slab.contains(addr, self.page_size))
    }

    /// Bytes covered by the allocation starting at `addr`.
    pub fn allocation_size(&mut self, addr: usize) -> Option<usize> {
        let id = self.owning_slab(addr)?;
        let slab = &self.entry(id)?.slab;
        let idx = slab.cell_index(addr)?;
        slab.allocation_cells(idx).map(|cells| cells * self.node_size)
    }

    /// The page run backing the slab that owns `addr`.
    pub fn slab_run(&mut self, addr: usize) -> Option<PageRun> {
        let id = self.owning_slab(addr)?;
        let slab = &self.entry(id)?.slab;
        Some(PageRun {
            base: slab.base(),
            pages: slab.pages(),
        })
    }

    /// Free the allocation starting at `addr`.
    ///
    /// Returns the bytes released. Addresses this pool does not own, interior
    /// pointers and double frees are ignored and return `None`.
    pub fn free(&mut self, addr: usize) -> Option<usize> {
        let id = self.owning_slab(addr)?;
        let node_size = self.node_size;
        let entry = self.entry_mut(id)?;
        let idx = entry.slab.cell_index(addr)?;
        let was_full = entry.slab.is_full();
        let cells = entry.slab.free_element(idx)?;
        let kind = entry.slab.kind();
        let empty = entry.slab.is_empty();

        match kind {
            SlabKind::LargeArray => self.move_to(id, SlabList::FreeLarge),
            SlabKind::Ordinary => {
                if was_full {
                    self.move_to(id, SlabList::Partial);
                }
                // Keep one empty slab around so alloc/free churn does not
                // bounce pages through the manager.
                if empty
                    && self.partial.len() > 1
                    && let Some(slab) = self.remove_slab(id)
                {
                    self.pages.free_page(slab.base());
                    self.slabs_recycled += 1;
                }
            }
        }
        Some(cells * node_size)
    }

    /// Bump-allocate `bytes` from the promoted-stack region.
    pub fn stack_alloc(&mut self, bytes: usize) -> Result<usize, AllocError> {
        let size = bytes
            .max(1)
            .checked_next_multiple_of(STACK_ALIGN)
            .ok_or(AllocError::SizeOverflow)?;
        if size > self.page_size {
            return Err(AllocError::StackOverflow(bytes));
        }
        if let Some(top) = self.stack.last_mut()
            && top.top + size <= top.base + self.page_size
        {
            let addr = top.top;
            top.top += size;
            return Ok(addr);
        }
        let base = match self.free_stack.pop() {
            Some(page) => page,
            None => self.pages.allocate_page()?,
        };
        self.stack.push(StackSlab {
            base,
            top: base + size,
        });
        Ok(base)
    }

    /// Current position of the promoted-stack region.
    #[must_use]
    pub fn stack_mark(&self) -> StackMark {
        StackMark {
            depth: self.stack.len(),
            top: self.stack.last().map_or(0, |s| s.top),
        }
    }

    /// Pop every stack allocation made after `mark`.
    pub fn stack_release(&mut self, mark: StackMark) {
        while self.stack.len() > mark.depth {
            if let Some(slab) = self.stack.pop() {
                self.free_stack.push(slab.base);
            }
        }
        if let Some(top) = self.stack.last_mut()
            && mark.depth > 0
            && mark.top >= top.base
            && mark.top <= top.top
        {
            top.top = mark.top;
        }
    }

    /// Release every slab. Returns the page runs that backed them.
    pub fn destroy(&mut self) -> Vec<PageRun> {
        let mut runs = Vec::with_capacity(self.slab_count() + self.stack.len());
        let ids: Vec<SlabId> = self
            .partial
            .iter()
            .chain(&self.full)
            .chain(&self.large)
            .chain(&self.free_large)
            .copied()
            .collect();
        for id in ids {
            let Some(slab) = self.remove_slab(id) else {
                continue;
            };
            let run = PageRun {
                base: slab.base(),
                pages: slab.pages(),
            };
            match slab.kind() {
                SlabKind::Ordinary => self.pages.free_page(run.base),
                SlabKind::LargeArray => {
                    let _ = self.pages.release_run(run);
                }
            }
            runs.push(run);
        }
        for slab in self.stack.drain(..) {
            self.pages.free_page(slab.base);
            runs.push(PageRun {
                base: slab.base,
                pages: 1,
            });
        }
        for page in self.free_stack.drain(..) {
            self.pages.free_page(page);
        }
        self.slabs.clear();
        self.vacant.clear();
        runs
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MmapPages;

    fn pool(node: usize) -> SlabPool {
        SlabPool::new(node, Arc::new(PageManager::new(Box::new(MmapPages::new()))))
    }

    #[test]
    fn zero_node_size_is_one() {
        let p = pool(0);
        assert_eq!(p.node_size(), 1);
    }

    #[test]
    fn scenario_reuse_without_growing() {
        let mut p = pool(16);
        let p1 = p.alloc(20).unwrap();
        let p2 = p.alloc(8).unwrap();
        assert_eq!(p.allocation_size(p1), Some(32));
        assert_eq!(p.allocation_size(p2), Some(16));
        assert_eq!(p.slab_count(), 1);
        assert_eq!(p.free(p1), Some(32));
        let p3 = p.alloc(8).unwrap();
        assert_eq!(p.slab_count(), 1);
        assert_eq!(p.stats().slabs_created, 1);
        assert_ne!(p3, p2);
    }

    #[test]
    fn full_slab_moves_between_lists() {
        let mut p = pool(1024);
        let per = p.cells_per_slab();
        let addrs: Vec<usize> = (0..per).map(|_| p.alloc(1024).unwrap()).collect();
        assert_eq!(p.stats().full, 1);
        assert_eq!(p.stats().partial, 0);
        p.free(addrs[0]).unwrap();
        assert_eq!(p.stats().full, 0);
        assert_eq!(p.stats().partial, 1);
        let again = p.alloc(1).unwrap();
        assert_eq!(again, addrs[0]);
    }

    #[test]
    fn invalid_frees_are_silent() {
        let mut p = pool(32);
        let a = p.alloc(64).unwrap();
        assert_eq!(p.free(a + 32), None);
        assert_eq!(p.free(0xDEAD_0000), None);
        assert_eq!(p.free(a), Some(64));
        assert_eq!(p.free(a), None);
    }

    #[test]
    fn large_requests_get_dedicated_runs() {
        let mut p = pool(64);
        let page = p.pages.page_size();
        let big = p.alloc(page * 2 + 1).unwrap();
        assert_eq!(p.stats().large, 1);
        assert_eq!(p.slab_run(big).unwrap().pages, 3);
        assert!(p.owns(big + page * 2));
        assert_eq!(p.free(big), Some(page * 3));
        // The freed run serves the next request of the same page count.
        let again = p.alloc(page * 2 + 10).unwrap();
        assert_eq!(again, big);
        assert_eq!(p.stats().slabs_created, 1);
    }

    #[test]
    fn emptied_slab_is_recycled_when_another_partial_exists() {
        let half = crate::page::os_page_size() / 2;
        let mut p = pool(half);
        let a = p.alloc(half).unwrap();
        let b = p.alloc(half).unwrap();
        let c = p.alloc(half).unwrap();
        assert_eq!(p.slab_count(), 2);
        p.free(a).unwrap();
        p.free(b).unwrap();
        assert_eq!(p.stats().slabs_recycled, 1);
        assert_eq!(p.slab_count(), 1);
        assert!(!p.owns(a));
        p.free(c).unwrap();
        // The last empty slab is kept.
        assert_eq!(p.slab_count(), 1);
    }

    #[test]
    fn stack_region_bumps_and_releases() {
        let mut p = pool(16);
        let mark = p.stack_mark();
        let a = p.stack_alloc(3).unwrap();
        let b = p.stack_alloc(8).unwrap();
        assert_eq!(b, a + STACK_ALIGN);
        let inner = p.stack_mark();
        let c = p.stack_alloc(100).unwrap();
        p.stack_release(inner);
        assert_eq!(p.stack_alloc(100).unwrap(), c);
        p.stack_release(mark);
        assert_eq!(p.stats().stack, 0);
        assert!(matches!(
            p.stack_alloc(1 << 30),
            Err(AllocError::StackOverflow(_))
        ));
    }

    fn assert_lists_consistent(p: &SlabPool) {
        for (kind, ids) in [
            (SlabList::Partial, &p.partial),
            (SlabList::Full, &p.full),
            (SlabList::Large, &p.large),
            (SlabList::FreeLarge, &p.free_large),
        ] {
            for (pos, &id) in ids.iter().enumerate() {
                let entry = p.entry(id).unwrap();
                assert_eq!(entry.list, kind);
                assert_eq!(entry.pos, pos);
            }
        }
    }

    #[test]
    fn list_moves_keep_positions_in_sync() {
        let mut p = pool(1024);
        let per = p.cells_per_slab();
        let slabs: Vec<Vec<usize>> = (0..8)
            .map(|_| (0..per).map(|_| p.alloc(1024).unwrap()).collect())
            .collect();
        assert_eq!(p.stats().full, 8);
        assert_lists_consistent(&p);
        // Demote every other slab, then promote them back in reverse.
        for cells in slabs.iter().step_by(2) {
            p.free(cells[0]).unwrap();
            assert_lists_consistent(&p);
        }
        assert_eq!(p.stats().partial, 4);
        assert_eq!(p.stats().full, 4);
        for _ in 0..4 {
            p.alloc(1024).unwrap();
            assert_lists_consistent(&p);
        }
        assert_eq!(p.stats().full, 8);
        // Empty three slabs so two of them are recycled.
        for cells in slabs.iter().skip(1).take(3) {
            for &cell in cells {
                p.free(cell).unwrap();
            }
            assert_lists_consistent(&p);
        }
        assert_eq!(p.stats().slabs_recycled, 2);
        assert_eq!(p.slab_count(), 6);
    }

    #[test]
    fn huge_requests_fail_without_wrapping() {
        let mut tiny = pool(1);
        assert_eq!(tiny.alloc(usize::MAX - 10), Err(AllocError::SizeOverflow));
        let mut p = pool(16);
        assert_eq!(p.alloc(usize::MAX - 100), Err(AllocError::SizeOverflow));
        assert_eq!(p.slab_count(), 0);
        // The pool still works afterwards.
        assert!(p.alloc(16).is_ok());
    }

    #[test]
    fn destroy_returns_every_run() {
        let mut p = pool(16);
        p.alloc(16).unwrap();
        p.alloc(p.pages.page_size() * 4).unwrap();
        p.stack_alloc(64).unwrap();
        let runs = p.destroy();
        assert_eq!(runs.len(), 3);
        assert_eq!(p.slab_count(), 0);
    }
}
