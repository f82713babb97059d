//! One slab: a page (or run of pages) cut into fixed-size cells.
//!
//! Two parallel bit-vectors track each cell: `allocated` and `start`. A
//! multi-cell object is one start bit followed by allocated cells without a
//! start bit. Three cursors keep the common cases off the bitmap scan:
//! - `first_unused`: lowest free cell (equals `capacity` when full)
//! - `used_begin`: lowest allocated cell
//! - `used_end`: one past the highest allocated cell

/// Fixed-size bit-vector backed by `u64` words.
#[derive(Debug, Clone)]
pub(crate) struct BitVec {
    words: Vec<u64>,
}

impl BitVec {
    pub(crate) fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    #[inline]
    pub(crate) fn get(&self, i: usize) -> bool {
        self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    #[inline]
    pub(crate) fn set(&mut self, i: usize) {
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    #[inline]
    pub(crate) fn clear(&mut self, i: usize) {
        self.words[i / 64] &= !(1u64 << (i % 64));
    }

    pub(crate) fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

/// Ordinary slabs serve many objects; large-array slabs serve exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabKind {
    Ordinary,
    LargeArray,
}

/// Slab bookkeeping. The cell memory itself lives at `base`.
#[derive(Debug, Clone)]
pub struct Slab {
    base: usize,
    pages: usize,
    node_size: usize,
    capacity: usize,
    kind: SlabKind,
    allocated: BitVec,
    start: BitVec,
    first_unused: usize,
    used_begin: usize,
    used_end: usize,
    live: usize,
}

impl Slab {
    /// Ordinary slab over one page.
    #[must_use]
    pub fn ordinary(base: usize, page_size: usize, node_size: usize) -> Self {
        let capacity = page_size / node_size;
        Self::with_layout(base, 1, node_size, capacity, SlabKind::Ordinary)
    }

    /// Large-array slab covering `pages` pages, holding `cells` cells.
    #[must_use]
    pub fn large_array(base: usize, pages: usize, node_size: usize, cells: usize) -> Self {
        Self::with_layout(base, pages, node_size, cells, SlabKind::LargeArray)
    }

    fn with_layout(
        base: usize,
        pages: usize,
        node_size: usize,
        capacity: usize,
        kind: SlabKind,
    ) -> Self {
        Self {
            base,
            pages,
            node_size,
            capacity,
            kind,
            allocated: BitVec::new(capacity),
            start: BitVec::new(capacity),
            first_unused: 0,
            used_begin: 0,
            used_end: 0,
            live: 0,
        }
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    #[must_use]
    pub fn kind(&self) -> SlabKind {
        self.kind
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn live_cells(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// A large array counts as full for list bookkeeping even when freed.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.kind == SlabKind::LargeArray || self.first_unused >= self.capacity
    }

    /// Does `addr` fall inside the slab's pages?
    #[must_use]
    pub fn contains(&self, addr: usize, page_size: usize) -> bool {
        addr >= self.base && addr < self.base + self.pages * page_size
    }

    #[must_use]
    pub fn cell_address(&self, idx: usize) -> usize {
        self.base + idx * self.node_size
    }

    /// Cell index of `addr` if it is exactly the first byte of a cell.
    #[must_use]
    pub fn cell_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        if offset % self.node_size != 0 {
            return None;
        }
        let idx = offset / self.node_size;
        (idx < self.capacity).then_some(idx)
    }

    #[must_use]
    pub fn is_allocated(&self, idx: usize) -> bool {
        idx < self.capacity && self.allocated.get(idx)
    }

    #[must_use]
    pub fn is_start(&self, idx: usize) -> bool {
        idx < self.capacity && self.start.get(idx)
    }

    fn mark(&mut self, idx: usize, cells: usize) {
        self.start.set(idx);
        for i in idx..idx + cells {
            self.allocated.set(i);
        }
        self.live += cells;
        self.used_begin = if self.live == cells {
            idx
        } else {
            self.used_begin.min(idx)
        };
        self.used_end = self.used_end.max(idx + cells);
    }

    fn next_free_from(&self, mut idx: usize) -> usize {
        while idx < self.used_end && self.allocated.get(idx) {
            idx += 1;
        }
        idx.min(self.capacity)
    }

    /// Allocate one cell, returning its index.
    pub fn allocate_single(&mut self) -> Option<usize> {
        if self.kind == SlabKind::LargeArray || self.first_unused >= self.capacity {
            return None;
        }
        // Appending past the used region keeps recently freed holes for later.
        let idx = if self.used_end < self.capacity {
            self.used_end
        } else {
            self.first_unused
        };
        self.mark(idx, 1);
        if idx == self.first_unused {
            self.first_unused = self.next_free_from(idx + 1);
        }
        Some(idx)
    }

    /// Allocate `cells` contiguous cells, returning the index of the first.
    pub fn allocate_multiple(&mut self, cells: usize) -> Option<usize> {
        if cells == 0 || self.kind == SlabKind::LargeArray || cells > self.capacity {
            return None;
        }
        if cells == 1 {
            return self.allocate_single();
        }
        let idx = if self.used_end + cells <= self.capacity {
            self.used_end
        } else {
            self.find_free_run(cells)?
        };
        self.mark(idx, cells);
        if idx == self.first_unused {
            self.first_unused = self.next_free_from(idx + cells);
        }
        Some(idx)
    }

    fn find_free_run(&self, cells: usize) -> Option<usize> {
        let mut idx = self.first_unused;
        while idx + cells <= self.capacity {
            match (idx..idx + cells).find(|&i| self.allocated.get(i)) {
                None => return Some(idx),
                Some(taken) => idx = taken + 1,
            }
        }
        None
    }

    /// Claim every cell of a large-array slab as one object.
    pub fn claim_whole(&mut self) -> bool {
        if self.live != 0 || self.capacity == 0 {
            return false;
        }
        self.mark(0, self.capacity);
        self.first_unused = self.capacity;
        true
    }

    /// Number of cells in the allocation starting at `idx`.
    #[must_use]
    pub fn allocation_cells(&self, idx: usize) -> Option<usize> {
        if !self.is_start(idx) {
            return None;
        }
        let mut end = idx + 1;
        while end < self.used_end && self.allocated.get(end) && !self.start.get(end) {
            end += 1;
        }
        Some(end - idx)
    }

    /// Free the allocation starting at cell `idx`.
    ///
    /// Returns the number of cells released, or `None` when `idx` is not the
    /// start of a live allocation (invalid and double frees are ignored here).
    pub fn free_element(&mut self, idx: usize) -> Option<usize> {
        let cells = self.allocation_cells(idx)?;
        self.start.clear(idx);
        for i in idx..idx + cells {
            self.allocated.clear(i);
        }
        self.live -= cells;
        if self.live == 0 {
            self.reset_cursors();
            return Some(cells);
        }
        let freed_end = idx + cells;
        if freed_end == self.used_end {
            self.used_end = self.last_allocated_below(idx).map_or(0, |i| i + 1);
        }
        if idx == self.used_begin {
            self.used_begin = (freed_end..self.used_end)
                .find(|&i| self.allocated.get(i))
                .unwrap_or(self.used_end);
        }
        self.first_unused = if self.kind == SlabKind::LargeArray {
            self.capacity
        } else {
            self.first_unused.min(idx)
        };
        Some(cells)
    }

    fn last_allocated_below(&self, idx: usize) -> Option<usize> {
        (0..idx).rev().find(|&i| self.allocated.get(i))
    }

    fn reset_cursors(&mut self) {
        self.allocated.clear_all();
        self.start.clear_all();
        self.first_unused = if self.kind == SlabKind::LargeArray {
            self.capacity
        } else {
            0
        };
        self.used_begin = 0;
        self.used_end = 0;
    }

    #[cfg(test)]
    pub(crate) fn cursors(&self) -> (usize, usize, usize) {
        (self.first_unused, self.used_begin, self.used_end)
    }
}
