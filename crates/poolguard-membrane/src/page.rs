//! Virtual-memory pages for slabs, shadow aliases and the token region.
//!
//! [`PageProvider`] is the capability boundary: everything above it is
//! portable bookkeeping. [`MmapPages`] is the unix implementation; page
//! aliasing uses `mremap(addr, 0, len, MREMAP_MAYMOVE)` and is only available
//! on Linux. [`PageManager`] caches single pages in a free list and maps them
//! in batches so slab churn does not hit the kernel on every slab.

#![allow(unsafe_code)]

use parking_lot::Mutex;

/// Pages mapped at once when the single-page free list runs dry.
pub const DEFAULT_BATCH_PAGES: usize = 8;

/// Failure of a virtual-memory primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
    #[error("mmap of {len} bytes failed (errno {errno})")]
    Map { len: usize, errno: i32 },
    #[error("munmap of {addr:#x}+{len} failed (errno {errno})")]
    Unmap { addr: usize, len: usize, errno: i32 },
    #[error("alias of {addr:#x}+{len} failed (errno {errno})")]
    Alias { addr: usize, len: usize, errno: i32 },
    #[error("mprotect of {addr:#x}+{len} failed (errno {errno})")]
    Protect { addr: usize, len: usize, errno: i32 },
    #[error("page aliasing is not supported on this platform")]
    AliasUnsupported,
    #[error("a run of {pages} pages does not fit in the address space")]
    TooLarge { pages: usize },
    #[error("length {len} is not a positive multiple of the page size {page_size}")]
    Misaligned { len: usize, page_size: usize },
}

/// OS virtual-memory capability used by the allocator and the detector.
///
/// Addresses are plain `usize` values. Lengths passed in must be whole pages.
pub trait PageProvider: Send + Sync {
    /// Size of one OS page in bytes.
    fn page_size(&self) -> usize;

    /// Map `len` bytes of zeroed, readable and writable memory that can later
    /// be aliased with [`PageProvider::map_alias`].
    fn map_pages(&self, len: usize) -> Result<usize, PageError>;

    /// Release a mapping created by this provider.
    fn unmap(&self, addr: usize, len: usize) -> Result<(), PageError>;

    /// Create a second virtual mapping of the physical pages at `addr`.
    fn map_alias(&self, addr: usize, len: usize) -> Result<usize, PageError>;

    /// Make `[addr, addr+len)` inaccessible.
    fn protect(&self, addr: usize, len: usize) -> Result<(), PageError>;

    /// Make `[addr, addr+len)` readable and writable again.
    fn unprotect(&self, addr: usize, len: usize) -> Result<(), PageError>;

    /// Reserve `len` bytes of address space that is never accessible.
    fn reserve(&self, len: usize) -> Result<usize, PageError>;
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Query the OS page size, falling back to 4 KiB.
#[must_use]
pub fn os_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 { raw as usize } else { 4096 }
}

/// `mmap`-backed provider.
///
/// Canonical pages are `MAP_SHARED | MAP_ANONYMOUS` so that aliases created
/// with `mremap` share the same physical frames.
#[derive(Debug, Clone, Copy)]
pub struct MmapPages {
    page_size: usize,
}

impl MmapPages {
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: os_page_size(),
        }
    }

    fn check_len(&self, len: usize) -> Result<(), PageError> {
        if len == 0 || len % self.page_size != 0 {
            return Err(PageError::Misaligned {
                len,
                page_size: self.page_size,
            });
        }
        Ok(())
    }

    fn set_protection(&self, addr: usize, len: usize, prot: i32) -> Result<(), PageError> {
        self.check_len(len)?;
        // SAFETY: the range was mapped by this provider and is page aligned;
        // changing its protection cannot invalidate Rust-owned memory.
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
        if rc != 0 {
            return Err(PageError::Protect {
                addr,
                len,
                errno: last_errno(),
            });
        }
        Ok(())
    }
}

impl Default for MmapPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProvider for MmapPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_pages(&self, len: usize) -> Result<usize, PageError> {
        self.check_len(len)?;
        // SAFETY: anonymous mapping with a null hint; no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PageError::Map {
                len,
                errno: last_errno(),
            });
        }
        Ok(ptr as usize)
    }

    fn unmap(&self, addr: usize, len: usize) -> Result<(), PageError> {
        self.check_len(len)?;
        // SAFETY: callers only unmap ranges this provider mapped and no longer reference.
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(PageError::Unmap {
                addr,
                len,
                errno: last_errno(),
            });
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn map_alias(&self, addr: usize, len: usize) -> Result<usize, PageError> {
        self.check_len(len)?;
        // SAFETY: an old size of zero asks the kernel for a new mapping of the
        // same shared pages; the source mapping is left untouched.
        let ptr = unsafe { libc::mremap(addr as *mut libc::c_void, 0, len, libc::MREMAP_MAYMOVE) };
        if ptr == libc::MAP_FAILED {
            return Err(PageError::Alias {
                addr,
                len,
                errno: last_errno(),
            });
        }
        Ok(ptr as usize)
    }

    #[cfg(not(target_os = "linux"))]
    fn map_alias(&self, _addr: usize, _len: usize) -> Result<usize, PageError> {
        Err(PageError::AliasUnsupported)
    }

    fn protect(&self, addr: usize, len: usize) -> Result<(), PageError> {
        self.set_protection(addr, len, libc::PROT_NONE)
    }

    fn unprotect(&self, addr: usize, len: usize) -> Result<(), PageError> {
        self.set_protection(addr, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    fn reserve(&self, len: usize) -> Result<usize, PageError> {
        self.check_len(len)?;
        // SAFETY: PROT_NONE anonymous reservation; nothing is ever read or written through it.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PageError::Map {
                len,
                errno: last_errno(),
            });
        }
        Ok(ptr as usize)
    }
}

/// A run of contiguous pages: `pages` pages starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRun {
    pub base: usize,
    pub pages: usize,
}

impl PageRun {
    #[must_use]
    pub const fn len_bytes(self, page_size: usize) -> usize {
        self.pages * page_size
    }
}

struct PageCache {
    free: Vec<usize>,
    batches: Vec<usize>,
}

/// Page cache shared by every pool of one runtime.
pub struct PageManager {
    provider: Box<dyn PageProvider>,
    page_size: usize,
    batch: usize,
    cache: Mutex<PageCache>,
}

impl PageManager {
    #[must_use]
    pub fn new(provider: Box<dyn PageProvider>) -> Self {
        Self::with_batch(provider, DEFAULT_BATCH_PAGES)
    }

    #[must_use]
    pub fn with_batch(provider: Box<dyn PageProvider>, batch: usize) -> Self {
        let page_size = provider.page_size();
        Self {
            provider,
            page_size,
            batch: batch.max(1),
            cache: Mutex::new(PageCache {
                free: Vec::new(),
                batches: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn provider(&self) -> &dyn PageProvider {
        self.provider.as_ref()
    }

    /// Take one page from the free list, mapping a new batch if it is empty.
    pub fn allocate_page(&self) -> Result<usize, PageError> {
        let mut cache = self.cache.lock();
        if let Some(page) = cache.free.pop() {
            return Ok(page);
        }
        let base = self.provider.map_pages(self.batch * self.page_size)?;
        cache.batches.push(base);
        // Hand out the lowest page first.
        for i in (1..self.batch).rev() {
            cache.free.push(base + i * self.page_size);
        }
        Ok(base)
    }

    /// Return a page obtained from [`PageManager::allocate_page`].
    pub fn free_page(&self, page: usize) {
        self.cache.lock().free.push(page);
    }

    /// Map a dedicated run of `pages` pages.
    pub fn allocate_run(&self, pages: usize) -> Result<PageRun, PageError> {
        let len = pages
            .max(1)
            .checked_mul(self.page_size)
            .ok_or(PageError::TooLarge { pages })?;
        let base = self.provider.map_pages(len)?;
        Ok(PageRun {
            base,
            pages: pages.max(1),
        })
    }

    /// Unmap a run obtained from [`PageManager::allocate_run`].
    pub fn release_run(&self, run: PageRun) -> Result<(), PageError> {
        self.provider.unmap(run.base, run.len_bytes(self.page_size))
    }

    /// Number of pages sitting in the free list.
    #[must_use]
    pub fn cached_pages(&self) -> usize {
        self.cache.lock().free.len()
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        let cache = self.cache.get_mut();
        let len = self.batch * self.page_size;
        for base in cache.batches.drain(..) {
            let _ = self.provider.unmap(base, len);
        }
        cache.free.clear();
    }
}

/// Zero `len` bytes at `addr`.
///
/// The range must lie inside memory handed out by a pool of this runtime.
pub(crate) fn zero_bytes(addr: usize, len: usize) {
    if addr == 0 || len == 0 {
        return;
    }
    // SAFETY: callers pass a live allocation of at least `len` bytes.
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
}

/// Copy `len` bytes between two live, non-overlapping allocations.
pub(crate) fn copy_bytes(src: usize, dst: usize, len: usize) {
    if src == 0 || dst == 0 || len == 0 {
        return;
    }
    // SAFETY: callers pass two distinct live allocations each at least `len` bytes long.
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = os_page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn map_write_unmap_roundtrip() {
        let pages = MmapPages::new();
        let len = pages.page_size() * 2;
        let base = pages.map_pages(len).expect("map");
        // SAFETY: freshly mapped RW memory of `len` bytes.
        unsafe {
            let p = base as *mut u8;
            assert_eq!(*p, 0);
            *p.add(len - 1) = 0xAB;
            assert_eq!(*p.add(len - 1), 0xAB);
        }
        pages.unmap(base, len).expect("unmap");
    }

    #[test]
    fn misaligned_length_is_rejected() {
        let pages = MmapPages::new();
        let err = pages.map_pages(pages.page_size() + 1).unwrap_err();
        assert!(matches!(err, PageError::Misaligned { .. }));
        assert!(matches!(
            pages.map_pages(0).unwrap_err(),
            PageError::Misaligned { .. }
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn alias_shares_physical_page() {
        let pages = MmapPages::new();
        let len = pages.page_size();
        let canon = pages.map_pages(len).expect("map");
        let alias = pages.map_alias(canon, len).expect("alias");
        assert_ne!(canon, alias);
        // SAFETY: both addresses map the same RW shared page.
        unsafe {
            *(canon as *mut u32) = 0xDEAD_BEEF;
            assert_eq!(*(alias as *const u32), 0xDEAD_BEEF);
            *(alias as *mut u32).add(1) = 7;
            assert_eq!(*(canon as *const u32).add(1), 7);
        }
        pages.protect(alias, len).expect("protect");
        pages.unprotect(alias, len).expect("unprotect");
        // SAFETY: the alias is accessible again.
        unsafe { assert_eq!(*(alias as *const u32), 0xDEAD_BEEF) };
        pages.unmap(alias, len).expect("unmap alias");
        pages.unmap(canon, len).expect("unmap canon");
    }

    #[test]
    fn reserve_returns_distinct_region() {
        let pages = MmapPages::new();
        let len = pages.page_size() * 16;
        let a = pages.reserve(len).expect("reserve");
        let b = pages.reserve(len).expect("reserve");
        assert!(a + len <= b || b + len <= a);
        pages.unmap(a, len).expect("unmap");
        pages.unmap(b, len).expect("unmap");
    }

    #[test]
    fn manager_recycles_single_pages() {
        let manager = PageManager::with_batch(Box::new(MmapPages::new()), 4);
        let first = manager.allocate_page().expect("page");
        assert_eq!(manager.cached_pages(), 3);
        let second = manager.allocate_page().expect("page");
        assert_eq!(second, first + manager.page_size());
        manager.free_page(first);
        assert_eq!(manager.allocate_page().expect("page"), first);
    }

    #[test]
    fn manager_runs_are_dedicated_mappings() {
        let manager = PageManager::new(Box::new(MmapPages::new()));
        let run = manager.allocate_run(3).expect("run");
        assert_eq!(run.pages, 3);
        zero_bytes(run.base, run.len_bytes(manager.page_size()));
        manager.release_run(run).expect("release");
    }

    #[test]
    fn oversized_run_is_rejected_before_mapping() {
        let manager = PageManager::new(Box::new(MmapPages::new()));
        let pages = usize::MAX / manager.page_size() + 1;
        assert_eq!(
            manager.allocate_run(pages).unwrap_err(),
            PageError::TooLarge { pages }
        );
    }
}
