//! Out-of-bounds pointer tokens.
//!
//! A token is an address inside a reserved `PROT_NONE` region that no pool
//! ever hands out, so it can never alias a live object and dereferencing it
//! faults. Tokens are issued sequentially; the table maps each one back to the
//! object it escaped from and the pointer value it stands for.

use std::collections::HashMap;

use serde::Serialize;

use crate::page::{PageError, PageProvider};
use crate::registry::{ObjectSpan, SourceLoc};
use crate::runtime::PoolId;

/// Default size of the token region (1 GiB of address space, never backed).
pub const DEFAULT_TOKEN_REGION: usize = 1 << 30;

/// What a token stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OobRecord {
    pub token: usize,
    /// The real, out-of-bounds pointer value.
    pub pointer: usize,
    /// Bounds of the object the pointer was derived from.
    pub object: ObjectSpan,
    pub pool: Option<PoolId>,
    pub site: Option<SourceLoc>,
}

/// Issued tokens and their records.
#[derive(Debug)]
pub struct TokenTable {
    base: usize,
    len: usize,
    next: usize,
    by_token: HashMap<usize, OobRecord>,
    by_pointer: HashMap<(usize, usize), usize>,
}

impl TokenTable {
    /// Table over an already reserved region `[base, base+len)`.
    #[must_use]
    pub fn new(base: usize, len: usize) -> Self {
        Self {
            base,
            len,
            next: base,
            by_token: HashMap::new(),
            by_pointer: HashMap::new(),
        }
    }

    /// Reserve a region of `len` bytes through `provider`.
    pub fn reserve(provider: &dyn PageProvider, len: usize) -> Result<Self, PageError> {
        let page = provider.page_size();
        let len = len.max(page).div_ceil(page) * page;
        let base = provider.reserve(len)?;
        Ok(Self::new(base, len))
    }

    #[must_use]
    pub fn region(&self) -> (usize, usize) {
        (self.base, self.len)
    }

    /// Is `value` inside the token region?
    #[must_use]
    pub fn contains(&self, value: usize) -> bool {
        value >= self.base && value - self.base < self.len
    }

    #[must_use]
    pub fn issued(&self) -> usize {
        self.by_token.len()
    }

    /// Token standing for `pointer`, derived from `object`.
    ///
    /// Rewriting the same pointer against the same object again returns the
    /// token issued the first time. `None` once the region is exhausted.
    pub fn rewrite(
        &mut self,
        pointer: usize,
        object: ObjectSpan,
        pool: Option<PoolId>,
        site: Option<SourceLoc>,
    ) -> Option<usize> {
        if let Some(&token) = self.by_pointer.get(&(pointer, object.start)) {
            return Some(token);
        }
        if self.next - self.base >= self.len {
            return None;
        }
        let token = self.next;
        self.next += 1;
        self.by_pointer.insert((pointer, object.start), token);
        self.by_token.insert(
            token,
            OobRecord {
                token,
                pointer,
                object,
                pool,
                site,
            },
        );
        Some(token)
    }

    #[must_use]
    pub fn decode(&self, token: usize) -> Option<&OobRecord> {
        if !self.contains(token) {
            return None;
        }
        self.by_token.get(&token)
    }

    /// The pointer a token stands for; anything else is returned unchanged.
    #[must_use]
    pub fn actual_value(&self, value: usize) -> usize {
        self.decode(value).map_or(value, |r| r.pointer)
    }

    /// Drop every token derived from objects of `pool`.
    pub fn forget_pool(&mut self, pool: PoolId) {
        self.by_token.retain(|_, r| r.pool != Some(pool));
        let live = &self.by_token;
        self.by_pointer.retain(|_, token| live.contains_key(token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MmapPages;

    #[test]
    fn tokens_round_trip_and_dedupe() {
        let mut table = TokenTable::new(0x7000_0000, 4096);
        let obj = ObjectSpan::new(0x1000, 64);
        let t = table.rewrite(0x1000 + 100, obj, None, None).unwrap();
        assert!(table.contains(t));
        assert!(!obj.contains(t));
        assert_eq!(table.actual_value(t), 0x1000 + 100);
        assert_eq!(table.rewrite(0x1000 + 100, obj, None, None), Some(t));
        let t2 = table.rewrite(0x1000 + 64, obj, None, None).unwrap();
        assert_ne!(t, t2);
        assert_eq!(table.decode(t2).unwrap().object, obj);
        assert_eq!(table.issued(), 2);
    }

    #[test]
    fn non_tokens_pass_through() {
        let table = TokenTable::new(0x7000_0000, 4096);
        assert_eq!(table.actual_value(0x1234), 0x1234);
        assert_eq!(table.actual_value(0x7000_0010), 0x7000_0010);
        assert!(table.decode(0x7000_0000).is_none());
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut table = TokenTable::new(0x7000_0000, 2);
        let obj = ObjectSpan::new(0x1000, 8);
        assert!(table.rewrite(1, obj, None, None).is_some());
        assert!(table.rewrite(2, obj, None, None).is_some());
        assert!(table.rewrite(3, obj, None, None).is_none());
    }

    #[test]
    fn reserved_region_is_page_rounded() {
        let provider = MmapPages::new();
        let table = TokenTable::reserve(&provider, 10).unwrap();
        let (base, len) = table.region();
        assert_eq!(len, provider.page_size());
        assert!(table.contains(base));
        assert!(!table.contains(base + len));
        provider.unmap(base, len).unwrap();
    }

    #[test]
    fn forgetting_a_pool_drops_its_tokens() {
        let mut table = TokenTable::new(0x7000_0000, 64);
        let a = PoolId::from_raw(1).unwrap();
        let b = PoolId::from_raw(2).unwrap();
        let ta = table.rewrite(10, ObjectSpan::new(0, 8), Some(a), None).unwrap();
        let tb = table.rewrite(20, ObjectSpan::new(0, 8), Some(b), None).unwrap();
        table.forget_pool(a);
        assert_eq!(table.actual_value(ta), ta);
        assert_eq!(table.actual_value(tb), 20);
    }
}
