//! Backing pages shared between buffer descriptors and native packets.
//!
//! A [`Page`] carries an explicit reference count that models the release
//! obligation for its memory. Whoever holds the obligation calls
//! [`Page::put`] exactly once; a put on a page that already reached zero is a
//! double release and aborts the caller.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub type PageRef = triomphe::Arc<Page>;

#[derive(Debug, Default)]
struct PageCounters {
    allocated: AtomicU64,
    released: AtomicU64,
}

pub struct Page {
    id: u64,
    data: Box<[u8]>,
    refs: AtomicU32,
    counters: Arc<PageCounters>,
}

impl Page {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Takes an additional release obligation on the page.
    pub fn get(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one release obligation. Returns `true` when this was the last
    /// one and the page went back to its allocator.
    pub fn put(&self) -> bool {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
        match prev {
            Ok(1) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(_) => false,
            Err(_) => panic!("page {} released twice", self.id),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("refs", &self.refs())
            .finish()
    }
}

/// Hands out pages and tracks how many are still outstanding.
#[derive(Debug, Clone)]
pub struct PageAllocator {
    counters: Arc<PageCounters>,
    next_id: Arc<AtomicU64>,
    limit: Option<usize>,
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PageAllocator {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            counters: Arc::new(PageCounters::default()),
            next_id: Arc::new(AtomicU64::new(0)),
            limit,
        }
    }

    /// Allocates a page holding a copy of `data` with one release obligation.
    /// Returns `None` once the configured limit of outstanding pages is hit.
    pub fn alloc(&self, data: &[u8]) -> Option<PageRef> {
        if let Some(limit) = self.limit {
            if self.outstanding() >= limit as u64 {
                return None;
            }
        }
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        Some(triomphe::Arc::new(Page {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            data: data.into(),
            refs: AtomicU32::new(1),
            counters: self.counters.clone(),
        }))
    }

    pub fn allocated(&self) -> u64 {
        self.counters.allocated.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::Relaxed)
    }

    /// Pages whose release obligation has not been discharged yet.
    pub fn outstanding(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_releases_on_last_reference() {
        let alloc = PageAllocator::default();
        let page = alloc.alloc(b"abc").unwrap();
        page.get();
        assert!(!page.put());
        assert_eq!(alloc.outstanding(), 1);
        assert!(page.put());
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_put_is_fatal() {
        let alloc = PageAllocator::default();
        let page = alloc.alloc(b"abc").unwrap();
        page.put();
        page.put();
    }

    #[test]
    fn limit_caps_outstanding_pages() {
        let alloc = PageAllocator::new(Some(2));
        let a = alloc.alloc(&[0; 8]).unwrap();
        let _b = alloc.alloc(&[0; 8]).unwrap();
        assert!(alloc.alloc(&[0; 8]).is_none());
        a.put();
        assert!(alloc.alloc(&[0; 8]).is_some());
    }
}
