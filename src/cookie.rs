//! Process-unique cookie allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// A process-unique integer identity assigned to resources, views and heaps.
///
/// Cookies are used for debug naming, descriptor deduplication comparisons
/// and QA instrumentation. They are never reused and never interpreted as
/// an address. Cookie 0 is reserved to mean "unbound / null".
pub type Cookie = u64;

/// Monotonic cookie generator shared by everything a device creates.
#[derive(Debug)]
pub struct CookieAllocator {
    next: AtomicU64,
}

impl CookieAllocator {
    pub fn new() -> Self {
        // 0 is the null cookie.
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next cookie. Never returns 0.
    pub fn allocate(&self) -> Cookie {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for CookieAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_cookies_are_unique_and_nonzero() {
        let alloc = CookieAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_concurrent_allocation_never_collides() {
        let alloc = Arc::new(CookieAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| alloc.allocate()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len());
    }
}
