//! Process-wide GPU virtual-address to resource lookup.
//!
//! Raw-address descriptor writes (CBVs, acceleration structures) carry a
//! bare device address that must be resolved back to the owning buffer.
//! Devices that cannot report native buffer addresses get synthetic
//! addresses carved out of a reserved range instead.

use std::collections::BTreeMap;

use ash::vk;
use parking_lot::Mutex;

use crate::cookie::Cookie;

/// Base of the synthetic address range. High enough to never collide with
/// real device addresses handed out by common drivers.
const SYNTHETIC_VA_BASE: u64 = 0x8000_0000_0000;

/// Resolved owner of a device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRef {
    pub vk_buffer: vk::Buffer,
    /// Base device address of the buffer.
    pub va: u64,
    pub size: u64,
    pub cookie: Cookie,
}

#[derive(Debug, Default)]
struct SyntheticVaAllocator {
    next: u64,
    free_list: Vec<(u64, u64)>,
}

/// Address → resource map plus the synthetic VA allocator.
#[derive(Debug)]
pub struct VaMap {
    map: Mutex<BTreeMap<u64, ResourceRef>>,
    synthetic: Mutex<SyntheticVaAllocator>,
}

impl VaMap {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
            synthetic: Mutex::new(SyntheticVaAllocator {
                next: SYNTHETIC_VA_BASE,
                free_list: Vec::new(),
            }),
        }
    }

    pub fn insert(&self, entry: ResourceRef) {
        let prev = self.map.lock().insert(entry.va, entry);
        if prev.is_some() {
            log::error!("Overlapping VA registration at {:#x}.", entry.va);
        }
    }

    pub fn remove(&self, va: u64) {
        self.map.lock().remove(&va);
    }

    /// Resolve an address to the resource whose range contains it.
    pub fn deref(&self, address: u64) -> Option<ResourceRef> {
        let map = self.map.lock();
        let (_, entry) = map.range(..=address).next_back()?;
        if address < entry.va + entry.size {
            Some(*entry)
        } else {
            None
        }
    }

    /// Allocate a synthetic device address range of `size` bytes.
    pub fn alloc_synthetic(&self, size: u64) -> u64 {
        let mut synthetic = self.synthetic.lock();
        if let Some(pos) = synthetic.free_list.iter().position(|&(_, s)| s == size) {
            return synthetic.free_list.swap_remove(pos).0;
        }
        let va = synthetic.next;
        // Keep 64 KiB alignment so placed-buffer arithmetic stays valid.
        synthetic.next += (size + 0xffff) & !0xffff;
        va
    }

    pub fn free_synthetic(&self, va: u64, size: u64) {
        self.synthetic.lock().free_list.push((va, size));
    }
}

impl Default for VaMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn entry(va: u64, size: u64, cookie: u64) -> ResourceRef {
        ResourceRef {
            vk_buffer: vk::Buffer::from_raw(cookie),
            va,
            size,
            cookie,
        }
    }

    #[test]
    fn test_deref_resolves_interior_addresses() {
        let map = VaMap::new();
        map.insert(entry(0x10000, 0x1000, 1));
        map.insert(entry(0x20000, 0x1000, 2));

        assert_eq!(map.deref(0x10000).unwrap().cookie, 1);
        assert_eq!(map.deref(0x10fff).unwrap().cookie, 1);
        assert!(map.deref(0x11000).is_none());
        assert_eq!(map.deref(0x20800).unwrap().cookie, 2);

        map.remove(0x10000);
        assert!(map.deref(0x10000).is_none());
    }

    #[test]
    fn test_synthetic_va_reuse() {
        let map = VaMap::new();
        let a = map.alloc_synthetic(0x4000);
        let b = map.alloc_synthetic(0x4000);
        assert_ne!(a, b);
        assert_eq!(a % 0x10000, 0);

        map.free_synthetic(a, 0x4000);
        let c = map.alloc_synthetic(0x4000);
        assert_eq!(a, c);
    }
}
