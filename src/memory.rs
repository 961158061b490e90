//! Memory allocator boundary and device-memory budget accounting.
//!
//! Suballocation itself is an external collaborator; the core consumes an
//! allocate/free/slice contract. The production implementation wraps the
//! `gpu-allocator` crate the same way the Vulkan backend's allocator
//! module does.

use std::any::Any;
use std::collections::HashMap;
use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator};
use parking_lot::Mutex;

use crate::error::{D12Error, D12Result};
use crate::format::is_cpu_accessible_heap;
use crate::resource::{HeapFlags, HeapProperties, HeapType};

/// A block of device memory handed out by the allocator.
///
/// `backing` carries the allocator's own bookkeeping record for owned
/// allocations; sliced sub-views carry `None` and must not be freed.
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub dedicated: bool,
    mapped_ptr: Option<NonNull<u8>>,
    backing: Option<Box<dyn Any + Send>>,
}

// Mapped pointers refer to persistently-mapped device memory, which is
// safe to address from any thread; synchronization of the contents is the
// caller's responsibility.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("dedicated", &self.dedicated)
            .finish()
    }
}

impl Allocation {
    pub fn new(
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
        dedicated: bool,
        mapped_ptr: Option<NonNull<u8>>,
        backing: Option<Box<dyn Any + Send>>,
    ) -> Self {
        Self {
            memory,
            offset,
            size,
            dedicated,
            mapped_ptr,
            backing,
        }
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    /// Whether this allocation owns its memory (slices do not).
    pub fn is_owned(&self) -> bool {
        self.backing.is_some() || self.dedicated
    }

    pub(crate) fn take_backing(&mut self) -> Option<Box<dyn Any + Send>> {
        self.backing.take()
    }
}

/// Resource-heap creation request, consumed by `allocate_heap`.
#[derive(Debug, Clone, Copy)]
pub struct HeapAllocationDesc {
    pub size: u64,
    pub alignment: u64,
    pub properties: HeapProperties,
    pub flags: HeapFlags,
}

/// Memory allocator collaborator.
pub trait MemoryAllocator: Send + Sync {
    /// Satisfy `requirements` for a resource in `heap_properties` memory.
    /// `dedicated` requests a dedicated device allocation.
    fn allocate(
        &self,
        requirements: &vk::MemoryRequirements,
        heap_properties: &HeapProperties,
        heap_flags: HeapFlags,
        dedicated: bool,
    ) -> D12Result<Allocation>;

    /// Whole-heap variant used by resource heaps and committed buffers.
    fn allocate_heap(&self, desc: &HeapAllocationDesc) -> D12Result<Allocation>;

    fn free(&self, allocation: Allocation);

    /// Non-owning sub-view of a heap allocation at `offset` from its base.
    fn slice(&self, allocation: &Allocation, offset: u64, size: u64) -> Allocation {
        let mapped_ptr = allocation
            .mapped_ptr
            .map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) });
        Allocation {
            memory: allocation.memory,
            offset: allocation.offset + offset,
            size,
            dedicated: false,
            mapped_ptr,
            backing: None,
        }
    }
}

/// Per-heap-type budget ceilings and usage counters.
///
/// The check and the charge happen under one lock so a constrained memory
/// type can never be overcommitted by concurrent allocations.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    entries: Mutex<HashMap<HeapType, BudgetEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct BudgetEntry {
    ceiling: u64,
    used: u64,
}

impl MemoryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the budget ceiling for a heap type. Defaults to unlimited.
    pub fn set_ceiling(&self, heap_type: HeapType, ceiling: u64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(heap_type).or_insert(BudgetEntry {
            ceiling: u64::MAX,
            used: 0,
        });
        entry.ceiling = ceiling;
    }

    pub fn charge(&self, heap_type: HeapType, size: u64) -> D12Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(heap_type).or_insert(BudgetEntry {
            ceiling: u64::MAX,
            used: 0,
        });
        if entry.used.saturating_add(size) > entry.ceiling {
            log::warn!(
                "Memory budget exceeded for {:?}: used {} + {} > ceiling {}.",
                heap_type,
                entry.used,
                size,
                entry.ceiling
            );
            return Err(D12Error::OutOfMemory);
        }
        entry.used += size;
        Ok(())
    }

    pub fn release(&self, heap_type: HeapType, size: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&heap_type) {
            entry.used = entry.used.saturating_sub(size);
        }
    }

    pub fn used(&self, heap_type: HeapType) -> u64 {
        self.entries
            .lock()
            .get(&heap_type)
            .map(|e| e.used)
            .unwrap_or(0)
    }
}

fn memory_location_for(heap_properties: &HeapProperties) -> gpu_allocator::MemoryLocation {
    match heap_properties.heap_type {
        HeapType::Default => gpu_allocator::MemoryLocation::GpuOnly,
        HeapType::Upload => gpu_allocator::MemoryLocation::CpuToGpu,
        HeapType::Readback => gpu_allocator::MemoryLocation::GpuToCpu,
        HeapType::Custom => {
            if is_cpu_accessible_heap(heap_properties) {
                gpu_allocator::MemoryLocation::CpuToGpu
            } else {
                gpu_allocator::MemoryLocation::GpuOnly
            }
        }
    }
}

/// Production allocator backed by the `gpu-allocator` crate.
pub struct GpuAllocator {
    allocator: Mutex<Allocator>,
}

impl GpuAllocator {
    pub fn new(allocator: Allocator) -> Self {
        Self {
            allocator: Mutex::new(allocator),
        }
    }

    fn allocate_inner(
        &self,
        requirements: &vk::MemoryRequirements,
        heap_properties: &HeapProperties,
        dedicated: bool,
        linear: bool,
    ) -> D12Result<Allocation> {
        let allocation = {
            let mut allocator = self.allocator.lock();
            allocator
                .allocate(&AllocationCreateDesc {
                    name: "d12vk",
                    requirements: *requirements,
                    location: memory_location_for(heap_properties),
                    linear,
                    // Dedicated allocations need the resource handle, which
                    // this boundary does not carry; the managed scheme
                    // falls back to a dedicated block for large requests.
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| {
                    log::warn!("Failed to allocate device memory: {}", e);
                    D12Error::OutOfMemory
                })?
        };

        let memory = unsafe { allocation.memory() };
        Ok(Allocation::new(
            memory,
            allocation.offset(),
            allocation.size(),
            dedicated,
            allocation.mapped_ptr().map(|p| p.cast()),
            Some(Box::new(allocation)),
        ))
    }
}

impl MemoryAllocator for GpuAllocator {
    fn allocate(
        &self,
        requirements: &vk::MemoryRequirements,
        heap_properties: &HeapProperties,
        _heap_flags: HeapFlags,
        dedicated: bool,
    ) -> D12Result<Allocation> {
        self.allocate_inner(requirements, heap_properties, dedicated, false)
    }

    fn allocate_heap(&self, desc: &HeapAllocationDesc) -> D12Result<Allocation> {
        let requirements = vk::MemoryRequirements {
            size: desc.size,
            alignment: desc.alignment,
            memory_type_bits: u32::MAX,
        };
        self.allocate_inner(&requirements, &desc.properties, false, true)
    }

    fn free(&self, mut allocation: Allocation) {
        let Some(backing) = allocation.take_backing() else {
            // Slices are non-owning.
            return;
        };
        let Ok(backing) = backing.downcast::<gpu_allocator::vulkan::Allocation>() else {
            log::error!("Foreign allocation passed to GpuAllocator::free.");
            return;
        };
        if let Err(e) = self.allocator.lock().free(*backing) {
            log::error!("Failed to free device memory: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_charge_and_release() {
        let budget = MemoryBudget::new();
        budget.set_ceiling(HeapType::Upload, 1000);

        budget.charge(HeapType::Upload, 600).unwrap();
        assert_eq!(budget.used(HeapType::Upload), 600);

        // Exceeding the ceiling fails and leaves usage unchanged.
        assert_eq!(
            budget.charge(HeapType::Upload, 500),
            Err(D12Error::OutOfMemory)
        );
        assert_eq!(budget.used(HeapType::Upload), 600);

        budget.release(HeapType::Upload, 600);
        budget.charge(HeapType::Upload, 1000).unwrap();
    }

    #[test]
    fn test_unbudgeted_heap_type_is_unlimited() {
        let budget = MemoryBudget::new();
        budget.charge(HeapType::Default, u64::MAX / 2).unwrap();
    }
}
