//! The translation-layer device context.
//!
//! One `Device` per native device. It owns the collaborator boundaries,
//! the process-scoped bookkeeping (cookies, VA map, memory budget) and
//! the bindless dispatch plan built once from the capability snapshot.

use std::sync::Arc;

use ash::vk;

use crate::cookie::CookieAllocator;
use crate::descriptor::BindlessState;
use crate::error::D12Result;
use crate::format::FormatTable;
use crate::memory::{Allocation, HeapAllocationDesc, MemoryAllocator, MemoryBudget};
use crate::native::{DescriptorPayload, DescriptorWrite, DeviceCaps, NativeDevice};
use crate::observer::QaObserver;
use crate::queue::QueueOps;
use crate::resource::{HeapFlags, HeapProperties, HeapType};
use crate::sampler::{SamplerCache, SamplerDesc, SamplerPoolList};
use crate::va_map::VaMap;
use crate::view::ViewMap;

pub struct Device {
    native: Arc<dyn NativeDevice>,
    pub caps: DeviceCaps,
    formats: Arc<dyn FormatTable>,
    allocator: Arc<dyn MemoryAllocator>,
    queues: Arc<dyn QueueOps>,
    observer: Arc<dyn QaObserver>,
    pub cookies: CookieAllocator,
    pub va_map: VaMap,
    pub budget: MemoryBudget,
    bindless: BindlessState,
    sampler_cache: SamplerCache,
    sampler_pools: SamplerPoolList,
    /// Device-scoped view map holding native samplers used by
    /// descriptor-heap sampler writes.
    pub sampler_map: ViewMap,
}

impl Device {
    pub fn new(
        native: Arc<dyn NativeDevice>,
        caps: DeviceCaps,
        formats: Arc<dyn FormatTable>,
        allocator: Arc<dyn MemoryAllocator>,
        queues: Arc<dyn QueueOps>,
        observer: Arc<dyn QaObserver>,
    ) -> Arc<Self> {
        let bindless = BindlessState::new(&caps);
        log::info!(
            "Creating device: mutable_descriptor_type={}, buffer_device_address={}, \
             sparse_binding={}.",
            caps.mutable_descriptor_type,
            caps.buffer_device_address,
            caps.sparse_binding
        );
        Arc::new(Self {
            native,
            caps,
            formats,
            allocator,
            queues,
            observer,
            cookies: CookieAllocator::new(),
            va_map: VaMap::new(),
            budget: MemoryBudget::new(),
            bindless,
            sampler_cache: SamplerCache::new(),
            sampler_pools: SamplerPoolList::new(64),
            sampler_map: ViewMap::new(),
        })
    }

    pub fn native(&self) -> &dyn NativeDevice {
        self.native.as_ref()
    }

    pub fn formats(&self) -> &dyn FormatTable {
        self.formats.as_ref()
    }

    pub fn queues(&self) -> &dyn QueueOps {
        self.queues.as_ref()
    }

    pub fn observer(&self) -> &dyn QaObserver {
        self.observer.as_ref()
    }

    pub fn bindless(&self) -> &BindlessState {
        &self.bindless
    }

    pub fn sampler_cache(&self) -> &SamplerCache {
        &self.sampler_cache
    }

    pub fn sampler_pools(&self) -> &SamplerPoolList {
        &self.sampler_pools
    }

    /// Budget-checked memory allocation. The budget is charged before the
    /// allocator runs so concurrent requests cannot overcommit a
    /// constrained memory type.
    pub fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        heap_properties: &HeapProperties,
        heap_flags: HeapFlags,
        dedicated: bool,
    ) -> D12Result<Allocation> {
        self.budget
            .charge(heap_properties.heap_type, requirements.size)?;
        match self
            .allocator
            .allocate(requirements, heap_properties, heap_flags, dedicated)
        {
            Ok(allocation) => Ok(allocation),
            Err(e) => {
                self.budget
                    .release(heap_properties.heap_type, requirements.size);
                Err(e)
            }
        }
    }

    /// Whole-heap variant used by resource heaps and committed buffers.
    pub fn allocate_heap_memory(&self, desc: &HeapAllocationDesc) -> D12Result<Allocation> {
        self.budget.charge(desc.properties.heap_type, desc.size)?;
        match self.allocator.allocate_heap(desc) {
            Ok(allocation) => Ok(allocation),
            Err(e) => {
                self.budget.release(desc.properties.heap_type, desc.size);
                Err(e)
            }
        }
    }

    /// Release `allocation`, uncharging the budget for owned memory.
    /// Slices of heap allocations release nothing.
    pub fn free_memory(&self, allocation: Allocation, heap_type: HeapType) {
        if allocation.is_owned() {
            self.budget.release(heap_type, allocation.size);
        }
        self.allocator.free(allocation);
    }

    /// Non-owning sub-view of a heap allocation.
    pub fn slice_memory(&self, allocation: &Allocation, offset: u64, size: u64) -> Allocation {
        self.allocator.slice(allocation, offset, size)
    }

    /// Static (immutable) sampler: a cached native sampler plus its own
    /// single-descriptor set for fixed-binding use.
    pub fn create_static_sampler(
        &self,
        desc: &SamplerDesc,
    ) -> D12Result<(vk::Sampler, vk::DescriptorSet)> {
        let sampler = self.sampler_cache.get_or_create(self.native(), desc)?;
        let set = self.sampler_pools.allocate_set(self.native())?;
        self.native().update_descriptors(
            &[DescriptorWrite {
                set,
                binding: 0,
                array_element: 0,
                ty: vk::DescriptorType::SAMPLER,
                payload: DescriptorPayload::Sampler(sampler),
            }],
            &[],
        );
        Ok((sampler, set))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.sampler_map.destroy(self.native.as_ref());
        self.sampler_cache.destroy(self.native.as_ref());
        self.sampler_pools.destroy(self.native.as_ref());
    }
}
