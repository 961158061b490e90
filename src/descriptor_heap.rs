//! Descriptor heaps: the fixed-capacity slot array, its backing native
//! descriptor sets, and the auxiliary side buffers some backends need
//! (raw device-address table, bound-range table).

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::cookie::Cookie;
use crate::descriptor::{DescriptorSlot, NullTemplate};
use crate::device::Device;
use crate::error::{D12Error, D12Result};
use crate::memory::{Allocation, HeapAllocationDesc};
use crate::native::BufferCreateInfo;
use crate::resource::{HeapFlags, HeapProperties, HeapType};

/// Logical heap kind. Render-target and depth-stencil heaps have no
/// native backing; they are CPU-only bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    pub fn is_shader_visible_capable(self) -> bool {
        matches!(self, DescriptorHeapKind::CbvSrvUav | DescriptorHeapKind::Sampler)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// Handle stride in the synthetic GPU-visible address space.
pub const DESCRIPTOR_INCREMENT: u64 = 32;

/// An entry in the bound-range side table, read back by shaders that
/// need a descriptor's logical offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct BoundRange {
    pub offset: u64,
    pub length: u64,
}

/// A side table: a host mirror that is also written through to a mapped
/// native buffer when the heap is shader visible.
pub struct DataBuffer<T: Copy + Default> {
    host: Mutex<Vec<T>>,
    native: Option<(vk::Buffer, Allocation)>,
    mapped: Option<NonNull<T>>,
}

// The mapped pointer targets persistently-mapped upload memory.
unsafe impl<T: Copy + Default + Send> Send for DataBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for DataBuffer<T> {}

impl<T: Copy + Default> DataBuffer<T> {
    /// Host-only table.
    pub fn host_only(len: u32) -> Self {
        Self {
            host: Mutex::new(vec![T::default(); len as usize]),
            native: None,
            mapped: None,
        }
    }

    /// Table backed by a mapped native buffer for shader access.
    pub fn device_backed(device: &Device, len: u32) -> D12Result<Self> {
        let size = (len as usize * std::mem::size_of::<T>()) as u64;
        let buffer = device.native().create_buffer(&BufferCreateInfo {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            flags: vk::BufferCreateFlags::empty(),
        })?;
        let requirements = device.native().buffer_memory_requirements(buffer);
        let allocation = device
            .allocate_heap_memory(&HeapAllocationDesc {
                size: requirements.size,
                alignment: requirements.alignment,
                properties: HeapProperties::new(HeapType::Upload),
                flags: HeapFlags::empty(),
            })
            .inspect_err(|_| device.native().destroy_buffer(buffer))?;
        if let Err(e) =
            device
                .native()
                .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
        {
            device.free_memory(allocation, HeapType::Upload);
            device.native().destroy_buffer(buffer);
            return Err(e);
        }
        let mapped = allocation.mapped_ptr().map(NonNull::cast);
        Ok(Self {
            host: Mutex::new(vec![T::default(); len as usize]),
            native: Some((buffer, allocation)),
            mapped,
        })
    }

    pub fn write(&self, index: u32, value: T) {
        let mut host = self.host.lock();
        host[index as usize] = value;
        if let Some(mapped) = self.mapped {
            unsafe { mapped.as_ptr().add(index as usize).write_volatile(value) };
        }
    }

    pub fn read(&self, index: u32) -> T {
        self.host.lock()[index as usize]
    }

    pub fn copy_range(&self, dst_index: u32, src: &DataBuffer<T>, src_index: u32, count: u32) {
        for i in 0..count {
            let value = src.read(src_index + i);
            self.write(dst_index + i, value);
        }
    }

    fn destroy(&mut self, device: &Device) {
        if let Some((buffer, allocation)) = self.native.take() {
            device.free_memory(allocation, HeapType::Upload);
            device.native().destroy_buffer(buffer);
        }
    }
}

pub struct DescriptorHeap {
    pub(crate) device: Arc<Device>,
    pub desc: DescriptorHeapDesc,
    pub cookie: Cookie,
    pub(crate) pool: Option<vk::DescriptorPool>,
    /// `(set-info index into the bindless plan, native set)` pairs.
    pub(crate) sets: Vec<(usize, vk::DescriptorSet)>,
    pub(crate) slots: Vec<DescriptorSlot>,
    pub(crate) null_template: NullTemplate,
    pub(crate) raw_va_table: Option<DataBuffer<u64>>,
    pub(crate) buffer_ranges: Option<DataBuffer<BoundRange>>,
    /// Synthetic GPU-visible base address; 0 for CPU-only heaps.
    pub gpu_base_va: u64,
}

impl DescriptorHeap {
    pub fn create(device: &Arc<Device>, desc: &DescriptorHeapDesc) -> D12Result<Arc<Self>> {
        if desc.capacity == 0 {
            return Err(D12Error::InvalidArgument("zero-capacity heap".into()));
        }
        if desc.shader_visible && !desc.kind.is_shader_visible_capable() {
            return Err(D12Error::InvalidArgument(
                "RTV/DSV heaps cannot be shader visible".into(),
            ));
        }

        let slots = (0..desc.capacity).map(|_| DescriptorSlot::new()).collect();
        let mut heap = Self {
            device: Arc::clone(device),
            desc: *desc,
            cookie: device.cookies.allocate(),
            pool: None,
            sets: Vec::new(),
            slots,
            null_template: NullTemplate::default(),
            raw_va_table: None,
            buffer_ranges: None,
            gpu_base_va: 0,
        };

        let bindless = device.bindless();
        let set_infos = bindless.set_infos_for(desc.kind);
        if !set_infos.is_empty() {
            let pool_sizes: Vec<_> = set_infos
                .iter()
                .map(|&index| (bindless.set_info(index).ty, desc.capacity))
                .collect();
            let pool = device
                .native()
                .create_descriptor_pool(&pool_sizes, set_infos.len() as u32)?;
            heap.pool = Some(pool);
            for &index in &set_infos {
                let info = bindless.set_info(index);
                match device
                    .native()
                    .allocate_descriptor_set(pool, info.ty, desc.capacity)
                {
                    Ok(set) => heap.sets.push((index, set)),
                    Err(e) => {
                        heap.teardown();
                        return Err(e);
                    }
                }
            }

            heap.null_template = NullTemplate::build(bindless, &heap.sets);
            if desc.kind == DescriptorHeapKind::CbvSrvUav {
                if device.caps.raw_va_aux_buffer {
                    heap.raw_va_table = Some(heap.side_table(device, desc)?);
                }
                if device.caps.typed_offset_buffer || device.caps.ssbo_offset_buffer {
                    heap.buffer_ranges = Some(heap.side_table(device, desc)?);
                }
            }

            heap.initialize_null_slots();
        }

        if desc.shader_visible {
            heap.gpu_base_va = device
                .va_map
                .alloc_synthetic(u64::from(desc.capacity) * DESCRIPTOR_INCREMENT);
        }

        Ok(Arc::new(heap))
    }

    fn side_table<T: Copy + Default>(
        &self,
        device: &Arc<Device>,
        desc: &DescriptorHeapDesc,
    ) -> D12Result<DataBuffer<T>> {
        if desc.shader_visible {
            DataBuffer::device_backed(device, desc.capacity)
        } else {
            Ok(DataBuffer::host_only(desc.capacity))
        }
    }

    pub fn capacity(&self) -> u32 {
        self.desc.capacity
    }

    /// Bound-range side-table entry for `slot`, when the heap carries
    /// the table.
    pub fn bound_range_entry(&self, slot: u32) -> Option<BoundRange> {
        self.buffer_ranges.as_ref().map(|table| table.read(slot))
    }

    /// GPU-visible address of `slot`, for shader-visible heaps.
    pub fn gpu_address(&self, slot: u32) -> u64 {
        if self.gpu_base_va == 0 {
            return 0;
        }
        self.gpu_base_va + u64::from(slot) * DESCRIPTOR_INCREMENT
    }

    /// Slot index corresponding to a GPU-visible address from this heap.
    pub fn slot_from_gpu_address(&self, address: u64) -> Option<u32> {
        if self.gpu_base_va == 0 || address < self.gpu_base_va {
            return None;
        }
        let slot = (address - self.gpu_base_va) / DESCRIPTOR_INCREMENT;
        (slot < u64::from(self.desc.capacity)).then_some(slot as u32)
    }

    fn teardown(&mut self) {
        // Sets are freed implicitly with the pool.
        if let Some(pool) = self.pool.take() {
            self.device.native().destroy_descriptor_pool(pool);
        }
        self.sets.clear();
        if let Some(mut table) = self.raw_va_table.take() {
            table.destroy(&self.device);
        }
        if let Some(mut table) = self.buffer_ranges.take() {
            table.destroy(&self.device);
        }
        if self.gpu_base_va != 0 {
            self.device.va_map.free_synthetic(
                self.gpu_base_va,
                u64::from(self.desc.capacity) * DESCRIPTOR_INCREMENT,
            );
            self.gpu_base_va = 0;
        }
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        self.teardown();
    }
}
