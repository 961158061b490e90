//! Shared test doubles: a mock native device that fabricates handles
//! and counts live objects, a mock allocator, and a mock queue that
//! records sparse-bind submissions.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use d12vk::memory::{Allocation, HeapAllocationDesc, MemoryAllocator};
use d12vk::native::{
    BufferCreateInfo, DescriptorCopy, DescriptorWrite, DeviceCaps, ImageCreateInfo,
    ImageViewCreateInfo, NativeDevice, SamplerCreateInfo,
};
use d12vk::queue::{QueueCategory, QueueHandle, QueueOps, SparseBindInfo};
use d12vk::resource::{HeapFlags, HeapProperties};
use d12vk::{D12Result, Device, NullObserver, StaticFormatTable};

pub const MOCK_IMAGE_SIZE: u64 = 0x20000;
pub const MOCK_IMAGE_ALIGNMENT: u64 = 0x10000;

#[derive(Default)]
pub struct Counters {
    pub live_buffers: AtomicUsize,
    pub live_images: AtomicUsize,
    pub live_buffer_views: AtomicUsize,
    pub live_image_views: AtomicUsize,
    pub live_samplers: AtomicUsize,
    pub live_pools: AtomicUsize,
    pub created_buffer_views: AtomicUsize,
    pub created_image_views: AtomicUsize,
    pub created_samplers: AtomicUsize,
    pub writes_issued: AtomicUsize,
    pub copies_issued: AtomicUsize,
}

pub struct MockNativeDevice {
    next_handle: AtomicU64,
    pub counters: Counters,
    pub buffer_device_address: bool,
    mip_tail_first_lod: u32,
    mip_tail_size: u64,
    metadata_tail_size: u64,
    buffer_sizes: Mutex<HashMap<u64, u64>>,
    pub writes: Mutex<Vec<DescriptorWrite>>,
    pub names: Mutex<Vec<(vk::ObjectType, String)>>,
}

impl MockNativeDevice {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            counters: Counters::default(),
            buffer_device_address: false,
            mip_tail_first_lod: u32::MAX,
            mip_tail_size: 0,
            metadata_tail_size: 0,
            buffer_sizes: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            names: Mutex::new(Vec::new()),
        }
    }

    pub fn with_device_address() -> Self {
        Self {
            buffer_device_address: true,
            ..Self::new()
        }
    }

    /// Report a packed mip tail starting at `first_lod`, `size` bytes at
    /// offset `MOCK_IMAGE_SIZE`.
    pub fn with_mip_tail(first_lod: u32, size: u64) -> Self {
        Self {
            mip_tail_first_lod: first_lod,
            mip_tail_size: size,
            ..Self::new()
        }
    }

    /// Report an additional metadata aspect of `size` bytes at offset
    /// `2 * MOCK_IMAGE_SIZE`.
    pub fn with_metadata_tail(size: u64) -> Self {
        Self {
            metadata_tail_size: size,
            ..Self::new()
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn writes_issued(&self) -> usize {
        self.counters.writes_issued.load(Ordering::SeqCst)
    }

    pub fn live_buffers(&self) -> usize {
        self.counters.live_buffers.load(Ordering::SeqCst)
    }

    pub fn live_images(&self) -> usize {
        self.counters.live_images.load(Ordering::SeqCst)
    }

    pub fn live_image_views(&self) -> usize {
        self.counters.live_image_views.load(Ordering::SeqCst)
    }

    pub fn created_image_views(&self) -> usize {
        self.counters.created_image_views.load(Ordering::SeqCst)
    }
}

impl NativeDevice for MockNativeDevice {
    fn create_buffer(&self, info: &BufferCreateInfo) -> D12Result<vk::Buffer> {
        let handle = self.handle();
        self.counters.live_buffers.fetch_add(1, Ordering::SeqCst);
        self.buffer_sizes.lock().insert(handle, info.size);
        Ok(vk::Buffer::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if buffer != vk::Buffer::null() {
            self.counters.live_buffers.fetch_sub(1, Ordering::SeqCst);
            self.buffer_sizes.lock().remove(&buffer.as_raw());
        }
    }

    fn create_image(&self, _info: &ImageCreateInfo) -> D12Result<vk::Image> {
        self.counters.live_images.fetch_add(1, Ordering::SeqCst);
        Ok(vk::Image::from_raw(self.handle()))
    }

    fn destroy_image(&self, image: vk::Image) {
        if image != vk::Image::null() {
            self.counters.live_images.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .buffer_sizes
            .lock()
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: 0x100,
            memory_type_bits: u32::MAX,
        }
    }

    fn image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: MOCK_IMAGE_SIZE,
            alignment: MOCK_IMAGE_ALIGNMENT,
            memory_type_bits: u32::MAX,
        }
    }

    fn image_sparse_memory_requirements(
        &self,
        _image: vk::Image,
    ) -> Vec<vk::SparseImageMemoryRequirements> {
        let granularity = vk::Extent3D {
            width: 128,
            height: 128,
            depth: 1,
        };
        let mut requirements = vec![vk::SparseImageMemoryRequirements {
            format_properties: vk::SparseImageFormatProperties {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                image_granularity: granularity,
                flags: vk::SparseImageFormatFlags::empty(),
            },
            image_mip_tail_first_lod: self.mip_tail_first_lod,
            image_mip_tail_size: self.mip_tail_size,
            image_mip_tail_offset: MOCK_IMAGE_SIZE,
            image_mip_tail_stride: 0,
        }];
        if self.metadata_tail_size > 0 {
            requirements.push(vk::SparseImageMemoryRequirements {
                format_properties: vk::SparseImageFormatProperties {
                    aspect_mask: vk::ImageAspectFlags::METADATA,
                    image_granularity: granularity,
                    flags: vk::SparseImageFormatFlags::empty(),
                },
                image_mip_tail_first_lod: 0,
                image_mip_tail_size: self.metadata_tail_size,
                image_mip_tail_offset: 2 * MOCK_IMAGE_SIZE,
                image_mip_tail_stride: 0,
            });
        }
        requirements
    }

    fn bind_buffer_memory(
        &self,
        _buffer: vk::Buffer,
        _memory: vk::DeviceMemory,
        _offset: u64,
    ) -> D12Result<()> {
        Ok(())
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: u64,
    ) -> D12Result<()> {
        Ok(())
    }

    fn create_buffer_view(
        &self,
        _buffer: vk::Buffer,
        _format: vk::Format,
        _offset: u64,
        _range: u64,
    ) -> D12Result<vk::BufferView> {
        self.counters
            .live_buffer_views
            .fetch_add(1, Ordering::SeqCst);
        self.counters
            .created_buffer_views
            .fetch_add(1, Ordering::SeqCst);
        Ok(vk::BufferView::from_raw(self.handle()))
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        if view != vk::BufferView::null() {
            self.counters
                .live_buffer_views
                .fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn create_image_view(&self, _info: &ImageViewCreateInfo) -> D12Result<vk::ImageView> {
        self.counters
            .live_image_views
            .fetch_add(1, Ordering::SeqCst);
        self.counters
            .created_image_views
            .fetch_add(1, Ordering::SeqCst);
        Ok(vk::ImageView::from_raw(self.handle()))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if view != vk::ImageView::null() {
            self.counters
                .live_image_views
                .fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn create_sampler(&self, _info: &SamplerCreateInfo) -> D12Result<vk::Sampler> {
        self.counters.live_samplers.fetch_add(1, Ordering::SeqCst);
        self.counters
            .created_samplers
            .fetch_add(1, Ordering::SeqCst);
        Ok(vk::Sampler::from_raw(self.handle()))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        if sampler != vk::Sampler::null() {
            self.counters.live_samplers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[(vk::DescriptorType, u32)],
        _max_sets: u32,
    ) -> D12Result<vk::DescriptorPool> {
        self.counters.live_pools.fetch_add(1, Ordering::SeqCst);
        Ok(vk::DescriptorPool::from_raw(self.handle()))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if pool != vk::DescriptorPool::null() {
            self.counters.live_pools.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _ty: vk::DescriptorType,
        _capacity: u32,
    ) -> D12Result<vk::DescriptorSet> {
        Ok(vk::DescriptorSet::from_raw(self.handle()))
    }

    fn update_descriptors(&self, writes: &[DescriptorWrite], copies: &[DescriptorCopy]) {
        self.counters
            .writes_issued
            .fetch_add(writes.len(), Ordering::SeqCst);
        self.counters
            .copies_issued
            .fetch_add(copies.len(), Ordering::SeqCst);
        self.writes.lock().extend_from_slice(writes);
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> Option<u64> {
        self.buffer_device_address
            .then(|| 0x10_0000_0000 + buffer.as_raw() * 0x1000_0000)
    }

    fn set_object_name(&self, object_type: vk::ObjectType, _handle: u64, name: &str) {
        self.names.lock().push((object_type, name.to_string()));
    }
}

pub struct MockAllocator {
    next_memory: AtomicU64,
    pub live_allocations: AtomicUsize,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self {
            next_memory: AtomicU64::new(1),
            live_allocations: AtomicUsize::new(0),
        }
    }

    pub fn live(&self) -> usize {
        self.live_allocations.load(Ordering::SeqCst)
    }

    fn make(&self, size: u64) -> Allocation {
        self.live_allocations.fetch_add(1, Ordering::SeqCst);
        Allocation::new(
            vk::DeviceMemory::from_raw(self.next_memory.fetch_add(1, Ordering::Relaxed)),
            0,
            size,
            false,
            None,
            Some(Box::new(())),
        )
    }
}

impl MemoryAllocator for MockAllocator {
    fn allocate(
        &self,
        requirements: &vk::MemoryRequirements,
        _heap_properties: &HeapProperties,
        _heap_flags: HeapFlags,
        _dedicated: bool,
    ) -> D12Result<Allocation> {
        Ok(self.make(requirements.size))
    }

    fn allocate_heap(&self, desc: &HeapAllocationDesc) -> D12Result<Allocation> {
        Ok(self.make(desc.size))
    }

    fn free(&self, allocation: Allocation) {
        if allocation.is_owned() {
            self.live_allocations.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub struct MockQueues {
    pub submissions: Mutex<Vec<SparseBindInfo>>,
}

impl MockQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

impl QueueOps for MockQueues {
    fn acquire_queue(&self, _category: QueueCategory) -> QueueHandle {
        QueueHandle(1)
    }

    fn submit_sparse_bind(&self, _queue: QueueHandle, binds: &SparseBindInfo) -> D12Result<()> {
        self.submissions.lock().push(binds.clone());
        Ok(())
    }

    fn wait_idle(&self, _queue: QueueHandle) -> D12Result<()> {
        Ok(())
    }

    fn release_queue(&self, _queue: QueueHandle) {}
}

pub struct TestContext {
    pub device: Arc<Device>,
    pub native: Arc<MockNativeDevice>,
    pub allocator: Arc<MockAllocator>,
    pub queues: Arc<MockQueues>,
}

pub fn test_device(caps: DeviceCaps) -> TestContext {
    test_device_with(caps, MockNativeDevice::new())
}

pub fn test_device_with(caps: DeviceCaps, native: MockNativeDevice) -> TestContext {
    let native = Arc::new(native);
    let allocator = Arc::new(MockAllocator::new());
    let queues = Arc::new(MockQueues::new());
    let device = Device::new(
        native.clone(),
        caps,
        Arc::new(StaticFormatTable),
        allocator.clone(),
        queues.clone(),
        Arc::new(NullObserver),
    );
    TestContext {
        device,
        native,
        allocator,
        queues,
    }
}
