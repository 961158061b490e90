//! Queue submission boundary, used only for sparse binding operations.

use ash::vk;

use crate::error::D12Result;

/// Which queue family category to acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCategory {
    Graphics,
    SparseBinding,
}

/// Opaque queue handle issued by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHandle(pub u64);

/// One opaque (byte-range) memory bind.
#[derive(Debug, Clone, Copy)]
pub struct SparseMemoryBind {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: vk::DeviceMemory,
    pub memory_offset: u64,
    /// Bind targets the image's metadata aspect.
    pub metadata: bool,
}

/// One image (subresource region) memory bind.
#[derive(Debug, Clone, Copy)]
pub struct SparseImageBind {
    pub aspect_mask: vk::ImageAspectFlags,
    pub mip_level: u32,
    pub array_layer: u32,
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub memory: vk::DeviceMemory,
    pub memory_offset: u64,
}

/// A batched sparse-binding submission for one resource.
#[derive(Debug, Clone, Default)]
pub struct SparseBindInfo {
    pub buffer: Option<vk::Buffer>,
    pub image: Option<vk::Image>,
    /// Byte-range binds: buffers, packed mip tails, metadata aspects.
    pub opaque_binds: Vec<SparseMemoryBind>,
    /// Standard-mip image region binds.
    pub image_binds: Vec<SparseImageBind>,
}

/// Queue/submission collaborator.
pub trait QueueOps: Send + Sync {
    fn acquire_queue(&self, category: QueueCategory) -> QueueHandle;
    fn submit_sparse_bind(&self, queue: QueueHandle, binds: &SparseBindInfo) -> D12Result<()>;
    fn wait_idle(&self, queue: QueueHandle) -> D12Result<()>;
    fn release_queue(&self, queue: QueueHandle);
}
