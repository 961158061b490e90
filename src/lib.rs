//! # d12vk
//!
//! A D3D12-style resource, view and descriptor management layer over
//! Vulkan.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`Device`] - Process-scoped device context owning the collaborator
//!   boundaries and shared bookkeeping
//! - [`Resource`] - Committed, placed and reserved (sparse) resources
//!   with two-level reference counting
//! - [`ViewMap`] - Per-resource deduplicating cache of native views
//! - [`DescriptorHeap`] - Fixed-capacity descriptor heaps with bindless
//!   set dispatch, null-descriptor replay and slot copies
//! - Boundary traits ([`NativeDevice`], [`MemoryAllocator`],
//!   [`FormatTable`], [`QueueOps`], [`QaObserver`]) so the core runs
//!   against a real device or a test double
//!
//! ## Example
//!
//! ```ignore
//! use d12vk::{Device, Resource, ResourceDesc, ResourceState};
//!
//! let device = Device::new(native, caps, formats, allocator, queues, observer);
//! let buffer = Resource::create_committed(
//!     &device,
//!     &HeapProperties::new(HeapType::Upload),
//!     HeapFlags::empty(),
//!     &ResourceDesc::buffer(65536),
//!     ResourceState::GenericRead,
//! )?;
//! ```

pub mod cookie;
pub mod descriptor;
pub mod descriptor_heap;
pub mod device;
pub mod error;
pub mod format;
pub mod memory;
pub mod native;
pub mod observer;
pub mod private_data;
pub mod queue;
pub mod resource;
pub mod sampler;
pub mod sparse;
pub mod va_map;
pub mod view;

pub use cookie::{Cookie, CookieAllocator};
pub use descriptor::{
    BindlessState, BufferViewDesc, CbvDesc, DescriptorFlags, SlotState, SrvDesc, TextureViewDesc,
    UavDesc,
};
pub use descriptor_heap::{
    BoundRange, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapKind, DESCRIPTOR_INCREMENT,
};
pub use device::Device;
pub use error::{D12Error, D12Result};
pub use format::{Format, FormatDescriptor, FormatTable, StaticFormatTable};
pub use memory::{Allocation, HeapAllocationDesc, MemoryAllocator, MemoryBudget};
pub use native::{AshDevice, DeviceCaps, NativeDevice};
pub use observer::{NullObserver, QaObserver};
pub use queue::{QueueCategory, QueueHandle, QueueOps, SparseBindInfo};
pub use resource::{
    AllocationInfo, Heap, HeapDesc, HeapFlags, HeapProperties, HeapType, PageProperty, RegionBox,
    Resource, ResourceDesc, ResourceDimension, ResourceFlags, ResourceHandle, ResourceState,
    TextureLayout,
};
pub use sampler::{AddressMode, BorderColor, Filter, SamplerDesc};
pub use sparse::{TileRegion, TilingInfo, TILE_SIZE};
pub use va_map::VaMap;
pub use view::{View, ViewKey, ViewMap};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
