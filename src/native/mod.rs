//! Native device boundary.
//!
//! The underlying graphics device is an external collaborator: the core
//! only issues primitive create/destroy/query/update calls through the
//! [`NativeDevice`] trait. The production implementation wraps an
//! `ash::Device`; tests substitute a mock that fabricates handles and
//! counts live objects.

mod ash_device;

pub use ash_device::AshDevice;

use ash::vk;

use crate::error::D12Result;

/// Immutable device capability snapshot.
///
/// Captured once at device creation; every dispatch decision that depends
/// on capabilities (bindless set layout, raw-VA side channels, offset
/// quantization) is resolved into a fixed plan up front, so these fields
/// are never consulted on hot paths.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    /// VK_EXT_mutable_descriptor_type (or the VALVE predecessor) support.
    pub mutable_descriptor_type: bool,
    /// Native buffer device addresses are available.
    pub buffer_device_address: bool,
    /// A host-visible auxiliary buffer carries bare device addresses.
    pub raw_va_aux_buffer: bool,
    /// Typed buffer views use quantized element ranges plus an offset
    /// side table read by shaders.
    pub typed_offset_buffer: bool,
    /// Raw/structured SSBO descriptors carry their fine offset in the
    /// side table rather than the descriptor itself.
    pub ssbo_offset_buffer: bool,
    /// Sparse binding and sparse residency are usable.
    pub sparse_binding: bool,
    /// Dedicated allocations are preferred for images.
    pub prefers_dedicated_images: bool,
    /// minStorageBufferOffsetAlignment.
    pub ssbo_alignment: u64,
    /// maxTexelBufferElements.
    pub max_texel_buffer_elements: u32,
    /// Placement alignment the API contract promises callers (64 KiB).
    pub default_placement_alignment: u64,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            mutable_descriptor_type: true,
            buffer_device_address: true,
            raw_va_aux_buffer: true,
            typed_offset_buffer: true,
            ssbo_offset_buffer: false,
            sparse_binding: true,
            prefers_dedicated_images: false,
            ssbo_alignment: 16,
            max_texel_buffer_elements: 1 << 27,
            default_placement_alignment: 0x10000,
        }
    }
}

/// Plain-data buffer creation request.
#[derive(Debug, Clone, Copy)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub flags: vk::BufferCreateFlags,
}

/// Plain-data image creation request.
#[derive(Debug, Clone)]
pub struct ImageCreateInfo {
    pub flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    /// Formats the image may be reinterpreted as (mutable-format images).
    pub view_formats: Vec<vk::Format>,
}

/// Plain-data image view creation request.
#[derive(Debug, Clone, Copy)]
pub struct ImageViewCreateInfo {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub components: vk::ComponentMapping,
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub min_lod_clamp: f32,
}

/// Plain-data sampler creation request, already translated to native enums.
#[derive(Debug, Clone, Copy)]
pub struct SamplerCreateInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enable: bool,
    pub compare_op: vk::CompareOp,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

/// A buffer region bound into a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRegion {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// Payload of one native descriptor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorPayload {
    Buffer(BufferRegion),
    TexelBuffer(vk::BufferView),
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Sampler(vk::Sampler),
    /// Null write: the backend binds its null object for `ty`.
    Null,
}

/// One native descriptor-set write, expressed as plain data so the device
/// boundary stays mockable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub payload: DescriptorPayload,
}

/// One native descriptor-set-to-descriptor-set copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorCopy {
    pub src_set: vk::DescriptorSet,
    pub src_binding: u32,
    pub src_array_element: u32,
    pub dst_set: vk::DescriptorSet,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub count: u32,
}

/// Primitive create/destroy/query/update calls against the native device.
///
/// Destruction methods are infallible from the caller's point of view;
/// implementations log native teardown errors instead of propagating them.
pub trait NativeDevice: Send + Sync {
    fn create_buffer(&self, info: &BufferCreateInfo) -> D12Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(&self, info: &ImageCreateInfo) -> D12Result<vk::Image>;
    fn destroy_image(&self, image: vk::Image);

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn image_sparse_memory_requirements(
        &self,
        image: vk::Image,
    ) -> Vec<vk::SparseImageMemoryRequirements>;

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> D12Result<()>;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> D12Result<()>;

    fn create_buffer_view(
        &self,
        buffer: vk::Buffer,
        format: vk::Format,
        offset: u64,
        range: u64,
    ) -> D12Result<vk::BufferView>;
    fn destroy_buffer_view(&self, view: vk::BufferView);

    fn create_image_view(&self, info: &ImageViewCreateInfo) -> D12Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, info: &SamplerCreateInfo) -> D12Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_descriptor_pool(
        &self,
        sizes: &[(vk::DescriptorType, u32)],
        max_sets: u32,
    ) -> D12Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one bindless set of `capacity` descriptors of `ty` from
    /// `pool`. The implementation owns the matching set layout.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        ty: vk::DescriptorType,
        capacity: u32,
    ) -> D12Result<vk::DescriptorSet>;

    fn update_descriptors(&self, writes: &[DescriptorWrite], copies: &[DescriptorCopy]);

    /// Native device address of a buffer, when the device supports it.
    fn buffer_device_address(&self, buffer: vk::Buffer) -> Option<u64>;

    /// Attach a debug name to a native object. Best-effort.
    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str);
}
