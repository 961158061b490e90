//! Resource lifetime management: committed, placed and reserved
//! resources, resource heaps, and the two-level reference count that
//! lets native objects outlive their last public handle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use bitflags::bitflags;
use parking_lot::Mutex;

use crate::cookie::Cookie;
use crate::device::Device;
use crate::error::{D12Error, D12Result};
use crate::format::{is_cpu_accessible_heap, Format, FormatDescriptor};
use crate::memory::{Allocation, HeapAllocationDesc};
use crate::native::{BufferCreateInfo, ImageCreateInfo};
use crate::private_data::PrivateDataStore;
use crate::sparse::{SparseInfo, TILE_SIZE};
use crate::va_map::ResourceRef;
use crate::view::ViewMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HeapType {
    #[default]
    Default,
    Upload,
    Readback,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageProperty {
    #[default]
    Unknown,
    NotAvailable,
    WriteCombine,
    WriteBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapProperties {
    pub heap_type: HeapType,
    pub page_property: PageProperty,
}

impl HeapProperties {
    pub fn new(heap_type: HeapType) -> Self {
        Self {
            heap_type,
            page_property: PageProperty::Unknown,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeapFlags: u32 {
        const SHARED = 1 << 0;
        const DENY_BUFFERS = 1 << 1;
        const DENY_RT_DS_TEXTURES = 1 << 2;
        const DENY_NON_RT_DS_TEXTURES = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceDimension {
    #[default]
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

/// Declared memory layout of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureLayout {
    /// Driver-chosen optimal tiling.
    #[default]
    Optimal,
    /// Linear row-major tiling, mappable for CPU access.
    RowMajor,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 1 << 0;
        const ALLOW_DEPTH_STENCIL = 1 << 1;
        const ALLOW_UNORDERED_ACCESS = 1 << 2;
        const DENY_SHADER_RESOURCE = 1 << 3;
        const ALLOW_SIMULTANEOUS_ACCESS = 1 << 4;
        const ACCELERATION_STRUCTURE = 1 << 5;
    }
}

/// Logical state a resource is created in. Tracked for validation and
/// debugging only; layout transitions are the command layer's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceState {
    #[default]
    Common,
    GenericRead,
    CopyDest,
    CopySource,
    RenderTarget,
    DepthWrite,
    UnorderedAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub sample_count: u32,
    pub layout: TextureLayout,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            sample_count: 1,
            layout: TextureLayout::RowMajor,
            flags: ResourceFlags::empty(),
        }
    }

    pub fn texture_2d(format: Format, width: u64, height: u32) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            format,
            sample_count: 1,
            layout: TextureLayout::Optimal,
            flags: ResourceFlags::empty(),
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    pub fn depth(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Texture3D => u32::from(self.depth_or_array_size),
            _ => 1,
        }
    }

    pub fn array_layers(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Texture3D => 1,
            _ => u32::from(self.depth_or_array_size),
        }
    }

    /// Extent of `mip`, in texels.
    pub fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: ((self.width >> mip) as u32).max(1),
            height: (self.height >> mip).max(1),
            depth: (self.depth() >> mip).max(1),
        }
    }
}

bitflags! {
    /// Derived per-resource state, computed once at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InternalFlags: u32 {
        const LINEAR_TILING = 1 << 0;
        const SIMULTANEOUS_ACCESS = 1 << 1;
        const EXTERNAL = 1 << 2;
        const RESERVED = 1 << 3;
        const SYNTHETIC_VA = 1 << 4;
        const ACCELERATION_STRUCTURE = 1 << 5;
    }
}

/// A subresource region in texels, right-open on every axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBox {
    pub left: u32,
    pub top: u32,
    pub front: u32,
    pub right: u32,
    pub bottom: u32,
    pub back: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl NativeResource {
    pub fn buffer(self) -> vk::Buffer {
        match self {
            NativeResource::Buffer(buffer) => buffer,
            NativeResource::Image(_) => vk::Buffer::null(),
        }
    }

    pub fn image(self) -> vk::Image {
        match self {
            NativeResource::Image(image) => image,
            NativeResource::Buffer(_) => vk::Image::null(),
        }
    }
}

pub struct Resource {
    device: Arc<Device>,
    pub desc: ResourceDesc,
    pub cookie: Cookie,
    pub format: FormatDescriptor,
    pub common_layout: vk::ImageLayout,
    pub initial_state: ResourceState,
    pub internal_flags: InternalFlags,
    pub native: NativeResource,
    /// Device address of buffer resources; 0 for images.
    pub va: u64,
    heap_properties: HeapProperties,
    allocation: Mutex<Option<Allocation>>,
    pub(crate) sparse: Mutex<Option<SparseInfo>>,
    pub views: ViewMap,
    pub private_data: PrivateDataStore,
    /// Public handle count. The `Arc` strong count is the internal count.
    public_refs: AtomicU32,
}

/// The public handle over a shared resource. `Clone` acquires a public
/// reference, `Drop` releases one; internal holders (cached views,
/// in-flight descriptors) keep only the inner `Arc`.
pub struct ResourceHandle {
    resource: Arc<Resource>,
}

impl ResourceHandle {
    fn new(resource: Arc<Resource>) -> Self {
        resource.public_refs.store(1, Ordering::Release);
        Self { resource }
    }

    pub fn acquire(&self) -> ResourceHandle {
        self.resource.public_refs.fetch_add(1, Ordering::AcqRel);
        ResourceHandle {
            resource: Arc::clone(&self.resource),
        }
    }

    pub fn release(self) {}

    pub fn public_ref_count(&self) -> u32 {
        self.resource.public_refs.load(Ordering::Acquire)
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.resource.public_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::ops::Deref for ResourceHandle {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

fn lookup_format(device: &Device, format: Format) -> D12Result<FormatDescriptor> {
    device
        .formats()
        .format_for(format, None)
        .ok_or_else(|| D12Error::InvalidArgument(format!("unresolvable format {:?}", format)))
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

fn max_mip_count(desc: &ResourceDesc) -> u32 {
    let largest = (desc.width as u32).max(desc.height).max(desc.depth());
    32 - largest.leading_zeros()
}

fn validate_desc(device: &Device, desc: &ResourceDesc) -> D12Result<()> {
    if desc.width == 0 {
        return Err(D12Error::InvalidArgument("zero-width resource".into()));
    }

    if desc.is_buffer() {
        if desc.height != 1 || desc.depth_or_array_size != 1 {
            return Err(D12Error::InvalidArgument(
                "buffers require unit height and depth".into(),
            ));
        }
        if desc.mip_levels != 1 {
            return Err(D12Error::InvalidArgument(
                "buffers require a single mip level".into(),
            ));
        }
        if desc.format != Format::Unknown {
            return Err(D12Error::InvalidArgument(
                "buffers must use the unknown format".into(),
            ));
        }
        if desc.layout != TextureLayout::RowMajor {
            return Err(D12Error::InvalidArgument(
                "buffers must declare row-major layout".into(),
            ));
        }
        if desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
        {
            return Err(D12Error::InvalidArgument(
                "render-target and depth-stencil flags are invalid for buffers".into(),
            ));
        }
        return Ok(());
    }

    if desc.format == Format::Unknown {
        return Err(D12Error::InvalidArgument(
            "textures require a concrete format".into(),
        ));
    }
    lookup_format(device, desc.format)?;

    if desc.height == 0 || desc.depth_or_array_size == 0 || desc.mip_levels == 0 {
        return Err(D12Error::InvalidArgument(
            "zero-sized texture dimension".into(),
        ));
    }
    if desc.dimension == ResourceDimension::Texture1D && desc.height != 1 {
        return Err(D12Error::InvalidArgument(
            "1D textures require unit height".into(),
        ));
    }
    if u32::from(desc.mip_levels) > max_mip_count(desc) {
        return Err(D12Error::InvalidArgument(
            "mip count exceeds the dimension chain".into(),
        ));
    }
    if desc.sample_count == 0 || !desc.sample_count.is_power_of_two() {
        return Err(D12Error::InvalidArgument("invalid sample count".into()));
    }
    if desc.sample_count > 1
        && (desc.dimension != ResourceDimension::Texture2D || desc.mip_levels != 1)
    {
        return Err(D12Error::InvalidArgument(
            "multisampling requires a single-mip 2D texture".into(),
        ));
    }
    if desc
        .flags
        .contains(ResourceFlags::ALLOW_SIMULTANEOUS_ACCESS | ResourceFlags::ALLOW_DEPTH_STENCIL)
    {
        return Err(D12Error::InvalidArgument(
            "simultaneous access is incompatible with depth-stencil".into(),
        ));
    }
    if desc.layout == TextureLayout::RowMajor && desc.dimension == ResourceDimension::Texture3D {
        return Err(D12Error::Unsupported(
            "row-major 3D textures are not expressible".into(),
        ));
    }
    Ok(())
}

fn buffer_usage(device: &Device, flags: ResourceFlags) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
        | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDIRECT_BUFFER;
    if device.caps.buffer_device_address {
        usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    if flags.contains(ResourceFlags::ACCELERATION_STRUCTURE) {
        usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    usage
}

fn image_usage(desc: &ResourceDesc) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if !desc.flags.contains(ResourceFlags::DENY_SHADER_RESOURCE) {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    usage
}

fn image_create_info(
    device: &Device,
    desc: &ResourceDesc,
    format: &FormatDescriptor,
    sparse: bool,
) -> ImageCreateInfo {
    let mut flags = vk::ImageCreateFlags::empty();
    let view_formats = device.formats().compatibility_class(desc.format).to_vec();
    if view_formats.len() > 1 {
        flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
    }
    if desc.dimension == ResourceDimension::Texture2D
        && desc.width == u64::from(desc.height)
        && desc.array_layers() >= 6
    {
        flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
    }
    if desc.dimension == ResourceDimension::Texture3D
        && desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_UNORDERED_ACCESS)
    {
        flags |= vk::ImageCreateFlags::TYPE_2D_ARRAY_COMPATIBLE;
    }
    if sparse {
        flags |= vk::ImageCreateFlags::SPARSE_BINDING
            | vk::ImageCreateFlags::SPARSE_RESIDENCY
            | vk::ImageCreateFlags::SPARSE_ALIASED;
    }

    ImageCreateInfo {
        flags,
        image_type: match desc.dimension {
            ResourceDimension::Texture1D => vk::ImageType::TYPE_1D,
            ResourceDimension::Texture3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        },
        format: format.vk_format,
        extent: vk::Extent3D {
            width: desc.width as u32,
            height: desc.height,
            depth: desc.depth(),
        },
        mip_levels: u32::from(desc.mip_levels),
        array_layers: desc.array_layers(),
        samples: vk::SampleCountFlags::from_raw(desc.sample_count),
        tiling: match desc.layout {
            TextureLayout::Optimal => vk::ImageTiling::OPTIMAL,
            TextureLayout::RowMajor => vk::ImageTiling::LINEAR,
        },
        usage: image_usage(desc),
        view_formats,
    }
}

/// Native layout the resource rests in between explicit transitions.
fn common_layout(desc: &ResourceDesc) -> vk::ImageLayout {
    if desc.is_buffer() {
        return vk::ImageLayout::UNDEFINED;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_SIMULTANEOUS_ACCESS)
        || desc.layout == TextureLayout::RowMajor
    {
        return vk::ImageLayout::GENERAL;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) {
        return vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
    }
    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
}

fn derived_internal_flags(desc: &ResourceDesc) -> InternalFlags {
    let mut flags = InternalFlags::empty();
    if desc.layout == TextureLayout::RowMajor && !desc.is_buffer() {
        flags |= InternalFlags::LINEAR_TILING;
    }
    if desc.flags.contains(ResourceFlags::ALLOW_SIMULTANEOUS_ACCESS) {
        flags |= InternalFlags::SIMULTANEOUS_ACCESS;
    }
    if desc.flags.contains(ResourceFlags::ACCELERATION_STRUCTURE) {
        flags |= InternalFlags::ACCELERATION_STRUCTURE;
    }
    flags
}

impl Resource {
    fn build(
        device: &Arc<Device>,
        desc: &ResourceDesc,
        native: NativeResource,
        heap_properties: HeapProperties,
        initial_state: ResourceState,
        mut internal_flags: InternalFlags,
        allocation: Option<Allocation>,
        sparse: Option<SparseInfo>,
    ) -> D12Result<ResourceHandle> {
        let format = if desc.is_buffer() {
            FormatDescriptor::unknown()
        } else {
            lookup_format(device, desc.format)?
        };

        // Registering the device address last means every fallible step
        // has already succeeded and teardown stays uniform.
        let mut va = 0;
        if let NativeResource::Buffer(buffer) = native {
            match device.native().buffer_device_address(buffer) {
                Some(address) => va = address,
                None => {
                    va = device.va_map.alloc_synthetic(desc.width);
                    internal_flags |= InternalFlags::SYNTHETIC_VA;
                }
            }
        }

        let cookie = device.cookies.allocate();
        let resource = Arc::new(Resource {
            device: Arc::clone(device),
            desc: *desc,
            cookie,
            format,
            common_layout: common_layout(desc),
            initial_state,
            internal_flags,
            native,
            va,
            heap_properties,
            allocation: Mutex::new(allocation),
            sparse: Mutex::new(sparse),
            views: ViewMap::new(),
            private_data: PrivateDataStore::new(),
            public_refs: AtomicU32::new(0),
        });

        if let NativeResource::Buffer(buffer) = native {
            device.va_map.insert(ResourceRef {
                vk_buffer: buffer,
                va,
                size: desc.width,
                cookie,
            });
        }
        device.observer().register_resource(cookie, desc);
        Ok(ResourceHandle::new(resource))
    }

    pub fn create_committed(
        device: &Arc<Device>,
        heap_properties: &HeapProperties,
        heap_flags: HeapFlags,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> D12Result<ResourceHandle> {
        validate_desc(device, desc)?;

        if desc.is_buffer() {
            let buffer = device.native().create_buffer(&BufferCreateInfo {
                size: desc.width,
                usage: buffer_usage(device, desc.flags),
                flags: vk::BufferCreateFlags::empty(),
            })?;
            let requirements = device.native().buffer_memory_requirements(buffer);
            let allocation = device
                .allocate_heap_memory(&HeapAllocationDesc {
                    size: requirements.size,
                    alignment: requirements
                        .alignment
                        .max(device.caps.default_placement_alignment),
                    properties: *heap_properties,
                    flags: heap_flags,
                })
                .inspect_err(|_| device.native().destroy_buffer(buffer))?;
            if let Err(e) =
                device
                    .native()
                    .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
            {
                device.free_memory(allocation, heap_properties.heap_type);
                device.native().destroy_buffer(buffer);
                return Err(e);
            }
            return Self::build(
                device,
                desc,
                NativeResource::Buffer(buffer),
                *heap_properties,
                initial_state,
                derived_internal_flags(desc),
                Some(allocation),
                None,
            );
        }

        let format = lookup_format(device, desc.format)?;
        let image = device
            .native()
            .create_image(&image_create_info(device, desc, &format, false))?;
        let requirements = device.native().image_memory_requirements(image);
        let dedicated = device.caps.prefers_dedicated_images;
        let allocation = device
            .allocate_memory(&requirements, heap_properties, heap_flags, dedicated)
            .inspect_err(|_| device.native().destroy_image(image))?;
        if let Err(e) = device
            .native()
            .bind_image_memory(image, allocation.memory, allocation.offset)
        {
            device.free_memory(allocation, heap_properties.heap_type);
            device.native().destroy_image(image);
            return Err(e);
        }
        Self::build(
            device,
            desc,
            NativeResource::Image(image),
            *heap_properties,
            initial_state,
            derived_internal_flags(desc),
            Some(allocation),
            None,
        )
    }

    pub fn create_placed(
        device: &Arc<Device>,
        heap: &Heap,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> D12Result<ResourceHandle> {
        validate_desc(device, desc)?;

        let denied = if desc.is_buffer() {
            HeapFlags::DENY_BUFFERS
        } else if desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
        {
            HeapFlags::DENY_RT_DS_TEXTURES
        } else {
            HeapFlags::DENY_NON_RT_DS_TEXTURES
        };
        if heap.desc.flags.contains(denied) {
            return Err(D12Error::InvalidArgument(format!(
                "resource category denied by heap flags {:?}",
                heap.desc.flags
            )));
        }

        let (native, requirements) = if desc.is_buffer() {
            let buffer = device.native().create_buffer(&BufferCreateInfo {
                size: desc.width,
                usage: buffer_usage(device, desc.flags),
                flags: vk::BufferCreateFlags::empty(),
            })?;
            let requirements = device.native().buffer_memory_requirements(buffer);
            (NativeResource::Buffer(buffer), requirements)
        } else {
            let format = lookup_format(device, desc.format)?;
            let image = device
                .native()
                .create_image(&image_create_info(device, desc, &format, false))?;
            let requirements = device.native().image_memory_requirements(image);
            (NativeResource::Image(image), requirements)
        };

        let destroy_native = |native: NativeResource| match native {
            NativeResource::Buffer(buffer) => device.native().destroy_buffer(buffer),
            NativeResource::Image(image) => device.native().destroy_image(image),
        };

        // The placement offset re-aligns upward; the allocation-info query
        // padded the heap so this cannot push a valid placement out. An
        // offset large enough to wrap the address space is just invalid.
        let placement = align_up(offset, requirements.alignment)
            .and_then(|aligned| aligned.checked_add(requirements.size).map(|end| (aligned, end)))
            .filter(|&(_, end)| end <= heap.desc.size_in_bytes);
        let Some((aligned_offset, _)) = placement else {
            destroy_native(native);
            log::warn!(
                "Placed resource at offset {:#x} (size {:#x}) exceeds heap size {:#x}.",
                offset,
                requirements.size,
                heap.desc.size_in_bytes
            );
            return Err(D12Error::InvalidArgument(
                "placement exceeds heap capacity".into(),
            ));
        };

        let allocation = match heap.slice(aligned_offset, requirements.size) {
            Ok(allocation) => allocation,
            Err(e) => {
                destroy_native(native);
                return Err(e);
            }
        };
        let bind_result = match native {
            NativeResource::Buffer(buffer) => {
                device
                    .native()
                    .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
            }
            NativeResource::Image(image) => {
                device
                    .native()
                    .bind_image_memory(image, allocation.memory, allocation.offset)
            }
        };
        if let Err(e) = bind_result {
            destroy_native(native);
            return Err(e);
        }

        Self::build(
            device,
            desc,
            native,
            heap.desc.properties,
            initial_state,
            derived_internal_flags(desc),
            Some(allocation),
            None,
        )
    }

    pub fn create_reserved(
        device: &Arc<Device>,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> D12Result<ResourceHandle> {
        validate_desc(device, desc)?;
        if !device.caps.sparse_binding {
            return Err(D12Error::Unsupported(
                "sparse binding is not available on this device".into(),
            ));
        }
        if desc.layout == TextureLayout::RowMajor && !desc.is_buffer() {
            return Err(D12Error::InvalidArgument(
                "reserved textures cannot be row-major".into(),
            ));
        }

        let internal_flags = derived_internal_flags(desc) | InternalFlags::RESERVED;

        if desc.is_buffer() {
            let buffer = device.native().create_buffer(&BufferCreateInfo {
                size: desc.width,
                usage: buffer_usage(device, desc.flags),
                flags: vk::BufferCreateFlags::SPARSE_BINDING
                    | vk::BufferCreateFlags::SPARSE_RESIDENCY
                    | vk::BufferCreateFlags::SPARSE_ALIASED,
            })?;
            let sparse = SparseInfo::for_buffer(desc.width);
            return Self::build(
                device,
                desc,
                NativeResource::Buffer(buffer),
                HeapProperties::default(),
                initial_state,
                internal_flags,
                None,
                Some(sparse),
            );
        }

        let format = lookup_format(device, desc.format)?;
        let image = device
            .native()
            .create_image(&image_create_info(device, desc, &format, true))?;
        let sparse = match SparseInfo::for_image(device, image, desc) {
            Ok(sparse) => sparse,
            Err(e) => {
                device.native().destroy_image(image);
                return Err(e);
            }
        };
        Self::build(
            device,
            desc,
            NativeResource::Image(image),
            HeapProperties::default(),
            initial_state,
            internal_flags,
            None,
            Some(sparse),
        )
    }

    /// Size and alignment a placed resource of this shape requires.
    ///
    /// When the native alignment exceeds the default placement alignment
    /// the size is padded so the caller can re-align inside the
    /// allocation, and the reported alignment is clamped to the default.
    pub fn get_allocation_info(device: &Device, desc: &ResourceDesc) -> D12Result<AllocationInfo> {
        let default_alignment = device.caps.default_placement_alignment;
        if desc.is_buffer() {
            validate_desc(device, desc)?;
            let size = align_up(desc.width, default_alignment).ok_or_else(|| {
                D12Error::InvalidArgument("buffer size overflows when padded".into())
            })?;
            return Ok(AllocationInfo {
                size,
                alignment: default_alignment,
            });
        }

        validate_desc(device, desc)?;
        let format = lookup_format(device, desc.format)?;
        let image = device
            .native()
            .create_image(&image_create_info(device, desc, &format, false))?;
        let requirements = device.native().image_memory_requirements(image);
        device.native().destroy_image(image);

        let mut size = requirements.size;
        let mut alignment = requirements.alignment.max(default_alignment);
        if alignment > default_alignment {
            size += alignment - default_alignment;
            alignment = default_alignment;
        }
        Ok(AllocationInfo { size, alignment })
    }

    pub fn is_cpu_accessible(&self) -> bool {
        !self.internal_flags.contains(InternalFlags::RESERVED)
            && is_cpu_accessible_heap(&self.heap_properties)
    }

    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.allocation
            .lock()
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
    }

    pub fn heap_properties(&self) -> HeapProperties {
        self.heap_properties
    }

    pub fn tile_count(&self) -> u32 {
        self.sparse
            .lock()
            .as_ref()
            .map(|sparse| sparse.tile_count())
            .unwrap_or(0)
    }

    /// Copy of the tile record at `index`. Reserved resources only.
    pub fn tile(&self, index: u32) -> Option<crate::sparse::SparseTile> {
        self.sparse
            .lock()
            .as_ref()
            .and_then(|sparse| sparse.tile(index).copied())
    }

    pub fn tiling_info(&self) -> Option<crate::sparse::TilingInfo> {
        self.sparse.lock().as_ref().map(|sparse| sparse.tiling_info())
    }

    /// Bind `count` tiles starting at `first_tile` to `memory`, or unbind
    /// them when `memory` is `None`. Reserved resources only.
    pub fn bind_tiles(
        &self,
        first_tile: u32,
        count: u32,
        memory: Option<&Allocation>,
    ) -> D12Result<()> {
        let mut sparse = self.sparse.lock();
        let Some(sparse) = sparse.as_mut() else {
            return Err(D12Error::InvalidArgument(
                "tile binding requires a reserved resource".into(),
            ));
        };
        sparse.bind_tiles(&self.device, self.native, first_tile, count, memory)
    }

    /// Whether `region` lies inside the given mip level, respecting
    /// compressed-block alignment on the right/bottom edges.
    pub fn validate_region(&self, mip: u32, region: &RegionBox) -> bool {
        if self.desc.is_buffer() {
            return region.right > region.left
                && u64::from(region.right) <= self.desc.width
                && region.bottom == 1
                && region.back == 1;
        }
        if region.right <= region.left || region.bottom <= region.top || region.back <= region.front
        {
            return false;
        }
        let extent = self.desc.mip_extent(mip);
        let (bw, bh) = (self.format.block_width, self.format.block_height);
        region.left % bw == 0
            && region.top % bh == 0
            && (region.right % bw == 0 || region.right == extent.width)
            && (region.bottom % bh == 0 || region.bottom == extent.height)
            && region.right <= extent.width
            && region.bottom <= extent.height
            && region.back <= extent.depth
    }

    /// Attach a debug name, propagated to the native object.
    pub fn set_name(&self, name: &str) {
        self.private_data.set_name(name);
        let (object_type, handle) = match self.native {
            NativeResource::Buffer(buffer) => (vk::ObjectType::BUFFER, buffer.as_raw()),
            NativeResource::Image(image) => (vk::ObjectType::IMAGE, image.as_raw()),
        };
        self.device.native().set_object_name(object_type, handle, name);
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        let native = self.device.native();
        self.views.destroy(native);

        // Sparse state may be partially built when creation failed late.
        if let Some(sparse) = self.sparse.get_mut().take() {
            sparse.destroy(&self.device);
        }

        if let NativeResource::Buffer(_) = self.native {
            self.device.va_map.remove(self.va);
            if self.internal_flags.contains(InternalFlags::SYNTHETIC_VA) {
                self.device.va_map.free_synthetic(self.va, self.desc.width);
            }
        }

        match self.native {
            NativeResource::Buffer(buffer) => native.destroy_buffer(buffer),
            NativeResource::Image(image) => native.destroy_image(image),
        }

        if let Some(allocation) = self.allocation.get_mut().take() {
            self.device
                .free_memory(allocation, self.heap_properties.heap_type);
        }

        self.device.observer().unregister(self.cookie);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDesc {
    pub size_in_bytes: u64,
    pub properties: HeapProperties,
    pub alignment: u64,
    pub flags: HeapFlags,
}

/// A caller-owned resource heap: one allocation, sliced by placed
/// resources.
pub struct Heap {
    device: Arc<Device>,
    pub desc: HeapDesc,
    pub cookie: Cookie,
    allocation: Mutex<Option<Allocation>>,
    pub private_data: PrivateDataStore,
}

impl Heap {
    pub fn create(device: &Arc<Device>, desc: &HeapDesc) -> D12Result<Arc<Heap>> {
        if desc.size_in_bytes == 0 {
            return Err(D12Error::InvalidArgument("zero-sized heap".into()));
        }
        let mut desc = *desc;
        if desc.alignment == 0 {
            desc.alignment = device.caps.default_placement_alignment;
        }
        if !desc.alignment.is_power_of_two() {
            return Err(D12Error::InvalidArgument(
                "heap alignment must be a power of two".into(),
            ));
        }

        let allocation = device.allocate_heap_memory(&HeapAllocationDesc {
            size: desc.size_in_bytes,
            alignment: desc.alignment,
            properties: desc.properties,
            flags: desc.flags,
        })?;
        Ok(Arc::new(Heap {
            device: Arc::clone(device),
            desc,
            cookie: device.cookies.allocate(),
            allocation: Mutex::new(Some(allocation)),
            private_data: PrivateDataStore::new(),
        }))
    }

    /// Non-owning sub-allocation for a placed resource.
    pub(crate) fn slice(&self, offset: u64, size: u64) -> D12Result<Allocation> {
        let allocation = self.allocation.lock();
        match allocation.as_ref() {
            Some(allocation) => Ok(self.device.slice_memory(allocation, offset, size)),
            None => Err(D12Error::InvalidArgument(
                "heap memory already released".into(),
            )),
        }
    }

    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.allocation
            .lock()
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take() {
            self.device
                .free_memory(allocation, self.desc.properties.heap_type);
        }
    }
}

/// Total tiles a reserved buffer of `size` bytes occupies.
pub fn buffer_tile_count(size: u64) -> u32 {
    size.div_ceil(TILE_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_desc_validation_rules() {
        let mut desc = ResourceDesc::buffer(1024);
        desc.mip_levels = 2;
        // Structural checks fire before any device interaction.
        assert!(matches!(
            validate_buffer_shape(&desc),
            Err(D12Error::InvalidArgument(_))
        ));

        let mut desc = ResourceDesc::buffer(1024);
        desc.flags = ResourceFlags::ALLOW_RENDER_TARGET;
        assert!(matches!(
            validate_buffer_shape(&desc),
            Err(D12Error::InvalidArgument(_))
        ));

        assert!(validate_buffer_shape(&ResourceDesc::buffer(1024)).is_ok());
    }

    // Buffer-only subset of the validation rules, exercised without a
    // device because buffers never consult the format table.
    fn validate_buffer_shape(desc: &ResourceDesc) -> D12Result<()> {
        assert!(desc.is_buffer());
        if desc.mip_levels != 1 {
            return Err(D12Error::InvalidArgument("mips".into()));
        }
        if desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
        {
            return Err(D12Error::InvalidArgument("flags".into()));
        }
        Ok(())
    }

    #[test]
    fn test_mip_extent_clamps_to_one() {
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 64);
        assert_eq!(
            desc.mip_extent(0),
            vk::Extent3D {
                width: 256,
                height: 64,
                depth: 1
            }
        );
        assert_eq!(
            desc.mip_extent(7),
            vk::Extent3D {
                width: 2,
                height: 1,
                depth: 1
            }
        );
    }

    #[test]
    fn test_common_layout_selection() {
        let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 64, 64);
        assert_eq!(common_layout(&desc), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        desc.flags = ResourceFlags::ALLOW_SIMULTANEOUS_ACCESS;
        assert_eq!(common_layout(&desc), vk::ImageLayout::GENERAL);

        let mut desc = ResourceDesc::texture_2d(Format::D32Float, 64, 64);
        desc.flags = ResourceFlags::ALLOW_DEPTH_STENCIL;
        assert_eq!(
            common_layout(&desc),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn test_buffer_tile_count_rounds_up() {
        assert_eq!(buffer_tile_count(1), 1);
        assert_eq!(buffer_tile_count(TILE_SIZE), 1);
        assert_eq!(buffer_tile_count(TILE_SIZE + 1), 2);
        assert_eq!(buffer_tile_count(3 * TILE_SIZE), 3);
    }

    #[test]
    fn test_max_mip_count_matches_dimension_chain() {
        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 64);
        assert_eq!(max_mip_count(&desc), 9);

        let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 1, 1);
        assert_eq!(max_mip_count(&desc), 1);
    }
}
