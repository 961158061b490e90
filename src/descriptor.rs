//! The descriptor write engine: bindless set dispatch, per-slot
//! metadata, CBV/SRV/UAV/sampler writes, null-descriptor replay and
//! slot copies.
//!
//! A logical descriptor may be exposed through several parallel native
//! sets (view binding, raw address table, offset/range table) because
//! the shader side picks one access path per shader. Which sets exist is
//! decided once per device from the capability snapshot; every write
//! then consults that fixed plan.

use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::cookie::Cookie;
use crate::descriptor_heap::{BoundRange, DescriptorHeap, DescriptorHeapKind};
use crate::error::{D12Error, D12Result};
use crate::format::Format;
use crate::native::{
    BufferRegion, DescriptorCopy, DescriptorPayload, DescriptorWrite, DeviceCaps,
};
use crate::observer::DescriptorTypeBits;
use crate::resource::{NativeResource, ResourceDimension, ResourceHandle};
use crate::sampler::{SamplerDesc, SamplerKey};
use crate::view::{View, ViewKey, IDENTITY_SWIZZLE};

/// Element-count granularity for typed buffer view keys. Nearby requests
/// collapse onto one cached view; the residual offset travels in the
/// bound-range side table. A heuristic bound, not a contract.
pub const TYPED_OFFSET_QUANTUM: u32 = 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindlessFlags: u32 {
        const MUTABLE_TYPE = 1 << 0;
        const RAW_VA_AUX_BUFFER = 1 << 1;
        const TYPED_OFFSET_BUFFER = 1 << 2;
        const SSBO_OFFSET_BUFFER = 1 << 3;
    }
}

/// One native descriptor-set category in the bindless plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindlessSetInfo {
    pub heap_kind: DescriptorHeapKind,
    pub ty: vk::DescriptorType,
    pub set_index: u32,
    pub binding_index: u32,
}

/// The per-device bindless dispatch plan, built once from the capability
/// snapshot.
#[derive(Debug, Default)]
pub struct BindlessState {
    pub flags: BindlessFlags,
    set_infos: Vec<BindlessSetInfo>,
}

impl BindlessState {
    pub fn new(caps: &DeviceCaps) -> Self {
        let mut flags = BindlessFlags::empty();
        if caps.mutable_descriptor_type {
            flags |= BindlessFlags::MUTABLE_TYPE;
        }
        if caps.raw_va_aux_buffer {
            flags |= BindlessFlags::RAW_VA_AUX_BUFFER;
        }
        if caps.typed_offset_buffer {
            flags |= BindlessFlags::TYPED_OFFSET_BUFFER;
        }
        if caps.ssbo_offset_buffer {
            flags |= BindlessFlags::SSBO_OFFSET_BUFFER;
        }

        let mut set_infos = Vec::new();
        let mut push = |heap_kind, ty| {
            let set_index = set_infos
                .iter()
                .filter(|info: &&BindlessSetInfo| info.heap_kind == heap_kind)
                .count() as u32;
            set_infos.push(BindlessSetInfo {
                heap_kind,
                ty,
                set_index,
                binding_index: 0,
            });
        };

        if flags.contains(BindlessFlags::MUTABLE_TYPE) {
            push(DescriptorHeapKind::CbvSrvUav, vk::DescriptorType::MUTABLE_EXT);
            push(DescriptorHeapKind::CbvSrvUav, vk::DescriptorType::STORAGE_BUFFER);
        } else {
            push(DescriptorHeapKind::CbvSrvUav, vk::DescriptorType::UNIFORM_BUFFER);
            push(DescriptorHeapKind::CbvSrvUav, vk::DescriptorType::STORAGE_BUFFER);
            push(DescriptorHeapKind::CbvSrvUav, vk::DescriptorType::SAMPLED_IMAGE);
            push(DescriptorHeapKind::CbvSrvUav, vk::DescriptorType::STORAGE_IMAGE);
            push(
                DescriptorHeapKind::CbvSrvUav,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            );
            push(
                DescriptorHeapKind::CbvSrvUav,
                vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            );
        }
        push(DescriptorHeapKind::Sampler, vk::DescriptorType::SAMPLER);

        Self { flags, set_infos }
    }

    pub fn set_info(&self, index: usize) -> &BindlessSetInfo {
        &self.set_infos[index]
    }

    /// Indices of the set infos active for a heap kind, in set order.
    pub fn set_infos_for(&self, kind: DescriptorHeapKind) -> Vec<usize> {
        self.set_infos
            .iter()
            .enumerate()
            .filter(|(_, info)| info.heap_kind == kind)
            .map(|(index, _)| index)
            .collect()
    }

    /// Set infos a write of native type `ty` must touch. The mutable set
    /// accepts every resource descriptor type.
    fn targets_for(&self, kind: DescriptorHeapKind, ty: vk::DescriptorType) -> Vec<usize> {
        self.set_infos
            .iter()
            .enumerate()
            .filter(|(_, info)| {
                info.heap_kind == kind
                    && (info.ty == ty || info.ty == vk::DescriptorType::MUTABLE_EXT)
            })
            .map(|(index, _)| index)
            .collect()
    }
}

bitflags! {
    /// Per-slot bookkeeping bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescriptorFlags: u32 {
        /// A view-object write is live.
        const VIEW = 1 << 0;
        /// A buffer offset/range write is live, cached inline.
        const OFFSET_RANGE = 1 << 1;
        /// A bare device address sits in the raw VA table.
        const RAW_VA_AUX_BUFFER = 1 << 2;
        /// An entry exists in the bound-range side table.
        const BUFFER_OFFSET = 1 << 3;
        /// The slot is bound, as opposed to explicitly null.
        const NON_NULL = 1 << 4;
    }
}

/// Metadata and cached payload of one heap slot.
#[derive(Clone)]
pub struct SlotState {
    pub cookie: Cookie,
    /// Bitmask of bindless set-info indices holding a live write.
    pub set_info_mask: u32,
    pub flags: DescriptorFlags,
    /// Placeholder type the slot was last nulled with.
    pub null_placeholder: vk::DescriptorType,
    /// Native type of the live write, when bound.
    pub ty: vk::DescriptorType,
    pub buffer: BufferRegion,
    pub image_layout: vk::ImageLayout,
    pub raw_va: u64,
    pub bound_range: BoundRange,
    pub view: Option<Arc<View>>,
    /// Keeps the bound resource's native objects alive past its last
    /// public handle.
    pub resource: Option<Arc<crate::resource::Resource>>,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            cookie: 0,
            set_info_mask: 0,
            flags: DescriptorFlags::empty(),
            null_placeholder: vk::DescriptorType::UNIFORM_BUFFER,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            buffer: BufferRegion::default(),
            image_layout: vk::ImageLayout::UNDEFINED,
            raw_va: 0,
            bound_range: BoundRange::default(),
            view: None,
            resource: None,
        }
    }
}

pub struct DescriptorSlot {
    state: Mutex<SlotState>,
}

impl DescriptorSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    pub fn snapshot(&self) -> SlotState {
        self.state.lock().clone()
    }
}

impl Default for DescriptorSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Precomputed null writes, one per native set of the owning heap,
/// replayed with the slot index and placeholder type patched in.
#[derive(Default)]
pub struct NullTemplate {
    writes: Vec<DescriptorWrite>,
    /// Which template entries target the mutable set and need their type
    /// patched to the caller's placeholder.
    mutable: Vec<bool>,
    pub(crate) set_info_mask: u32,
}

impl NullTemplate {
    pub(crate) fn build(bindless: &BindlessState, sets: &[(usize, vk::DescriptorSet)]) -> Self {
        let mut template = Self::default();
        for &(info_index, set) in sets {
            let info = bindless.set_info(info_index);
            template.writes.push(DescriptorWrite {
                set,
                binding: info.binding_index,
                array_element: 0,
                ty: info.ty,
                payload: DescriptorPayload::Null,
            });
            template
                .mutable
                .push(info.ty == vk::DescriptorType::MUTABLE_EXT);
            template.set_info_mask |= 1 << info_index;
        }
        template
    }

    fn instantiate(&self, slot: u32, placeholder: vk::DescriptorType) -> Vec<DescriptorWrite> {
        self.writes
            .iter()
            .zip(&self.mutable)
            .map(|(write, &mutable)| {
                let mut write = *write;
                write.array_element = slot;
                if mutable {
                    write.ty = placeholder;
                }
                write
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbvDesc {
    pub buffer_location: u64,
    pub size_in_bytes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferViewDesc {
    pub format: Option<Format>,
    pub first_element: u64,
    pub num_elements: u32,
    pub structure_byte_stride: u32,
    /// Byte-addressed (raw) view.
    pub raw: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureViewDesc {
    pub format: Option<Format>,
    pub most_detailed_mip: u32,
    /// `u32::MAX` selects all remaining mips.
    pub mip_levels: u32,
    pub first_array_layer: u32,
    /// `u32::MAX` selects all remaining layers.
    pub array_layer_count: u32,
    pub plane_slice: u32,
    pub min_lod_clamp: f32,
}

impl Default for TextureViewDesc {
    fn default() -> Self {
        Self {
            format: None,
            most_detailed_mip: 0,
            mip_levels: u32::MAX,
            first_array_layer: 0,
            array_layer_count: u32::MAX,
            plane_slice: 0,
            min_lod_clamp: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SrvDesc {
    Buffer(BufferViewDesc),
    Texture(TextureViewDesc),
    /// Acceleration structures have no view; the address is the identity.
    AccelerationStructure { location: u64 },
}

impl Default for SrvDesc {
    fn default() -> Self {
        SrvDesc::Texture(TextureViewDesc::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UavDesc {
    Buffer(BufferViewDesc),
    Texture(TextureViewDesc),
}

impl Default for UavDesc {
    fn default() -> Self {
        UavDesc::Texture(TextureViewDesc::default())
    }
}

fn descriptor_type_bits(ty: vk::DescriptorType) -> DescriptorTypeBits {
    match ty {
        vk::DescriptorType::UNIFORM_BUFFER => DescriptorTypeBits::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER => DescriptorTypeBits::STORAGE_BUFFER,
        vk::DescriptorType::SAMPLED_IMAGE => DescriptorTypeBits::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE => DescriptorTypeBits::STORAGE_IMAGE,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER => DescriptorTypeBits::UNIFORM_TEXEL_BUFFER,
        vk::DescriptorType::STORAGE_TEXEL_BUFFER => DescriptorTypeBits::STORAGE_TEXEL_BUFFER,
        vk::DescriptorType::SAMPLER => DescriptorTypeBits::SAMPLER,
        _ => DescriptorTypeBits::empty(),
    }
}

fn image_view_type(dimension: ResourceDimension, layers: u32) -> vk::ImageViewType {
    match dimension {
        ResourceDimension::Texture1D if layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
        ResourceDimension::Texture1D => vk::ImageViewType::TYPE_1D,
        ResourceDimension::Texture3D => vk::ImageViewType::TYPE_3D,
        _ if layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
        _ => vk::ImageViewType::TYPE_2D,
    }
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

fn align_up_u64(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

impl DescriptorHeap {
    fn check_slot(&self, slot: u32, kind: DescriptorHeapKind) -> D12Result<()> {
        if self.desc.kind != kind {
            return Err(D12Error::InvalidArgument(format!(
                "descriptor write targets a {:?} heap",
                self.desc.kind
            )));
        }
        if slot >= self.desc.capacity {
            return Err(D12Error::InvalidArgument("slot index out of range".into()));
        }
        Ok(())
    }

    /// Build the native writes binding `payload` of type `ty` into every
    /// relevant set at `slot`. Returns the writes and the set mask.
    fn build_writes(
        &self,
        slot: u32,
        ty: vk::DescriptorType,
        payload: DescriptorPayload,
    ) -> (Vec<DescriptorWrite>, u32) {
        let bindless = self.device.bindless();
        let targets = bindless.targets_for(self.desc.kind, ty);
        let mut writes = Vec::new();
        let mut mask = 0;
        for (info_index, set) in &self.sets {
            if !targets.contains(info_index) {
                continue;
            }
            let info = bindless.set_info(*info_index);
            writes.push(DescriptorWrite {
                set: *set,
                binding: info.binding_index,
                array_element: slot,
                ty,
                payload,
            });
            mask |= 1 << *info_index;
        }
        (writes, mask)
    }

    /// Initialize every slot of every native set to the null template.
    /// One batched native update.
    pub(crate) fn initialize_null_slots(&self) {
        let placeholder = match self.desc.kind {
            DescriptorHeapKind::Sampler => vk::DescriptorType::SAMPLER,
            _ => vk::DescriptorType::UNIFORM_BUFFER,
        };
        let mut writes = Vec::with_capacity(self.sets.len() * self.desc.capacity as usize);
        for slot in 0..self.desc.capacity {
            writes.extend(self.null_template.instantiate(slot, placeholder));
            let mut state = self.slots[slot as usize].lock();
            state.null_placeholder = placeholder;
            state.set_info_mask = self.null_template.set_info_mask;
        }
        if !writes.is_empty() {
            self.device.native().update_descriptors(&writes, &[]);
        }
    }

    /// Write the null descriptor into `slot`, patched to `placeholder`.
    /// Skipped entirely when the slot is already null with the same
    /// placeholder.
    pub fn write_null(&self, slot: u32, placeholder: vk::DescriptorType) {
        let slot_ref = &self.slots[slot as usize];
        let mut state = slot_ref.lock();
        if !state.flags.contains(DescriptorFlags::NON_NULL)
            && state.null_placeholder == placeholder
        {
            return;
        }

        let writes = self.null_template.instantiate(slot, placeholder);
        if !writes.is_empty() {
            self.device.native().update_descriptors(&writes, &[]);
        }
        if state.flags.contains(DescriptorFlags::RAW_VA_AUX_BUFFER) {
            if let Some(table) = &self.raw_va_table {
                table.write(slot, 0);
            }
        }
        if state.flags.contains(DescriptorFlags::BUFFER_OFFSET) {
            if let Some(table) = &self.buffer_ranges {
                table.write(slot, BoundRange::default());
            }
        }

        *state = SlotState {
            null_placeholder: placeholder,
            set_info_mask: self.null_template.set_info_mask,
            ..SlotState::default()
        };
        self.device
            .observer()
            .write_descriptor(self.cookie, slot, DescriptorTypeBits::empty(), 0);
    }

    /// Commit a bound state: issue the writes, update side tables, and
    /// replace the slot metadata.
    fn commit(&self, slot: u32, state: &mut SlotState, new_state: SlotState) {
        let mut new_state = new_state;
        // Raw-VA-only bindings (acceleration structures) carry no native
        // payload; only the side tables change for those.
        let has_payload = new_state
            .flags
            .intersects(DescriptorFlags::VIEW | DescriptorFlags::OFFSET_RANGE);
        if has_payload {
            let (writes, mask) = self.build_writes(slot, new_state.ty, payload_of(&new_state));
            new_state.set_info_mask = mask;
            if !writes.is_empty() {
                self.device.native().update_descriptors(&writes, &[]);
            }
        } else {
            new_state.set_info_mask = 0;
        }

        if new_state.flags.contains(DescriptorFlags::RAW_VA_AUX_BUFFER) {
            if let Some(table) = &self.raw_va_table {
                table.write(slot, new_state.raw_va);
            }
        } else if state.flags.contains(DescriptorFlags::RAW_VA_AUX_BUFFER) {
            if let Some(table) = &self.raw_va_table {
                table.write(slot, 0);
            }
        }
        if new_state.flags.contains(DescriptorFlags::BUFFER_OFFSET) {
            if let Some(table) = &self.buffer_ranges {
                table.write(slot, new_state.bound_range);
            }
        } else if state.flags.contains(DescriptorFlags::BUFFER_OFFSET) {
            if let Some(table) = &self.buffer_ranges {
                table.write(slot, BoundRange::default());
            }
        }

        let type_bits = if has_payload {
            descriptor_type_bits(new_state.ty)
        } else {
            DescriptorTypeBits::RAW_VA
        };
        self.device
            .observer()
            .write_descriptor(self.cookie, slot, type_bits, new_state.cookie);
        *state = new_state;
    }

    pub fn create_cbv(&self, slot: u32, desc: &CbvDesc) -> D12Result<()> {
        self.check_slot(slot, DescriptorHeapKind::CbvSrvUav)?;
        if desc.buffer_location == 0 {
            self.write_null(slot, vk::DescriptorType::UNIFORM_BUFFER);
            return Ok(());
        }
        if desc.size_in_bytes == 0 || desc.size_in_bytes % 256 != 0 {
            return Err(D12Error::InvalidArgument(
                "constant buffer size must be a positive multiple of 256".into(),
            ));
        }

        let Some(owner) = self.device.va_map.deref(desc.buffer_location) else {
            log::warn!(
                "Failed to resolve device address {:#x} for a constant buffer view.",
                desc.buffer_location
            );
            self.write_null(slot, vk::DescriptorType::UNIFORM_BUFFER);
            return Ok(());
        };
        let offset = desc.buffer_location - owner.va;
        let region = BufferRegion {
            buffer: owner.vk_buffer,
            offset,
            range: u64::from(desc.size_in_bytes).min(owner.size - offset),
        };

        let mut flags = DescriptorFlags::OFFSET_RANGE | DescriptorFlags::NON_NULL;
        if self.device.caps.raw_va_aux_buffer {
            flags |= DescriptorFlags::RAW_VA_AUX_BUFFER;
        }

        let slot_ref = &self.slots[slot as usize];
        let mut state = slot_ref.lock();
        // Identical rebind short-circuit. A live raw-VA side channel
        // forces the rewrite since the table may be stale.
        if state.cookie == owner.cookie
            && state.buffer == region
            && state.flags == flags
            && !state.flags.contains(DescriptorFlags::RAW_VA_AUX_BUFFER)
        {
            return Ok(());
        }

        self.commit(
            slot,
            &mut state,
            SlotState {
                cookie: owner.cookie,
                flags,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                buffer: region,
                raw_va: desc.buffer_location,
                ..SlotState::default()
            },
        );
        Ok(())
    }

    pub fn create_srv(
        &self,
        slot: u32,
        resource: Option<&ResourceHandle>,
        desc: &SrvDesc,
    ) -> D12Result<()> {
        self.check_slot(slot, DescriptorHeapKind::CbvSrvUav)?;

        match desc {
            SrvDesc::AccelerationStructure { location } => {
                if !self.device.caps.raw_va_aux_buffer {
                    return Err(D12Error::Unsupported(
                        "acceleration structure views require the raw address table".into(),
                    ));
                }
                if *location == 0 {
                    self.write_null(slot, vk::DescriptorType::UNIFORM_BUFFER);
                    return Ok(());
                }
                let slot_ref = &self.slots[slot as usize];
                let mut state = slot_ref.lock();
                // No native view exists; the address is the identity and
                // the cookie stays zero.
                let new_state = SlotState {
                    flags: DescriptorFlags::RAW_VA_AUX_BUFFER | DescriptorFlags::NON_NULL,
                    raw_va: *location,
                    ..SlotState::default()
                };
                if let Some(table) = &self.raw_va_table {
                    table.write(slot, *location);
                }
                if state.flags.contains(DescriptorFlags::BUFFER_OFFSET) {
                    if let Some(table) = &self.buffer_ranges {
                        table.write(slot, BoundRange::default());
                    }
                }
                self.device.observer().write_descriptor(
                    self.cookie,
                    slot,
                    DescriptorTypeBits::RAW_VA | DescriptorTypeBits::ACCELERATION_STRUCTURE,
                    0,
                );
                *state = new_state;
                Ok(())
            }
            SrvDesc::Buffer(buffer_desc) => {
                let Some(resource) = resource else {
                    self.write_null(slot, vk::DescriptorType::UNIFORM_TEXEL_BUFFER);
                    return Ok(());
                };
                self.write_buffer_view(slot, resource, buffer_desc, false)
            }
            SrvDesc::Texture(texture_desc) => {
                let Some(resource) = resource else {
                    self.write_null(slot, vk::DescriptorType::SAMPLED_IMAGE);
                    return Ok(());
                };
                self.write_texture_view(slot, resource, texture_desc, false)
            }
        }
    }

    pub fn create_uav(
        &self,
        slot: u32,
        resource: Option<&ResourceHandle>,
        desc: &UavDesc,
    ) -> D12Result<()> {
        self.check_slot(slot, DescriptorHeapKind::CbvSrvUav)?;
        match desc {
            UavDesc::Buffer(buffer_desc) => {
                let Some(resource) = resource else {
                    self.write_null(slot, vk::DescriptorType::STORAGE_TEXEL_BUFFER);
                    return Ok(());
                };
                self.write_buffer_view(slot, resource, buffer_desc, true)
            }
            UavDesc::Texture(texture_desc) => {
                let Some(resource) = resource else {
                    self.write_null(slot, vk::DescriptorType::STORAGE_IMAGE);
                    return Ok(());
                };
                self.write_texture_view(slot, resource, texture_desc, true)
            }
        }
    }

    fn write_buffer_view(
        &self,
        slot: u32,
        resource: &ResourceHandle,
        desc: &BufferViewDesc,
        writable: bool,
    ) -> D12Result<()> {
        let NativeResource::Buffer(buffer) = resource.native else {
            return Err(D12Error::InvalidArgument(
                "buffer view requested on an image resource".into(),
            ));
        };

        let stride = if desc.structure_byte_stride > 0 {
            desc.structure_byte_stride
        } else if desc.raw {
            4
        } else {
            let format = desc.format.unwrap_or(Format::Unknown);
            match self.device.formats().format_for(format, None) {
                Some(descriptor) => descriptor.byte_count,
                None => {
                    log::warn!("Unresolvable buffer view format {:?}.", format);
                    self.write_null(
                        slot,
                        if writable {
                            vk::DescriptorType::STORAGE_TEXEL_BUFFER
                        } else {
                            vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                        },
                    );
                    return Ok(());
                }
            }
        };
        let byte_count = u64::from(desc.num_elements) * u64::from(stride);
        let in_bounds = desc
            .first_element
            .checked_mul(u64::from(stride))
            .and_then(|offset| offset.checked_add(byte_count))
            .is_some_and(|end| end <= resource.desc.width);
        if !in_bounds {
            return Err(D12Error::InvalidArgument(
                "buffer view range exceeds the resource".into(),
            ));
        }
        let byte_offset = desc.first_element * u64::from(stride);

        let structured_or_raw = desc.structure_byte_stride > 0 || desc.raw;
        let bindless_flags = self.device.bindless().flags;

        // Raw and structured access can go through a plain storage-buffer
        // descriptor when the backend carries the bound-range side table.
        if structured_or_raw && bindless_flags.contains(BindlessFlags::SSBO_OFFSET_BUFFER) {
            let alignment = self.device.caps.ssbo_alignment.max(1);
            let aligned = align_down(byte_offset, alignment);
            let region = BufferRegion {
                buffer,
                offset: aligned,
                range: (byte_offset + byte_count) - aligned,
            };
            let slot_ref = &self.slots[slot as usize];
            let mut state = slot_ref.lock();
            self.commit(
                slot,
                &mut state,
                SlotState {
                    cookie: resource.cookie,
                    flags: DescriptorFlags::OFFSET_RANGE
                        | DescriptorFlags::BUFFER_OFFSET
                        | DescriptorFlags::NON_NULL,
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    buffer: region,
                    bound_range: BoundRange {
                        offset: byte_offset,
                        length: byte_count,
                    },
                    resource: Some(Arc::clone(resource.resource())),
                    ..SlotState::default()
                },
            );
            return Ok(());
        }

        let vk_format = if desc.raw || desc.structure_byte_stride > 0 {
            vk::Format::R32_UINT
        } else {
            let format = desc.format.unwrap_or(Format::Unknown);
            match self.device.formats().format_for(format, None) {
                Some(descriptor) => descriptor.vk_format,
                None => vk::Format::R32_UINT,
            }
        };

        // Quantized keys: nearby ranges share one cached view and the
        // exact range travels out-of-band.
        let quantized = bindless_flags.contains(BindlessFlags::TYPED_OFFSET_BUFFER);
        let (key_offset, key_size, flags, bound_range) = if quantized {
            let quantum = u64::from(TYPED_OFFSET_QUANTUM) * u64::from(stride);
            let size = align_up_u64(byte_offset + byte_count, quantum)
                .min(resource.desc.width)
                .min(self.device.caps.max_texel_buffer_elements as u64 * u64::from(stride));
            (
                0,
                size,
                DescriptorFlags::VIEW | DescriptorFlags::BUFFER_OFFSET | DescriptorFlags::NON_NULL,
                BoundRange {
                    offset: byte_offset,
                    length: byte_count,
                },
            )
        } else {
            (
                byte_offset,
                byte_count,
                DescriptorFlags::VIEW | DescriptorFlags::NON_NULL,
                BoundRange::default(),
            )
        };

        let key = ViewKey::Buffer {
            buffer,
            format: vk_format,
            offset: key_offset,
            size: key_size,
        };
        let view = match resource.views.get_or_create(
            self.device.native(),
            &self.device.cookies,
            &key,
        ) {
            Ok(view) => view,
            Err(e) => {
                log::warn!("Failed to create buffer view: {}.", e);
                self.write_null(
                    slot,
                    if writable {
                        vk::DescriptorType::STORAGE_TEXEL_BUFFER
                    } else {
                        vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                    },
                );
                return Ok(());
            }
        };

        let slot_ref = &self.slots[slot as usize];
        let mut state = slot_ref.lock();
        self.commit(
            slot,
            &mut state,
            SlotState {
                cookie: resource.cookie,
                flags,
                ty: if writable {
                    vk::DescriptorType::STORAGE_TEXEL_BUFFER
                } else {
                    vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                },
                bound_range,
                view: Some(view),
                resource: Some(Arc::clone(resource.resource())),
                ..SlotState::default()
            },
        );
        Ok(())
    }

    fn write_texture_view(
        &self,
        slot: u32,
        resource: &ResourceHandle,
        desc: &TextureViewDesc,
        writable: bool,
    ) -> D12Result<()> {
        let NativeResource::Image(image) = resource.native else {
            return Err(D12Error::InvalidArgument(
                "texture view requested on a buffer resource".into(),
            ));
        };
        if writable && resource.format.is_compressed() {
            return Err(D12Error::InvalidArgument(
                "unordered access to compressed formats is invalid".into(),
            ));
        }

        let format = match desc.format {
            Some(format) => match self.device.formats().format_for(resource.desc.format, Some(format))
            {
                Some(descriptor) => descriptor,
                None => {
                    log::warn!("Unresolvable texture view format {:?}.", format);
                    self.write_null(
                        slot,
                        if writable {
                            vk::DescriptorType::STORAGE_IMAGE
                        } else {
                            vk::DescriptorType::SAMPLED_IMAGE
                        },
                    );
                    return Ok(());
                }
            },
            None => resource.format,
        };

        let total_mips = u32::from(resource.desc.mip_levels);
        let total_layers = resource.desc.array_layers();
        if desc.most_detailed_mip >= total_mips || desc.first_array_layer >= total_layers {
            return Err(D12Error::InvalidArgument(
                "view subrange outside the resource".into(),
            ));
        }
        let mip_count = match desc.mip_levels {
            u32::MAX => total_mips - desc.most_detailed_mip,
            count if u64::from(desc.most_detailed_mip) + u64::from(count) <= u64::from(total_mips) => {
                count
            }
            _ => {
                return Err(D12Error::InvalidArgument(
                    "view mip range outside the resource".into(),
                ))
            }
        };
        let layer_count = match desc.array_layer_count {
            u32::MAX => total_layers - desc.first_array_layer,
            count
                if u64::from(desc.first_array_layer) + u64::from(count)
                    <= u64::from(total_layers) =>
            {
                count
            }
            _ => {
                return Err(D12Error::InvalidArgument(
                    "view layer range outside the resource".into(),
                ))
            }
        };

        // Sampled depth-stencil views read the depth aspect; the plane
        // table drives multi-planar aspects.
        let aspect_mask = if format.plane_count > 1 {
            format.aspect_for_plane(desc.plane_slice)
        } else if format.is_depth_stencil() {
            vk::ImageAspectFlags::DEPTH
        } else {
            format.aspect_mask
        };

        let key = ViewKey::Image {
            image,
            view_type: image_view_type(resource.desc.dimension, total_layers),
            format: format.vk_format,
            aspect_mask,
            base_mip: desc.most_detailed_mip,
            mip_count: if writable { 1 } else { mip_count },
            base_layer: desc.first_array_layer,
            layer_count,
            swizzle: IDENTITY_SWIZZLE,
            min_lod_bits: if writable {
                0
            } else {
                desc.min_lod_clamp.to_bits()
            },
        };
        let view = match resource.views.get_or_create(
            self.device.native(),
            &self.device.cookies,
            &key,
        ) {
            Ok(view) => view,
            Err(e) => {
                log::warn!("Failed to create image view: {}.", e);
                self.write_null(
                    slot,
                    if writable {
                        vk::DescriptorType::STORAGE_IMAGE
                    } else {
                        vk::DescriptorType::SAMPLED_IMAGE
                    },
                );
                return Ok(());
            }
        };
        self.device
            .observer()
            .register_view(view.cookie, resource.cookie);

        let slot_ref = &self.slots[slot as usize];
        let mut state = slot_ref.lock();
        self.commit(
            slot,
            &mut state,
            SlotState {
                cookie: resource.cookie,
                flags: DescriptorFlags::VIEW | DescriptorFlags::NON_NULL,
                ty: if writable {
                    vk::DescriptorType::STORAGE_IMAGE
                } else {
                    vk::DescriptorType::SAMPLED_IMAGE
                },
                // Unordered access always reads and writes through the
                // generic layout; sampled views rest in the common layout.
                image_layout: if writable {
                    vk::ImageLayout::GENERAL
                } else {
                    resource.common_layout
                },
                view: Some(view),
                resource: Some(Arc::clone(resource.resource())),
                ..SlotState::default()
            },
        );
        Ok(())
    }

    pub fn create_sampler(&self, slot: u32, desc: &SamplerDesc) -> D12Result<()> {
        self.check_slot(slot, DescriptorHeapKind::Sampler)?;
        let key = ViewKey::Sampler(SamplerKey::new(desc));
        let view = self.device.sampler_map.get_or_create(
            self.device.native(),
            &self.device.cookies,
            &key,
        )?;

        let slot_ref = &self.slots[slot as usize];
        let mut state = slot_ref.lock();
        if state.cookie == view.cookie && state.flags.contains(DescriptorFlags::NON_NULL) {
            return Ok(());
        }
        self.commit(
            slot,
            &mut state,
            SlotState {
                cookie: view.cookie,
                flags: DescriptorFlags::VIEW | DescriptorFlags::NON_NULL,
                ty: vk::DescriptorType::SAMPLER,
                view: Some(view),
                ..SlotState::default()
            },
        );
        Ok(())
    }

    /// Copy `count` contiguous slots from `src`.
    ///
    /// With a mutable-type backend the native sets support a true bulk
    /// copy; otherwise slots copy one at a time, skipping slots whose
    /// destination already matches.
    pub fn copy_descriptors(
        &self,
        dst_start: u32,
        src: &DescriptorHeap,
        src_start: u32,
        count: u32,
    ) -> D12Result<()> {
        if self.desc.kind != src.desc.kind {
            return Err(D12Error::InvalidArgument(
                "descriptor copy across heap kinds".into(),
            ));
        }
        let dst_in_bounds = dst_start
            .checked_add(count)
            .is_some_and(|end| end <= self.desc.capacity);
        let src_in_bounds = src_start
            .checked_add(count)
            .is_some_and(|end| end <= src.desc.capacity);
        if !dst_in_bounds || !src_in_bounds {
            return Err(D12Error::InvalidArgument(
                "descriptor copy range out of bounds".into(),
            ));
        }
        if count == 0 {
            return Ok(());
        }

        let bindless = self.device.bindless();
        let bulk = bindless.flags.contains(BindlessFlags::MUTABLE_TYPE)
            && !self.sets.is_empty();

        if bulk {
            let mut copies = Vec::with_capacity(self.sets.len());
            for ((dst_info, dst_set), (src_info, src_set)) in self.sets.iter().zip(&src.sets) {
                let info = bindless.set_info(*dst_info);
                debug_assert_eq!(dst_info, src_info);
                copies.push(DescriptorCopy {
                    src_set: *src_set,
                    src_binding: info.binding_index,
                    src_array_element: src_start,
                    dst_set: *dst_set,
                    dst_binding: info.binding_index,
                    dst_array_element: dst_start,
                    count,
                });
            }
            self.device.native().update_descriptors(&[], &copies);

            if let (Some(dst_table), Some(src_table)) = (&self.raw_va_table, &src.raw_va_table) {
                dst_table.copy_range(dst_start, src_table, src_start, count);
            }
            if let (Some(dst_table), Some(src_table)) = (&self.buffer_ranges, &src.buffer_ranges) {
                dst_table.copy_range(dst_start, src_table, src_start, count);
            }

            for i in 0..count {
                let snapshot = src.slots[(src_start + i) as usize].snapshot();
                let cookie = snapshot.cookie;
                *self.slots[(dst_start + i) as usize].lock() = snapshot;
                self.device.observer().copy_descriptor(
                    self.cookie,
                    dst_start + i,
                    src.cookie,
                    src_start + i,
                    cookie,
                );
            }
            return Ok(());
        }

        for i in 0..count {
            let snapshot = src.slots[(src_start + i) as usize].snapshot();
            let dst_slot = dst_start + i;
            {
                let mut state = self.slots[dst_slot as usize].lock();
                // Repeatedly copying an unchanged descriptor is common;
                // a cookie and side-channel match costs no native update.
                let unchanged = snapshot.cookie != 0
                    && state.cookie == snapshot.cookie
                    && state.flags == snapshot.flags
                    && state.buffer == snapshot.buffer
                    && state.bound_range == snapshot.bound_range;
                if unchanged {
                    continue;
                }

                if snapshot.flags.contains(DescriptorFlags::NON_NULL) {
                    self.commit(dst_slot, &mut state, snapshot.clone());
                } else {
                    drop(state);
                    self.write_null(dst_slot, snapshot.null_placeholder);
                }
            }
            self.device.observer().copy_descriptor(
                self.cookie,
                dst_slot,
                src.cookie,
                src_start + i,
                snapshot.cookie,
            );
        }
        Ok(())
    }

    pub fn create_rtv(
        &self,
        slot: u32,
        resource: Option<&ResourceHandle>,
        desc: &TextureViewDesc,
    ) -> D12Result<()> {
        self.write_cpu_view(DescriptorHeapKind::Rtv, slot, resource, desc)
    }

    pub fn create_dsv(
        &self,
        slot: u32,
        resource: Option<&ResourceHandle>,
        desc: &TextureViewDesc,
    ) -> D12Result<()> {
        self.write_cpu_view(DescriptorHeapKind::Dsv, slot, resource, desc)
    }

    /// Render-target and depth-stencil slots are CPU-only bookkeeping:
    /// the view is cached on the resource, nothing is written natively.
    fn write_cpu_view(
        &self,
        kind: DescriptorHeapKind,
        slot: u32,
        resource: Option<&ResourceHandle>,
        desc: &TextureViewDesc,
    ) -> D12Result<()> {
        self.check_slot(slot, kind)?;
        let Some(resource) = resource else {
            *self.slots[slot as usize].lock() = SlotState::default();
            return Ok(());
        };
        let NativeResource::Image(image) = resource.native else {
            return Err(D12Error::InvalidArgument(
                "attachment view requested on a buffer resource".into(),
            ));
        };

        let format = resource.format;
        let aspect_mask = if kind == DescriptorHeapKind::Dsv {
            format.aspect_mask
                & (vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
        } else {
            vk::ImageAspectFlags::COLOR
        };
        if aspect_mask.is_empty() {
            return Err(D12Error::InvalidArgument(
                "resource format does not match the heap kind".into(),
            ));
        }

        let total_layers = resource.desc.array_layers();
        if desc.first_array_layer >= total_layers {
            return Err(D12Error::InvalidArgument(
                "view layer range outside the resource".into(),
            ));
        }
        let layer_count = match desc.array_layer_count {
            u32::MAX => total_layers - desc.first_array_layer,
            count => count,
        };
        let key = ViewKey::Image {
            image,
            view_type: image_view_type(resource.desc.dimension, total_layers),
            format: format.vk_format,
            aspect_mask,
            base_mip: desc.most_detailed_mip,
            mip_count: 1,
            base_layer: desc.first_array_layer,
            layer_count,
            swizzle: IDENTITY_SWIZZLE,
            min_lod_bits: 0,
        };
        let view = resource.views.get_or_create(
            self.device.native(),
            &self.device.cookies,
            &key,
        )?;

        *self.slots[slot as usize].lock() = SlotState {
            cookie: resource.cookie,
            flags: DescriptorFlags::VIEW | DescriptorFlags::NON_NULL,
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            image_layout: if kind == DescriptorHeapKind::Dsv {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            },
            view: Some(view),
            resource: Some(Arc::clone(resource.resource())),
            ..SlotState::default()
        };
        Ok(())
    }

    pub fn slot_state(&self, slot: u32) -> SlotState {
        self.slots[slot as usize].snapshot()
    }
}

/// Reconstruct the native payload a bound slot state describes.
fn payload_of(state: &SlotState) -> DescriptorPayload {
    if !state.flags.contains(DescriptorFlags::NON_NULL) {
        return DescriptorPayload::Null;
    }
    match state.ty {
        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER => {
            DescriptorPayload::Buffer(state.buffer)
        }
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
            match &state.view {
                Some(view) => DescriptorPayload::TexelBuffer(view.buffer_view()),
                None => DescriptorPayload::Null,
            }
        }
        vk::DescriptorType::SAMPLED_IMAGE | vk::DescriptorType::STORAGE_IMAGE => {
            match &state.view {
                Some(view) => DescriptorPayload::Image {
                    view: view.image_view(),
                    layout: state.image_layout,
                },
                None => DescriptorPayload::Null,
            }
        }
        vk::DescriptorType::SAMPLER => match &state.view {
            Some(view) => DescriptorPayload::Sampler(view.sampler()),
            None => DescriptorPayload::Null,
        },
        _ => DescriptorPayload::Null,
    }
}
