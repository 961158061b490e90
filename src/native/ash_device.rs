//! `ash`-backed implementation of the native device boundary.

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;

use crate::error::{D12Error, D12Result};

use super::{
    BufferCreateInfo, DescriptorCopy, DescriptorPayload, DescriptorWrite, ImageCreateInfo,
    ImageViewCreateInfo, NativeDevice, SamplerCreateInfo,
};

/// A null write targeting a sampler binding has nothing to marshal:
/// `VkDescriptorImageInfo::sampler` must be a live sampler.
fn is_null_sampler_write(write: &DescriptorWrite) -> bool {
    write.ty == vk::DescriptorType::SAMPLER
        && matches!(write.payload, DescriptorPayload::Null)
}

/// Production [`NativeDevice`] wrapping an `ash::Device`.
///
/// Descriptor set layouts for bindless sets are keyed by
/// (descriptor type, capacity) and cached for the device's lifetime.
pub struct AshDevice {
    device: ash::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    buffer_device_address: bool,
    set_layouts: Mutex<HashMap<(vk::DescriptorType, u32), vk::DescriptorSetLayout>>,
}

impl AshDevice {
    pub fn new(
        device: ash::Device,
        debug_utils: Option<ash::ext::debug_utils::Device>,
        buffer_device_address: bool,
    ) -> Self {
        Self {
            device,
            debug_utils,
            buffer_device_address,
            set_layouts: Mutex::new(HashMap::new()),
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn bindless_set_layout(
        &self,
        ty: vk::DescriptorType,
        capacity: u32,
    ) -> D12Result<vk::DescriptorSetLayout> {
        let mut layouts = self.set_layouts.lock();
        if let Some(layout) = layouts.get(&(ty, capacity)) {
            return Ok(*layout);
        }

        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(ty)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL);
        let bindings = [binding];

        let binding_flags = [vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(D12Error::from_vk)?;
        layouts.insert((ty, capacity), layout);
        Ok(layout)
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        let layouts = std::mem::take(&mut *self.set_layouts.lock());
        for (_, layout) in layouts {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
    }
}

impl NativeDevice for AshDevice {
    fn create_buffer(&self, info: &BufferCreateInfo) -> D12Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .flags(info.flags)
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|vr| {
            log::warn!("Failed to create buffer, vr {:?}", vr);
            D12Error::from_vk(vr)
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&self, info: &ImageCreateInfo) -> D12Result<vk::Image> {
        let mut format_list =
            vk::ImageFormatListCreateInfo::default().view_formats(&info.view_formats);

        let mut image_info = vk::ImageCreateInfo::default()
            .flags(info.flags)
            .image_type(info.image_type)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(info.samples)
            .tiling(info.tiling)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        if !info.view_formats.is_empty() {
            image_info = image_info.push_next(&mut format_list);
        }

        unsafe { self.device.create_image(&image_info, None) }.map_err(|vr| {
            log::warn!("Failed to create image, vr {:?}", vr);
            D12Error::from_vk(vr)
        })
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn image_sparse_memory_requirements(
        &self,
        image: vk::Image,
    ) -> Vec<vk::SparseImageMemoryRequirements> {
        unsafe { self.device.get_image_sparse_memory_requirements(image) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> D12Result<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
            .map_err(D12Error::from_vk)
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> D12Result<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }.map_err(D12Error::from_vk)
    }

    fn create_buffer_view(
        &self,
        buffer: vk::Buffer,
        format: vk::Format,
        offset: u64,
        range: u64,
    ) -> D12Result<vk::BufferView> {
        let view_info = vk::BufferViewCreateInfo::default()
            .buffer(buffer)
            .format(format)
            .offset(offset)
            .range(range);

        unsafe { self.device.create_buffer_view(&view_info, None) }.map_err(|vr| {
            log::warn!("Failed to create buffer view, vr {:?}", vr);
            D12Error::from_vk(vr)
        })
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        unsafe { self.device.destroy_buffer_view(view, None) };
    }

    fn create_image_view(&self, info: &ImageViewCreateInfo) -> D12Result<vk::ImageView> {
        let mut min_lod =
            vk::ImageViewMinLodCreateInfoEXT::default().min_lod(info.min_lod_clamp);

        let mut view_info = vk::ImageViewCreateInfo::default()
            .image(info.image)
            .view_type(info.view_type)
            .format(info.format)
            .components(info.components)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: info.aspect_mask,
                base_mip_level: info.base_mip_level,
                level_count: info.level_count,
                base_array_layer: info.base_array_layer,
                layer_count: info.layer_count,
            });

        if info.min_lod_clamp != 0.0 {
            view_info = view_info.push_next(&mut min_lod);
        }

        unsafe { self.device.create_image_view(&view_info, None) }.map_err(|vr| {
            log::warn!("Failed to create image view, vr {:?}", vr);
            D12Error::from_vk(vr)
        })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, info: &SamplerCreateInfo) -> D12Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(info.mag_filter)
            .min_filter(info.min_filter)
            .mipmap_mode(info.mipmap_mode)
            .address_mode_u(info.address_mode_u)
            .address_mode_v(info.address_mode_v)
            .address_mode_w(info.address_mode_w)
            .mip_lod_bias(info.mip_lod_bias)
            .anisotropy_enable(info.anisotropy_enable)
            .max_anisotropy(info.max_anisotropy)
            .compare_enable(info.compare_enable)
            .compare_op(info.compare_op)
            .min_lod(info.min_lod)
            .max_lod(info.max_lod)
            .border_color(info.border_color)
            .unnormalized_coordinates(false);

        unsafe { self.device.create_sampler(&sampler_info, None) }.map_err(|vr| {
            log::warn!("Failed to create sampler, vr {:?}", vr);
            D12Error::from_vk(vr)
        })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[(vk::DescriptorType, u32)],
        max_sets: u32,
    ) -> D12Result<vk::DescriptorPool> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|&(ty, count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        unsafe { self.device.create_descriptor_pool(&pool_info, None) }.map_err(|vr| {
            log::warn!("Failed to create descriptor pool, vr {:?}", vr);
            D12Error::from_vk(vr)
        })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        ty: vk::DescriptorType,
        capacity: u32,
    ) -> D12Result<vk::DescriptorSet> {
        let layout = self.bindless_set_layout(ty, capacity)?;
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(D12Error::from_vk)?;
        Ok(sets[0])
    }

    fn update_descriptors(&self, writes: &[DescriptorWrite], copies: &[DescriptorCopy]) {
        // Vulkan has no null sampler object; those slots stay unwritten
        // and rely on the partially-bound set layouts.
        let writes: Vec<&DescriptorWrite> = writes
            .iter()
            .filter(|write| !is_null_sampler_write(write))
            .collect();

        // Payload arrays must outlive the write structs; gather them first
        // (same scratch pattern the encoder uses for per-draw updates).
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut image_infos = Vec::with_capacity(writes.len());
        let mut texel_views = Vec::with_capacity(writes.len());

        for write in &writes {
            match write.payload {
                DescriptorPayload::Buffer(region) => buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: region.buffer,
                    offset: region.offset,
                    range: region.range,
                }),
                DescriptorPayload::Image { view, layout } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: layout,
                    })
                }
                DescriptorPayload::Sampler(sampler) => image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }),
                DescriptorPayload::TexelBuffer(view) => texel_views.push(view),
                DescriptorPayload::Null => match write.ty {
                    vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER => {
                        buffer_infos.push(vk::DescriptorBufferInfo {
                            buffer: vk::Buffer::null(),
                            offset: 0,
                            range: vk::WHOLE_SIZE,
                        })
                    }
                    vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                    | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                        texel_views.push(vk::BufferView::null())
                    }
                    _ => image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    }),
                },
            }
        }

        let mut vk_writes = Vec::with_capacity(writes.len());
        let mut buffer_cursor = 0;
        let mut image_cursor = 0;
        let mut texel_cursor = 0;

        for write in &writes {
            let mut vk_write = vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .dst_array_element(write.array_element)
                .descriptor_type(write.ty);

            let uses_buffer_info = matches!(write.payload, DescriptorPayload::Buffer(_))
                || (matches!(write.payload, DescriptorPayload::Null)
                    && matches!(
                        write.ty,
                        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER
                    ));
            let uses_texel_view = matches!(write.payload, DescriptorPayload::TexelBuffer(_))
                || (matches!(write.payload, DescriptorPayload::Null)
                    && matches!(
                        write.ty,
                        vk::DescriptorType::UNIFORM_TEXEL_BUFFER
                            | vk::DescriptorType::STORAGE_TEXEL_BUFFER
                    ));

            if uses_buffer_info {
                vk_write = vk_write.buffer_info(&buffer_infos[buffer_cursor..buffer_cursor + 1]);
                buffer_cursor += 1;
            } else if uses_texel_view {
                vk_write = vk_write.texel_buffer_view(&texel_views[texel_cursor..texel_cursor + 1]);
                texel_cursor += 1;
            } else {
                vk_write = vk_write.image_info(&image_infos[image_cursor..image_cursor + 1]);
                image_cursor += 1;
            }

            vk_writes.push(vk_write);
        }

        let vk_copies: Vec<vk::CopyDescriptorSet> = copies
            .iter()
            .map(|copy| {
                vk::CopyDescriptorSet::default()
                    .src_set(copy.src_set)
                    .src_binding(copy.src_binding)
                    .src_array_element(copy.src_array_element)
                    .dst_set(copy.dst_set)
                    .dst_binding(copy.dst_binding)
                    .dst_array_element(copy.dst_array_element)
                    .descriptor_count(copy.count)
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &vk_copies) };
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> Option<u64> {
        if !self.buffer_device_address {
            return None;
        }
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        Some(unsafe { self.device.get_buffer_device_address(&info) })
    }

    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(name) else {
            return;
        };
        let mut info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(&name);
        info.object_type = object_type;
        info.object_handle = handle;
        if let Err(vr) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            log::trace!("Failed to set object name, vr {:?}", vr);
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    #[test]
    fn test_null_sampler_writes_are_dropped() {
        let null_sampler = DescriptorWrite {
            set: vk::DescriptorSet::null(),
            binding: 0,
            array_element: 0,
            ty: vk::DescriptorType::SAMPLER,
            payload: DescriptorPayload::Null,
        };
        assert!(is_null_sampler_write(&null_sampler));

        let bound_sampler = DescriptorWrite {
            payload: DescriptorPayload::Sampler(vk::Sampler::from_raw(1)),
            ..null_sampler
        };
        assert!(!is_null_sampler_write(&bound_sampler));

        // Null image and buffer writes marshal fine through null handles.
        let null_image = DescriptorWrite {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            ..null_sampler
        };
        assert!(!is_null_sampler_write(&null_image));
    }
}
