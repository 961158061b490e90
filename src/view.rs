//! Per-resource cache of native views, keyed by structural identity.
//!
//! Lookup is optimized for the common hit path: a read-locked probe, an
//! unlocked native create on miss, then a write-locked insert that
//! reconciles the benign race where two threads created the same view
//! concurrently (the loser destroys its redundant native object).

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::RwLock;

use crate::cookie::{Cookie, CookieAllocator};
use crate::error::D12Result;
use crate::native::{ImageViewCreateInfo, NativeDevice};
use crate::sampler::SamplerKey;

/// Structural identity of a native view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKey {
    Buffer {
        buffer: vk::Buffer,
        format: vk::Format,
        offset: u64,
        size: u64,
    },
    Image {
        image: vk::Image,
        view_type: vk::ImageViewType,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
        swizzle: [vk::ComponentSwizzle; 4],
        /// `f32::to_bits` of the minimum LOD clamp.
        min_lod_bits: u32,
    },
    Sampler(SamplerKey),
}

/// Native handle owned by a cached view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewHandle {
    Buffer(vk::BufferView),
    Image(vk::ImageView),
    Sampler(vk::Sampler),
}

/// A cached native view. The native object is owned by the map that
/// created it and destroyed on map teardown, not on `Drop`.
#[derive(Debug)]
pub struct View {
    pub handle: ViewHandle,
    pub cookie: Cookie,
}

impl View {
    pub fn buffer_view(&self) -> vk::BufferView {
        match self.handle {
            ViewHandle::Buffer(view) => view,
            _ => vk::BufferView::null(),
        }
    }

    pub fn image_view(&self) -> vk::ImageView {
        match self.handle {
            ViewHandle::Image(view) => view,
            _ => vk::ImageView::null(),
        }
    }

    pub fn sampler(&self) -> vk::Sampler {
        match self.handle {
            ViewHandle::Sampler(sampler) => sampler,
            _ => vk::Sampler::null(),
        }
    }
}

#[derive(Default)]
struct ViewMapInner {
    views: HashMap<ViewKey, Arc<View>>,
    insert_count: u64,
}

/// View cache attached to a resource (or to the device, for samplers).
#[derive(Default)]
pub struct ViewMap {
    inner: RwLock<ViewMapInner>,
}

impl ViewMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the view identified by `key`, creating it on miss.
    pub fn get_or_create(
        &self,
        native: &dyn NativeDevice,
        cookies: &CookieAllocator,
        key: &ViewKey,
    ) -> D12Result<Arc<View>> {
        {
            let inner = self.inner.read();
            if let Some(view) = inner.views.get(key) {
                return Ok(Arc::clone(view));
            }
        }

        // Native creation happens outside any lock. Two threads may race
        // here; the insert below reconciles.
        let handle = create_native(native, key)?;
        let view = Arc::new(View {
            handle,
            cookie: cookies.allocate(),
        });

        let mut inner = self.inner.write();
        if let Some(existing) = inner.views.get(key) {
            let existing = Arc::clone(existing);
            drop(inner);
            destroy_native(native, handle);
            return Ok(existing);
        }
        inner.views.insert(*key, Arc::clone(&view));
        inner.insert_count += 1;
        if inner.insert_count % 1024 == 0 {
            log::warn!(
                "View map is growing large ({} inserts).",
                inner.insert_count
            );
        }
        Ok(view)
    }

    pub fn get(&self, key: &ViewKey) -> Option<Arc<View>> {
        self.inner.read().views.get(key).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.inner.read().views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().views.is_empty()
    }

    /// Destroy every cached native view and clear the map. Descriptors
    /// referencing these views must already be rewritten or released.
    pub fn destroy(&self, native: &dyn NativeDevice) {
        let mut inner = self.inner.write();
        for (_, view) in inner.views.drain() {
            destroy_native(native, view.handle);
        }
    }
}

fn create_native(native: &dyn NativeDevice, key: &ViewKey) -> D12Result<ViewHandle> {
    match *key {
        ViewKey::Buffer {
            buffer,
            format,
            offset,
            size,
        } => Ok(ViewHandle::Buffer(native.create_buffer_view(
            buffer, format, offset, size,
        )?)),
        ViewKey::Image {
            image,
            view_type,
            format,
            aspect_mask,
            base_mip,
            mip_count,
            base_layer,
            layer_count,
            swizzle,
            min_lod_bits,
        } => {
            let info = ImageViewCreateInfo {
                image,
                view_type,
                format,
                components: vk::ComponentMapping {
                    r: swizzle[0],
                    g: swizzle[1],
                    b: swizzle[2],
                    a: swizzle[3],
                },
                aspect_mask,
                base_mip_level: base_mip,
                level_count: mip_count,
                base_array_layer: base_layer,
                layer_count,
                min_lod_clamp: f32::from_bits(min_lod_bits),
            };
            Ok(ViewHandle::Image(native.create_image_view(&info)?))
        }
        ViewKey::Sampler(sampler_key) => Ok(ViewHandle::Sampler(
            native.create_sampler(&sampler_key.desc().to_native())?,
        )),
    }
}

fn destroy_native(native: &dyn NativeDevice, handle: ViewHandle) {
    match handle {
        ViewHandle::Buffer(view) => native.destroy_buffer_view(view),
        ViewHandle::Image(view) => native.destroy_image_view(view),
        ViewHandle::Sampler(sampler) => native.destroy_sampler(sampler),
    }
}

/// Identity swizzle, the default for every view key.
pub const IDENTITY_SWIZZLE: [vk::ComponentSwizzle; 4] = [
    vk::ComponentSwizzle::IDENTITY,
    vk::ComponentSwizzle::IDENTITY,
    vk::ComponentSwizzle::IDENTITY,
    vk::ComponentSwizzle::IDENTITY,
];
