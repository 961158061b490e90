//! Logical pixel formats and the format/capability table.
//!
//! The format table is an external collaborator: the core only needs the
//! native format, aspect mask, block geometry and byte count for the
//! formats a caller actually uses. [`StaticFormatTable`] covers the common
//! subset; a host can substitute its own [`FormatTable`] implementation.

use ash::vk;

use crate::resource::{HeapProperties, HeapType, PageProperty};

/// Logical (API-level) pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Structured / raw buffer data, or "no format".
    #[default]
    Unknown,
    R8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Typeless,
    B8G8R8A8Unorm,
    R16Uint,
    R16G16B16A16Float,
    R32Uint,
    R32Float,
    R32Typeless,
    R32G32B32A32Float,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
    Bc1Unorm,
    Bc3Unorm,
}

/// How shaders interpret the channel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTypeClass {
    Typeless,
    Float,
    Uint,
    Unorm,
    Depth,
    Compressed,
}

/// Resolved per-format properties used for view creation, copies and
/// sub-resource arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub format: Format,
    pub vk_format: vk::Format,
    pub aspect_mask: vk::ImageAspectFlags,
    /// Compression block width in texels (1 for uncompressed formats).
    pub block_width: u32,
    /// Compression block height in texels (1 for uncompressed formats).
    pub block_height: u32,
    /// Bytes per texel, or per block for compressed formats.
    pub byte_count: u32,
    pub type_class: FormatTypeClass,
    /// Aspect of each plane, indexed by plane slice. Plane ordering is
    /// taken from this table, never inferred from aspect bit order.
    pub plane_aspects: [vk::ImageAspectFlags; 2],
    pub plane_count: u32,
}

impl FormatDescriptor {
    /// Placeholder descriptor carried by buffer resources, which have no
    /// format of their own.
    pub fn unknown() -> Self {
        Self {
            format: Format::Unknown,
            vk_format: vk::Format::UNDEFINED,
            aspect_mask: vk::ImageAspectFlags::empty(),
            block_width: 1,
            block_height: 1,
            byte_count: 1,
            type_class: FormatTypeClass::Typeless,
            plane_aspects: [vk::ImageAspectFlags::empty(); 2],
            plane_count: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.type_class == FormatTypeClass::Compressed
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.aspect_mask
            .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    }

    pub fn has_stencil(&self) -> bool {
        self.aspect_mask.contains(vk::ImageAspectFlags::STENCIL)
    }

    /// Aspect mask for a given plane slice, from the explicit plane table.
    pub fn aspect_for_plane(&self, plane_slice: u32) -> vk::ImageAspectFlags {
        if plane_slice < self.plane_count {
            self.plane_aspects[plane_slice as usize]
        } else {
            self.aspect_mask
        }
    }
}

/// Capability/format collaborator consumed by the core.
pub trait FormatTable: Send + Sync {
    /// Resolve a logical format. `view_format` overrides the resource
    /// format when a view reinterprets typeless data.
    fn format_for(&self, format: Format, view_format: Option<Format>) -> Option<FormatDescriptor>;

    /// Native formats a mutable-format image of this logical format may be
    /// reinterpreted as. Empty for fully-typed formats.
    fn compatibility_class(&self, format: Format) -> &[vk::Format];
}

/// Whether memory of this heap type can be mapped for CPU access.
pub fn is_cpu_accessible_heap(heap_properties: &HeapProperties) -> bool {
    match heap_properties.heap_type {
        HeapType::Default => false,
        HeapType::Upload | HeapType::Readback => true,
        HeapType::Custom => heap_properties.page_property != PageProperty::NotAvailable,
    }
}

/// Built-in format table covering the common format subset.
pub struct StaticFormatTable;

const fn color(
    format: Format,
    vk_format: vk::Format,
    byte_count: u32,
    type_class: FormatTypeClass,
) -> FormatDescriptor {
    FormatDescriptor {
        format,
        vk_format,
        aspect_mask: vk::ImageAspectFlags::COLOR,
        block_width: 1,
        block_height: 1,
        byte_count,
        type_class,
        plane_aspects: [vk::ImageAspectFlags::COLOR, vk::ImageAspectFlags::COLOR],
        plane_count: 1,
    }
}

const fn compressed(format: Format, vk_format: vk::Format, byte_count: u32) -> FormatDescriptor {
    FormatDescriptor {
        format,
        vk_format,
        aspect_mask: vk::ImageAspectFlags::COLOR,
        block_width: 4,
        block_height: 4,
        byte_count,
        type_class: FormatTypeClass::Compressed,
        plane_aspects: [vk::ImageAspectFlags::COLOR, vk::ImageAspectFlags::COLOR],
        plane_count: 1,
    }
}

const R32_COMPAT: [vk::Format; 2] = [vk::Format::R32_SFLOAT, vk::Format::R32_UINT];
const RGBA8_COMPAT: [vk::Format; 2] = [vk::Format::R8G8B8A8_UNORM, vk::Format::R8G8B8A8_SRGB];

impl FormatTable for StaticFormatTable {
    fn format_for(&self, format: Format, view_format: Option<Format>) -> Option<FormatDescriptor> {
        let format = view_format.unwrap_or(format);
        let desc = match format {
            Format::Unknown => return None,
            Format::R8Unorm => color(format, vk::Format::R8_UNORM, 1, FormatTypeClass::Unorm),
            Format::R8G8B8A8Unorm => color(
                format,
                vk::Format::R8G8B8A8_UNORM,
                4,
                FormatTypeClass::Unorm,
            ),
            Format::R8G8B8A8Typeless => color(
                format,
                vk::Format::R8G8B8A8_UNORM,
                4,
                FormatTypeClass::Typeless,
            ),
            Format::B8G8R8A8Unorm => color(
                format,
                vk::Format::B8G8R8A8_UNORM,
                4,
                FormatTypeClass::Unorm,
            ),
            Format::R16Uint => color(format, vk::Format::R16_UINT, 2, FormatTypeClass::Uint),
            Format::R16G16B16A16Float => color(
                format,
                vk::Format::R16G16B16A16_SFLOAT,
                8,
                FormatTypeClass::Float,
            ),
            Format::R32Uint => color(format, vk::Format::R32_UINT, 4, FormatTypeClass::Uint),
            Format::R32Float => color(format, vk::Format::R32_SFLOAT, 4, FormatTypeClass::Float),
            Format::R32Typeless => color(format, vk::Format::R32_UINT, 4, FormatTypeClass::Typeless),
            Format::R32G32B32A32Float => color(
                format,
                vk::Format::R32G32B32A32_SFLOAT,
                16,
                FormatTypeClass::Float,
            ),
            Format::D16Unorm => FormatDescriptor {
                format,
                vk_format: vk::Format::D16_UNORM,
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                block_width: 1,
                block_height: 1,
                byte_count: 2,
                type_class: FormatTypeClass::Depth,
                plane_aspects: [vk::ImageAspectFlags::DEPTH, vk::ImageAspectFlags::DEPTH],
                plane_count: 1,
            },
            Format::D32Float => FormatDescriptor {
                format,
                vk_format: vk::Format::D32_SFLOAT,
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                block_width: 1,
                block_height: 1,
                byte_count: 4,
                type_class: FormatTypeClass::Depth,
                plane_aspects: [vk::ImageAspectFlags::DEPTH, vk::ImageAspectFlags::DEPTH],
                plane_count: 1,
            },
            Format::D24UnormS8Uint => FormatDescriptor {
                format,
                vk_format: vk::Format::D24_UNORM_S8_UINT,
                aspect_mask: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                block_width: 1,
                block_height: 1,
                byte_count: 4,
                type_class: FormatTypeClass::Depth,
                plane_aspects: [vk::ImageAspectFlags::DEPTH, vk::ImageAspectFlags::STENCIL],
                plane_count: 2,
            },
            Format::Bc1Unorm => compressed(format, vk::Format::BC1_RGBA_UNORM_BLOCK, 8),
            Format::Bc3Unorm => compressed(format, vk::Format::BC3_UNORM_BLOCK, 16),
        };
        Some(desc)
    }

    fn compatibility_class(&self, format: Format) -> &[vk::Format] {
        match format {
            Format::R32Typeless => &R32_COMPAT,
            Format::R8G8B8A8Typeless => &RGBA8_COMPAT,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_format_overrides_resource_format() {
        let table = StaticFormatTable;
        let desc = table
            .format_for(Format::R32Typeless, Some(Format::R32Float))
            .unwrap();
        assert_eq!(desc.vk_format, vk::Format::R32_SFLOAT);
        assert_eq!(desc.type_class, FormatTypeClass::Float);
    }

    #[test]
    fn test_depth_stencil_plane_table() {
        let table = StaticFormatTable;
        let desc = table.format_for(Format::D24UnormS8Uint, None).unwrap();
        assert_eq!(desc.plane_count, 2);
        assert_eq!(desc.aspect_for_plane(0), vk::ImageAspectFlags::DEPTH);
        assert_eq!(desc.aspect_for_plane(1), vk::ImageAspectFlags::STENCIL);
        assert!(desc.has_stencil());
    }

    #[test]
    fn test_compressed_block_geometry() {
        let table = StaticFormatTable;
        let desc = table.format_for(Format::Bc1Unorm, None).unwrap();
        assert!(desc.is_compressed());
        assert_eq!((desc.block_width, desc.block_height), (4, 4));
    }
}
