//! Sparse (reserved) resource tiling metadata and tile binding.
//!
//! A reserved resource's backing memory is bound tile by tile. Buffers
//! tile linearly; images tile per subresource in a 3D grid, with the
//! smallest mip levels packed into a shared opaque tail region.

use ash::vk;

use crate::device::Device;
use crate::error::{D12Error, D12Result};
use crate::memory::Allocation;
use crate::queue::{QueueCategory, SparseBindInfo, SparseImageBind, SparseMemoryBind};
use crate::resource::{HeapProperties, HeapType, NativeResource, ResourceDesc};

/// Bytes per sparse tile. Fixed by the source API model.
pub const TILE_SIZE: u64 = 0x10000;

/// Texel dimensions of one standard image tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Tile-grid dimensions of one standard (non-packed) subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub depth_in_tiles: u32,
    /// First linear tile index of this subresource.
    pub start_tile: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedMipInfo {
    pub standard_mip_count: u32,
    pub packed_mip_count: u32,
    pub tile_count: u32,
    pub start_tile: u32,
}

/// What a linear tile index addresses within the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileRegion {
    /// A byte range: buffer tiles and packed-mip-tail tiles.
    Opaque { offset: u64, length: u64 },
    /// One tile of a standard image mip level.
    Image {
        mip: u32,
        layer: u32,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBinding {
    pub memory: vk::DeviceMemory,
    pub memory_offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SparseTile {
    pub region: TileRegion,
    pub binding: Option<TileBinding>,
}

/// Snapshot of a resource's tiling layout.
#[derive(Debug, Clone)]
pub struct TilingInfo {
    pub tile_count: u32,
    pub tile_shape: TileShape,
    pub packed_mips: PackedMipInfo,
    pub tilings: Vec<SubresourceTiling>,
}

pub struct SparseInfo {
    tiles: Vec<SparseTile>,
    tilings: Vec<SubresourceTiling>,
    packed_mips: PackedMipInfo,
    tile_shape: TileShape,
    image_aspect: vk::ImageAspectFlags,
    metadata_allocation: Option<Allocation>,
}

impl SparseInfo {
    /// Linear tiling for a reserved buffer: `ceil(size / TILE_SIZE)`
    /// tiles, the last one truncated to the buffer end.
    pub fn for_buffer(size: u64) -> Self {
        let tile_count = size.div_ceil(TILE_SIZE);
        let mut tiles = Vec::with_capacity(tile_count as usize);
        let mut offset = 0;
        while offset < size {
            let length = TILE_SIZE.min(size - offset);
            tiles.push(SparseTile {
                region: TileRegion::Opaque { offset, length },
                binding: None,
            });
            offset += TILE_SIZE;
        }
        Self {
            tiles,
            tilings: Vec::new(),
            packed_mips: PackedMipInfo::default(),
            tile_shape: TileShape {
                width: TILE_SIZE as u32,
                height: 1,
                depth: 1,
            },
            image_aspect: vk::ImageAspectFlags::empty(),
            metadata_allocation: None,
        }
    }

    /// Build the tile table for a reserved image from the native sparse
    /// memory requirements, and eagerly bind the metadata aspect when the
    /// format has one.
    pub fn for_image(
        device: &Device,
        image: vk::Image,
        desc: &ResourceDesc,
    ) -> D12Result<Self> {
        let requirements = device.native().image_sparse_memory_requirements(image);
        let main = requirements
            .iter()
            .find(|r| {
                !r.format_properties
                    .aspect_mask
                    .contains(vk::ImageAspectFlags::METADATA)
            })
            .copied()
            .ok_or_else(|| {
                D12Error::Unsupported("no sparse memory requirements reported".into())
            })?;

        let granularity = main.format_properties.image_granularity;
        let tile_shape = TileShape {
            width: granularity.width,
            height: granularity.height,
            depth: granularity.depth,
        };

        let mip_levels = u32::from(desc.mip_levels);
        let layers = desc.array_layers();
        let standard_mips = main.image_mip_tail_first_lod.min(mip_levels);
        let packed_mips = mip_levels - standard_mips;

        // One pass over (layer, mip, z, y, x) assigns linear tile indices;
        // the packed tail is appended once at the end.
        let mut tiles = Vec::new();
        let mut tilings = Vec::new();
        for layer in 0..layers {
            for mip in 0..standard_mips {
                let extent = desc.mip_extent(mip);
                let width_in_tiles = extent.width.div_ceil(tile_shape.width);
                let height_in_tiles = extent.height.div_ceil(tile_shape.height);
                let depth_in_tiles = extent.depth.div_ceil(tile_shape.depth);
                tilings.push(SubresourceTiling {
                    width_in_tiles,
                    height_in_tiles,
                    depth_in_tiles,
                    start_tile: tiles.len() as u32,
                });

                let mut coord = vk::Offset3D { x: 0, y: 0, z: 0 };
                loop {
                    let texel = vk::Offset3D {
                        x: coord.x * tile_shape.width as i32,
                        y: coord.y * tile_shape.height as i32,
                        z: coord.z * tile_shape.depth as i32,
                    };
                    tiles.push(SparseTile {
                        region: TileRegion::Image {
                            mip,
                            layer,
                            offset: texel,
                            extent: vk::Extent3D {
                                width: tile_shape.width.min(extent.width - texel.x as u32),
                                height: tile_shape.height.min(extent.height - texel.y as u32),
                                depth: tile_shape.depth.min(extent.depth - texel.z as u32),
                            },
                        },
                        binding: None,
                    });

                    coord.x += 1;
                    if coord.x as u32 == width_in_tiles {
                        coord.x = 0;
                        coord.y += 1;
                    }
                    if coord.y as u32 == height_in_tiles {
                        coord.y = 0;
                        coord.z += 1;
                    }
                    if coord.z as u32 == depth_in_tiles {
                        break;
                    }
                }
            }
        }

        let tail_tile_count = main.image_mip_tail_size.div_ceil(TILE_SIZE) as u32;
        let packed = PackedMipInfo {
            standard_mip_count: standard_mips,
            packed_mip_count: packed_mips,
            tile_count: if packed_mips > 0 { tail_tile_count } else { 0 },
            start_tile: tiles.len() as u32,
        };
        if packed_mips > 0 {
            let mut offset = main.image_mip_tail_offset;
            let end = main.image_mip_tail_offset + main.image_mip_tail_size;
            while offset < end {
                tiles.push(SparseTile {
                    region: TileRegion::Opaque {
                        offset,
                        length: TILE_SIZE.min(end - offset),
                    },
                    binding: None,
                });
                offset += TILE_SIZE;
            }
        }

        let mut info = Self {
            tiles,
            tilings,
            packed_mips: packed,
            tile_shape,
            image_aspect: main.format_properties.aspect_mask,
            metadata_allocation: None,
        };

        if let Some(metadata) = requirements.iter().find(|r| {
            r.format_properties
                .aspect_mask
                .contains(vk::ImageAspectFlags::METADATA)
        }) {
            info.bind_metadata(device, image, metadata)?;
        }
        Ok(info)
    }

    /// Allocate and bind the metadata aspect. This wait is synchronous:
    /// the caller may use or destroy the image immediately on return.
    fn bind_metadata(
        &mut self,
        device: &Device,
        image: vk::Image,
        metadata: &vk::SparseImageMemoryRequirements,
    ) -> D12Result<()> {
        let requirements = vk::MemoryRequirements {
            size: metadata.image_mip_tail_size,
            alignment: TILE_SIZE,
            memory_type_bits: u32::MAX,
        };
        let allocation = device.allocate_memory(
            &requirements,
            &HeapProperties::new(HeapType::Default),
            Default::default(),
            false,
        )?;

        let binds = SparseBindInfo {
            image: Some(image),
            opaque_binds: vec![SparseMemoryBind {
                resource_offset: metadata.image_mip_tail_offset,
                size: metadata.image_mip_tail_size,
                memory: allocation.memory,
                memory_offset: allocation.offset,
                metadata: true,
            }],
            ..Default::default()
        };
        let queue = device.queues().acquire_queue(QueueCategory::SparseBinding);
        let result = device
            .queues()
            .submit_sparse_bind(queue, &binds)
            .and_then(|()| device.queues().wait_idle(queue));
        device.queues().release_queue(queue);
        if let Err(e) = result {
            device.free_memory(allocation, HeapType::Default);
            return Err(e);
        }

        self.metadata_allocation = Some(allocation);
        Ok(())
    }

    pub fn tile_count(&self) -> u32 {
        self.tiles.len() as u32
    }

    pub fn tile(&self, index: u32) -> Option<&SparseTile> {
        self.tiles.get(index as usize)
    }

    pub fn tiling_info(&self) -> TilingInfo {
        TilingInfo {
            tile_count: self.tile_count(),
            tile_shape: self.tile_shape,
            packed_mips: self.packed_mips,
            tilings: self.tilings.clone(),
        }
    }

    /// Bind `count` tiles starting at `first_tile` to consecutive
    /// `TILE_SIZE` slices of `memory`, or unbind them when `None`.
    pub fn bind_tiles(
        &mut self,
        device: &Device,
        native: NativeResource,
        first_tile: u32,
        count: u32,
        memory: Option<&Allocation>,
    ) -> D12Result<()> {
        let end = first_tile
            .checked_add(count)
            .filter(|&end| end <= self.tile_count())
            .ok_or_else(|| D12Error::InvalidArgument("tile range out of bounds".into()))?;
        if count == 0 {
            return Ok(());
        }
        if let Some(memory) = memory {
            if u64::from(count) * TILE_SIZE > memory.size {
                return Err(D12Error::InvalidArgument(
                    "tile range exceeds backing allocation".into(),
                ));
            }
        }

        let mut binds = SparseBindInfo::default();
        match native {
            NativeResource::Buffer(buffer) => binds.buffer = Some(buffer),
            NativeResource::Image(image) => binds.image = Some(image),
        }

        let mut new_bindings = Vec::with_capacity(count as usize);
        for index in first_tile..end {
            let relative = u64::from(index - first_tile) * TILE_SIZE;
            let binding = memory.map(|m| TileBinding {
                memory: m.memory,
                memory_offset: m.offset + relative,
            });
            let (bind_memory, bind_offset) = match binding {
                Some(b) => (b.memory, b.memory_offset),
                None => (vk::DeviceMemory::null(), 0),
            };
            match self.tiles[index as usize].region {
                TileRegion::Opaque { offset, length } => {
                    binds.opaque_binds.push(SparseMemoryBind {
                        resource_offset: offset,
                        size: length,
                        memory: bind_memory,
                        memory_offset: bind_offset,
                        metadata: false,
                    });
                }
                TileRegion::Image {
                    mip,
                    layer,
                    offset,
                    extent,
                } => {
                    binds.image_binds.push(SparseImageBind {
                        aspect_mask: self.image_aspect,
                        mip_level: mip,
                        array_layer: layer,
                        offset,
                        extent,
                        memory: bind_memory,
                        memory_offset: bind_offset,
                    });
                }
            }
            new_bindings.push(binding);
        }

        let queue = device.queues().acquire_queue(QueueCategory::SparseBinding);
        let result = device.queues().submit_sparse_bind(queue, &binds);
        device.queues().release_queue(queue);
        result?;

        // Record only after the submission was accepted.
        for (index, binding) in (first_tile..end).zip(new_bindings) {
            self.tiles[index as usize].binding = binding;
        }
        Ok(())
    }

    /// Teardown. Tile tables may be partially built when a reserved
    /// creation failed late; everything here tolerates that.
    pub fn destroy(mut self, device: &Device) {
        if let Some(allocation) = self.metadata_allocation.take() {
            device.free_memory(allocation, HeapType::Default);
        }
    }
}
