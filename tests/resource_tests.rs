//! Resource lifetime, placement and sparse-tiling behavior against the
//! mock native device.

mod common;

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use rstest::rstest;

use common::{test_device, test_device_with, MockNativeDevice, MOCK_IMAGE_SIZE};
use d12vk::memory::Allocation;
use d12vk::sparse::TileRegion;
use d12vk::view::IDENTITY_SWIZZLE;
use d12vk::{
    D12Error, DeviceCaps, Format, Heap, HeapDesc, HeapFlags, HeapProperties, HeapType, Resource,
    ResourceDesc, ResourceFlags, ResourceState, ViewKey, TILE_SIZE,
};

fn image_key(resource: &Resource, base_mip: u32) -> ViewKey {
    ViewKey::Image {
        image: resource.native.image(),
        view_type: vk::ImageViewType::TYPE_2D,
        format: resource.format.vk_format,
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip,
        mip_count: 1,
        base_layer: 0,
        layer_count: 1,
        swizzle: IDENTITY_SWIZZLE,
        min_lod_bits: 0,
    }
}

#[test]
fn test_committed_buffer_round_trip_is_leak_free() {
    let ctx = test_device(DeviceCaps::default());

    let buffer = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Upload),
        HeapFlags::empty(),
        &ResourceDesc::buffer(4096),
        ResourceState::GenericRead,
    )
    .unwrap();

    assert_eq!(ctx.native.live_buffers(), 1);
    assert_eq!(ctx.allocator.live(), 1);
    let va = buffer.va;
    assert_ne!(va, 0);
    assert_eq!(ctx.device.va_map.deref(va).unwrap().cookie, buffer.cookie);
    assert_eq!(ctx.device.budget.used(HeapType::Upload), 4096);

    drop(buffer);
    assert_eq!(ctx.native.live_buffers(), 0);
    assert_eq!(ctx.allocator.live(), 0);
    assert!(ctx.device.va_map.deref(va).is_none());
    assert_eq!(ctx.device.budget.used(HeapType::Upload), 0);
}

#[test]
fn test_native_device_address_is_registered() {
    let ctx = test_device_with(DeviceCaps::default(), MockNativeDevice::with_device_address());

    let buffer = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &ResourceDesc::buffer(1024),
        ResourceState::Common,
    )
    .unwrap();

    let owner = ctx.device.va_map.deref(buffer.va + 512).unwrap();
    assert_eq!(owner.cookie, buffer.cookie);
    assert_eq!(owner.va, buffer.va);
    assert_eq!(owner.size, 1024);
}

#[test]
fn test_public_handle_refcount_is_independent_of_internal_refs() {
    let ctx = test_device(DeviceCaps::default());
    let buffer = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &ResourceDesc::buffer(1024),
        ResourceState::Common,
    )
    .unwrap();

    assert_eq!(buffer.public_ref_count(), 1);
    let second = buffer.acquire();
    assert_eq!(buffer.public_ref_count(), 2);

    // Internal references do not touch the public count.
    let _internal = Arc::clone(buffer.resource());
    assert_eq!(buffer.public_ref_count(), 2);

    second.release();
    assert_eq!(buffer.public_ref_count(), 1);
}

#[test]
fn test_budget_failure_tears_down_the_native_buffer() {
    let ctx = test_device(DeviceCaps::default());
    ctx.device.budget.set_ceiling(HeapType::Upload, 1024);

    let result = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Upload),
        HeapFlags::empty(),
        &ResourceDesc::buffer(4096),
        ResourceState::GenericRead,
    );
    assert_eq!(result.err(), Some(D12Error::OutOfMemory));
    assert_eq!(ctx.native.live_buffers(), 0);
    assert_eq!(ctx.allocator.live(), 0);
    assert_eq!(ctx.device.budget.used(HeapType::Upload), 0);
}

#[test]
fn test_allocation_info_round_trips_through_placed_creation() {
    let ctx = test_device(DeviceCaps::default());
    let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);

    let info = Resource::get_allocation_info(&ctx.device, &desc).unwrap();
    assert_eq!(info.size, MOCK_IMAGE_SIZE);
    assert_eq!(info.alignment, ctx.device.caps.default_placement_alignment);
    // The throwaway query image is gone.
    assert_eq!(ctx.native.live_images(), 0);

    let heap = Heap::create(
        &ctx.device,
        &HeapDesc {
            size_in_bytes: info.size,
            properties: HeapProperties::new(HeapType::Default),
            alignment: info.alignment,
            flags: HeapFlags::empty(),
        },
    )
    .unwrap();

    let placed =
        Resource::create_placed(&ctx.device, &heap, 0, &desc, ResourceState::Common).unwrap();
    assert_eq!(ctx.native.live_images(), 1);
    // A slice of the heap, not a second allocation.
    assert_eq!(ctx.allocator.live(), 1);

    // The last byte of the heap cannot host the whole resource.
    let result = Resource::create_placed(
        &ctx.device,
        &heap,
        info.size - 1,
        &desc,
        ResourceState::Common,
    );
    assert!(matches!(result, Err(D12Error::InvalidArgument(_))));
    assert_eq!(ctx.native.live_images(), 1);

    drop(placed);
    drop(heap);
    assert_eq!(ctx.native.live_images(), 0);
    assert_eq!(ctx.allocator.live(), 0);
}

#[test]
fn test_placed_offsets_near_the_address_limit_are_rejected() {
    let ctx = test_device(DeviceCaps::default());
    let heap = Heap::create(
        &ctx.device,
        &HeapDesc {
            size_in_bytes: 0x100000,
            properties: HeapProperties::new(HeapType::Default),
            alignment: 0,
            flags: HeapFlags::empty(),
        },
    )
    .unwrap();

    // Re-aligning an offset this large would wrap the address space; it
    // must fail like any other placement that misses the heap.
    let desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);
    let result =
        Resource::create_placed(&ctx.device, &heap, u64::MAX - 1, &desc, ResourceState::Common);
    assert!(matches!(result, Err(D12Error::InvalidArgument(_))));
    assert_eq!(ctx.native.live_images(), 0);
}

#[test]
fn test_heap_deny_flags_reject_mismatched_categories() {
    let ctx = test_device(DeviceCaps::default());
    let heap = Heap::create(
        &ctx.device,
        &HeapDesc {
            size_in_bytes: 0x100000,
            properties: HeapProperties::new(HeapType::Default),
            alignment: 0,
            flags: HeapFlags::DENY_BUFFERS,
        },
    )
    .unwrap();

    let result = Resource::create_placed(
        &ctx.device,
        &heap,
        0,
        &ResourceDesc::buffer(1024),
        ResourceState::Common,
    );
    assert!(matches!(result, Err(D12Error::InvalidArgument(_))));
    assert_eq!(ctx.native.live_buffers(), 0);
}

#[test]
fn test_invalid_texture_descs_are_rejected() {
    let ctx = test_device(DeviceCaps::default());

    let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 64);
    desc.mip_levels = 10;
    let result = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &desc,
        ResourceState::Common,
    );
    assert!(matches!(result, Err(D12Error::InvalidArgument(_))));

    let mut desc = ResourceDesc::texture_2d(Format::D32Float, 64, 64);
    desc.flags = ResourceFlags::ALLOW_DEPTH_STENCIL | ResourceFlags::ALLOW_SIMULTANEOUS_ACCESS;
    let result = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &desc,
        ResourceState::Common,
    );
    assert!(matches!(result, Err(D12Error::InvalidArgument(_))));
    assert_eq!(ctx.native.live_images(), 0);
}

#[rstest]
#[case(1, 1)]
#[case(TILE_SIZE, 1)]
#[case(TILE_SIZE + 1, 2)]
#[case(2 * TILE_SIZE + 100, 3)]
fn test_reserved_buffer_tile_counts(#[case] width: u64, #[case] expected: u32) {
    let ctx = test_device(DeviceCaps::default());
    let buffer =
        Resource::create_reserved(&ctx.device, &ResourceDesc::buffer(width), ResourceState::Common)
            .unwrap();
    assert_eq!(buffer.tile_count(), expected);
}

#[test]
fn test_reserved_buffer_tiles_start_unbound_with_truncated_tail() {
    let ctx = test_device(DeviceCaps::default());
    let width = 2 * TILE_SIZE + 100;
    let buffer =
        Resource::create_reserved(&ctx.device, &ResourceDesc::buffer(width), ResourceState::Common)
            .unwrap();

    for index in 0..buffer.tile_count() {
        let tile = buffer.tile(index).unwrap();
        assert!(tile.binding.is_none());
        let TileRegion::Opaque { offset, length } = tile.region else {
            panic!("buffer tiles must be opaque regions");
        };
        assert_eq!(offset, u64::from(index) * TILE_SIZE);
        let expected = if index == 2 { 100 } else { TILE_SIZE };
        assert_eq!(length, expected);
    }
}

#[test]
fn test_binding_one_tile_leaves_neighbors_untouched() {
    let ctx = test_device(DeviceCaps::default());
    let buffer = Resource::create_reserved(
        &ctx.device,
        &ResourceDesc::buffer(3 * TILE_SIZE),
        ResourceState::Common,
    )
    .unwrap();

    let memory = vk::DeviceMemory::from_raw(0x77);
    let allocation = Allocation::new(memory, 0, TILE_SIZE, false, None, None);
    buffer.bind_tiles(1, 1, Some(&allocation)).unwrap();

    assert!(buffer.tile(0).unwrap().binding.is_none());
    assert!(buffer.tile(2).unwrap().binding.is_none());
    let binding = buffer.tile(1).unwrap().binding.unwrap();
    assert_eq!(binding.memory, memory);
    assert_eq!(binding.memory_offset, 0);

    assert_eq!(ctx.queues.submission_count(), 1);
    // The guard must not outlive this block: the unbind below submits
    // another sparse bind, which takes the same lock.
    {
        let submissions = ctx.queues.submissions.lock();
        assert_eq!(submissions[0].buffer, Some(buffer.native.buffer()));
        assert_eq!(submissions[0].opaque_binds.len(), 1);
        assert_eq!(submissions[0].opaque_binds[0].resource_offset, TILE_SIZE);
        assert_eq!(submissions[0].opaque_binds[0].size, TILE_SIZE);
    }

    // Unbind restores the initial state.
    buffer.bind_tiles(1, 1, None).unwrap();
    assert!(buffer.tile(1).unwrap().binding.is_none());
    assert_eq!(ctx.queues.submission_count(), 2);
}

#[test]
fn test_reserved_image_tiling_reflects_the_native_granularity() {
    let ctx = test_device(DeviceCaps::default());
    let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);
    desc.mip_levels = 3;
    let texture =
        Resource::create_reserved(&ctx.device, &desc, ResourceState::Common).unwrap();

    // 128x128 granularity: mip 0 is a 2x2 grid, mips 1 and 2 one tile each.
    assert_eq!(texture.tile_count(), 6);
    let info = texture.tiling_info().unwrap();
    assert_eq!(info.tilings.len(), 3);
    assert_eq!(info.tilings[0].width_in_tiles, 2);
    assert_eq!(info.tilings[0].height_in_tiles, 2);
    assert_eq!(info.tilings[1].start_tile, 4);
    assert_eq!(info.tilings[2].start_tile, 5);
    assert_eq!(info.packed_mips.packed_mip_count, 0);

    let tile = texture.tile(5).unwrap();
    let TileRegion::Image { mip, extent, .. } = tile.region else {
        panic!("standard mips must produce image regions");
    };
    assert_eq!(mip, 2);
    assert_eq!((extent.width, extent.height), (64, 64));
}

#[test]
fn test_reserved_image_packs_trailing_mips_into_opaque_tail_tiles() {
    let ctx = test_device_with(
        DeviceCaps::default(),
        MockNativeDevice::with_mip_tail(2, TILE_SIZE + 100),
    );
    let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);
    desc.mip_levels = 4;
    let texture = Resource::create_reserved(&ctx.device, &desc, ResourceState::Common).unwrap();

    // Mips 0 and 1 tile normally (2x2 grid plus one tile); mips 2 and 3
    // share the opaque tail, which spans two tiles with a truncated end.
    let info = texture.tiling_info().unwrap();
    assert_eq!(info.packed_mips.standard_mip_count, 2);
    assert_eq!(info.packed_mips.packed_mip_count, 2);
    assert_eq!(info.packed_mips.tile_count, 2);
    assert_eq!(info.packed_mips.start_tile, 5);
    assert_eq!(texture.tile_count(), 7);

    let TileRegion::Opaque { offset, length } = texture.tile(5).unwrap().region else {
        panic!("tail tiles must be opaque regions");
    };
    assert_eq!(offset, MOCK_IMAGE_SIZE);
    assert_eq!(length, TILE_SIZE);
    let TileRegion::Opaque { length, .. } = texture.tile(6).unwrap().region else {
        panic!("tail tiles must be opaque regions");
    };
    assert_eq!(length, 100);

    // Tail tiles bind as opaque byte ranges of the image.
    let memory = vk::DeviceMemory::from_raw(0x99);
    let allocation = Allocation::new(memory, 0, TILE_SIZE, false, None, None);
    texture.bind_tiles(5, 1, Some(&allocation)).unwrap();
    assert_eq!(ctx.queues.submission_count(), 1);
    {
        let submissions = ctx.queues.submissions.lock();
        assert_eq!(submissions[0].image, Some(texture.native.image()));
        assert_eq!(submissions[0].opaque_binds.len(), 1);
        assert_eq!(submissions[0].opaque_binds[0].resource_offset, MOCK_IMAGE_SIZE);
        assert!(!submissions[0].opaque_binds[0].metadata);
    }
}

#[test]
fn test_reserved_image_metadata_aspect_binds_synchronously() {
    let ctx = test_device_with(
        DeviceCaps::default(),
        MockNativeDevice::with_metadata_tail(0x8000),
    );
    let texture = Resource::create_reserved(
        &ctx.device,
        &ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256),
        ResourceState::Common,
    )
    .unwrap();

    // The metadata tail is allocated and bound before creation returns.
    assert_eq!(ctx.allocator.live(), 1);
    assert_eq!(ctx.device.budget.used(HeapType::Default), 0x8000);
    assert_eq!(ctx.queues.submission_count(), 1);
    {
        let submissions = ctx.queues.submissions.lock();
        assert_eq!(submissions[0].image, Some(texture.native.image()));
        let bind = &submissions[0].opaque_binds[0];
        assert!(bind.metadata);
        assert_eq!(bind.resource_offset, 2 * MOCK_IMAGE_SIZE);
        assert_eq!(bind.size, 0x8000);
    }

    drop(texture);
    assert_eq!(ctx.allocator.live(), 0);
    assert_eq!(ctx.device.budget.used(HeapType::Default), 0);
}

#[test]
fn test_region_validation_respects_block_alignment() {
    let ctx = test_device(DeviceCaps::default());
    let texture = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &ResourceDesc::texture_2d(Format::Bc1Unorm, 64, 64),
        ResourceState::Common,
    )
    .unwrap();

    let full = d12vk::resource::RegionBox {
        left: 0,
        top: 0,
        front: 0,
        right: 64,
        bottom: 64,
        back: 1,
    };
    assert!(texture.validate_region(0, &full));

    // Interior edges must land on 4-texel block boundaries.
    let misaligned = d12vk::resource::RegionBox { right: 3, ..full };
    assert!(!texture.validate_region(0, &misaligned));
    let aligned = d12vk::resource::RegionBox { right: 4, ..full };
    assert!(texture.validate_region(0, &aligned));

    let oversized = d12vk::resource::RegionBox { right: 68, ..full };
    assert!(!texture.validate_region(0, &oversized));
}

#[test]
fn test_tile_binding_requires_a_reserved_resource() {
    let ctx = test_device(DeviceCaps::default());
    let buffer = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &ResourceDesc::buffer(TILE_SIZE),
        ResourceState::Common,
    )
    .unwrap();
    assert!(matches!(
        buffer.bind_tiles(0, 1, None),
        Err(D12Error::InvalidArgument(_))
    ));
}

#[test]
fn test_reserved_creation_requires_sparse_support() {
    let caps = DeviceCaps {
        sparse_binding: false,
        ..Default::default()
    };
    let ctx = test_device(caps);
    let result = Resource::create_reserved(
        &ctx.device,
        &ResourceDesc::buffer(TILE_SIZE),
        ResourceState::Common,
    );
    assert!(matches!(result, Err(D12Error::Unsupported(_))));
    assert_eq!(ctx.native.live_buffers(), 0);
}

#[test]
fn test_concurrent_equal_view_keys_create_one_native_view() {
    let ctx = test_device(DeviceCaps::default());
    let texture = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256),
        ResourceState::Common,
    )
    .unwrap();

    let resource = Arc::clone(texture.resource());
    let device = Arc::clone(&ctx.device);
    let key = image_key(&resource, 0);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let resource = Arc::clone(&resource);
            let device = Arc::clone(&device);
            std::thread::spawn(move || {
                resource
                    .views
                    .get_or_create(device.native(), &device.cookies, &key)
                    .unwrap()
                    .cookie
            })
        })
        .collect();
    let cookies: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Every thread resolved the same cached view.
    assert!(cookies.iter().all(|&c| c == cookies[0]));
    assert_eq!(resource.views.len(), 1);
    assert_eq!(ctx.native.live_image_views(), 1);
}

#[test]
fn test_distinct_view_keys_are_distinct_and_destroyed_with_the_resource() {
    let ctx = test_device(DeviceCaps::default());
    let mut desc = ResourceDesc::texture_2d(Format::R8G8B8A8Unorm, 256, 256);
    desc.mip_levels = 3;
    let texture = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &desc,
        ResourceState::Common,
    )
    .unwrap();

    for mip in 0..3 {
        texture
            .views
            .get_or_create(
                ctx.device.native(),
                &ctx.device.cookies,
                &image_key(&texture, mip),
            )
            .unwrap();
    }
    assert_eq!(texture.views.len(), 3);
    assert_eq!(ctx.native.live_image_views(), 3);

    drop(texture);
    assert_eq!(ctx.native.live_image_views(), 0);
    assert_eq!(ctx.native.live_images(), 0);
}

#[test]
fn test_set_name_reaches_the_native_object_and_private_data() {
    let ctx = test_device(DeviceCaps::default());
    let buffer = Resource::create_committed(
        &ctx.device,
        &HeapProperties::new(HeapType::Default),
        HeapFlags::empty(),
        &ResourceDesc::buffer(1024),
        ResourceState::Common,
    )
    .unwrap();

    buffer.set_name("staging ring");
    assert_eq!(buffer.private_data.name().as_deref(), Some("staging ring"));
    let names = ctx.native.names.lock();
    assert!(names
        .iter()
        .any(|(ty, name)| *ty == vk::ObjectType::BUFFER && name == "staging ring"));
}

#[test]
fn test_heap_alignment_must_be_a_power_of_two() {
    let ctx = test_device(DeviceCaps::default());
    let result = Heap::create(
        &ctx.device,
        &HeapDesc {
            size_in_bytes: 0x10000,
            properties: HeapProperties::new(HeapType::Default),
            alignment: 0x3000,
            flags: HeapFlags::empty(),
        },
    );
    assert!(matches!(result, Err(D12Error::InvalidArgument(_))));
}
