mod common;

use aero_texture_cache::format::Format;
use aero_texture_cache::{HandleState, TextureCacheConfig, TextureSearchFlags};
use common::{linear_rgba, pattern, tiled, tiled_array, Harness, GPU_BASE};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[test]
fn identical_requests_share_one_texture() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let info = tiled(GPU_BASE, Format::R8G8B8A8Unorm, 256, 256);

    let first = h
        .cache
        .find_or_create_texture(TextureSearchFlags::empty(), &info, 0)
        .ok_or_else(|| anyhow::anyhow!("texture not created"))?;
    let second = h
        .cache
        .find_or_create_texture(TextureSearchFlags::empty(), &info, 0)
        .ok_or_else(|| anyhow::anyhow!("texture not found"))?;

    assert_eq!(first, second);
    assert_eq!(h.cache.texture_count(), 1);
    assert_eq!(h.cache.auto_delete_len(), 1);
    let stats = h.cache.stats();
    assert_eq!(stats.textures_created, 1);
    assert_eq!(stats.textures_reused, 1);
    Ok(())
}

#[test]
fn unmapped_address_yields_nothing() {
    let mut h = Harness::new();
    let info = tiled(0x4000_0000, Format::R8G8B8A8Unorm, 64, 64);
    assert_eq!(
        h.cache.find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &info, 0),
        None
    );
    assert_eq!(h.cache.texture_count(), 0);
}

#[test]
fn no_create_only_returns_exact_matches() {
    let mut h = Harness::new();
    let info = tiled(GPU_BASE, Format::R8G8B8A8Unorm, 64, 64);
    assert_eq!(
        h.cache.find_or_create_texture(TextureSearchFlags::NO_CREATE, &info, 0),
        None
    );

    let created = h.cache.find_or_create_texture(TextureSearchFlags::empty(), &info, 0);
    assert!(created.is_some());
    assert_eq!(
        h.cache.find_or_create_texture(TextureSearchFlags::NO_CREATE, &info, 0),
        created
    );
}

#[test]
fn guest_writes_reload_once() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let info = linear_rgba(GPU_BASE, 64, 64);
    let id = h
        .cache
        .find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &info, 0)
        .ok_or_else(|| anyhow::anyhow!("texture not created"))?;

    let uploads = h.cache.stats().uploads;
    h.cache.synchronize_memory(id);
    assert_eq!(h.cache.stats().uploads, uploads, "clean texture must not reload");

    let data = pattern(64 * 64 * 4, 7);
    h.write_guest(GPU_BASE, &data)?;
    assert!(h.cache.check_modified(id));

    h.cache.synchronize_memory(id);
    let after_reload = h.cache.stats().uploads;
    assert!(after_reload > uploads);
    assert_eq!(h.host_slice(id, 0, 0), Some(data));

    h.cache.synchronize_memory(id);
    assert_eq!(h.cache.stats().uploads, after_reload);
    Ok(())
}

#[test]
fn sub_image_request_becomes_a_view() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let storage_info = tiled_array(GPU_BASE, 64, 64, 4, 4);
    let storage = h
        .cache
        .find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &storage_info, 0)
        .ok_or_else(|| anyhow::anyhow!("storage not created"))?;

    // Layer 1, level 2 of a four-level chain.
    let offset = storage_info.calculate_size_info(0).all_offsets()[4 + 2];
    let view_info = tiled(GPU_BASE + offset, Format::R8G8B8A8Unorm, 16, 16);
    let view = h
        .cache
        .find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &view_info, 0)
        .ok_or_else(|| anyhow::anyhow!("view not created"))?;

    let tex = h.cache.texture(view).ok_or_else(|| anyhow::anyhow!("view missing"))?;
    assert!(tex.is_view());
    assert_eq!((tex.first_layer(), tex.first_level()), (1, 2));
    assert_eq!(h.cache.stats().views_created, 1);

    // A layer and mip view subdivides the group down to single subresources.
    assert_eq!(h.cache.handles(storage).len(), 16);

    h.cache.synchronize_memory(storage);
    assert!(h
        .cache
        .handles(storage)
        .iter()
        .all(|handle| handle.state == HandleState::Clean));

    h.write_guest(GPU_BASE + offset, &[0xff; 4])?;
    assert!(h.cache.check_modified(storage));
    let dirty: Vec<_> = h
        .cache
        .handles(storage)
        .into_iter()
        .filter(|handle| handle.state == HandleState::Dirty)
        .map(|handle| (handle.first_layer, handle.first_level))
        .collect();
    assert_eq!(dirty, vec![(1, 2)]);
    Ok(())
}

#[test]
fn depth_data_reaches_a_color_alias_by_copy() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let depth = h
        .cache
        .find_or_create_texture(
            TextureSearchFlags::empty(),
            &tiled(GPU_BASE, Format::D32Float, 64, 64),
            0,
        )
        .ok_or_else(|| anyhow::anyhow!("depth texture not created"))?;

    let rendered = pattern(64 * 64 * 4, 3);
    let host = h
        .cache
        .texture(depth)
        .and_then(|t| t.host())
        .ok_or_else(|| anyhow::anyhow!("depth texture has no host texture"))?;
    assert!(h.renderer.render_to(host, 0, 0, &rendered));
    h.cache.signal_modified(depth);

    let color = h
        .cache
        .find_or_create_texture(
            TextureSearchFlags::empty(),
            &tiled(GPU_BASE, Format::R32Float, 64, 64),
            0,
        )
        .ok_or_else(|| anyhow::anyhow!("color texture not created"))?;
    assert_ne!(color, depth);
    assert!(!h.cache.texture(color).is_some_and(|t| t.is_view()));

    h.cache.synchronize_memory(color);
    assert_eq!(h.host_slice(color, 0, 0), Some(rendered));
    assert!(h.cache.stats().copy_dependencies >= 1);
    assert!(h.cache.copy_dependency_count() > 0);
    assert!(h.cache.dependency_graph_is_symmetric());
    Ok(())
}

#[test]
fn evicted_textures_write_back_gpu_data() -> anyhow::Result<()> {
    let config = TextureCacheConfig {
        auto_delete_max_count: 2,
        auto_delete_min_count: 0,
        ..TextureCacheConfig::default()
    };
    let mut h = Harness::with_config(config);

    let addresses = [GPU_BASE, GPU_BASE + 0x8000, GPU_BASE + 0x1_0000];
    let first = h
        .cache
        .find_or_create_texture(TextureSearchFlags::empty(), &linear_rgba(addresses[0], 64, 64), 0)
        .ok_or_else(|| anyhow::anyhow!("texture not created"))?;
    let rendered = pattern(64 * 64 * 4, 11);
    let host = h
        .cache
        .texture(first)
        .and_then(|t| t.host())
        .ok_or_else(|| anyhow::anyhow!("no host texture"))?;
    assert!(h.renderer.render_to(host, 0, 0, &rendered));
    h.cache.signal_modified(first);

    for &address in &addresses[1..] {
        h.cache
            .find_or_create_texture(TextureSearchFlags::empty(), &linear_rgba(address, 64, 64), 0)
            .ok_or_else(|| anyhow::anyhow!("texture not created"))?;
    }

    assert!(h.cache.texture(first).is_none());
    assert_eq!(h.cache.auto_delete_len(), 2);
    assert_eq!(h.cache.stats().evictions, 1);
    assert_eq!(h.read_guest(addresses[0], rendered.len())?, rendered);
    Ok(())
}

#[test]
fn released_sampler_texture_leaves_no_host_resources() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let id = h
        .cache
        .find_or_create_texture(
            TextureSearchFlags::FOR_SAMPLER,
            &tiled(GPU_BASE, Format::R8G8B8A8Unorm, 32, 32),
            0,
        )
        .ok_or_else(|| anyhow::anyhow!("texture not created"))?;
    assert_eq!(h.renderer.live_textures(), 1);

    h.cache.retain(id);
    assert!(h.cache.release(id));
    assert_eq!(h.renderer.live_textures(), 0);
    assert_eq!(h.cache.texture_count(), 0);
    Ok(())
}

#[test]
fn buffer_copy_lookup_compares_widths_in_bytes() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let id = h
        .cache
        .find_or_create_texture(
            TextureSearchFlags::empty(),
            &tiled(GPU_BASE, Format::R8G8B8A8Unorm, 64, 64),
            0,
        )
        .ok_or_else(|| anyhow::anyhow!("texture not created"))?;
    let (gob_y, gob_z) = h
        .cache
        .texture(id)
        .map(|t| (t.info().gob_blocks_in_y, t.info().gob_blocks_in_z))
        .ok_or_else(|| anyhow::anyhow!("texture missing"))?;

    // 64 RGBA pixels and 128 two-byte pixels span the same rows.
    assert_eq!(
        h.cache.find_texture(GPU_BASE, 4, 256, 64, 64, 64, false, gob_y, gob_z),
        Some(id)
    );
    assert_eq!(
        h.cache.find_texture(GPU_BASE, 2, 256, 64, 128, 64, false, gob_y, gob_z),
        Some(id)
    );
    assert_eq!(
        h.cache.find_texture(GPU_BASE, 4, 256, 64, 32, 64, false, gob_y, gob_z),
        None
    );

    // Guest copy sizes are arbitrary; a huge width must simply not match.
    assert_eq!(
        h.cache
            .find_texture(GPU_BASE, 4, 256, 64, u32::MAX, 64, false, gob_y, gob_z),
        None
    );
    assert_eq!(
        h.cache
            .find_texture(GPU_BASE, u32::MAX, 256, 64, u32::MAX, 64, false, gob_y, gob_z),
        None
    );
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn handles_tile_the_whole_texture(
        width_log2 in 4u32..8,
        layers in 1u32..13,
        levels in 1u32..5,
    ) {
        let mut h = Harness::new();
        let width = 1 << width_log2;
        let info = tiled_array(GPU_BASE, width, width, layers, levels);
        let id = h.cache.find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &info, 0);
        prop_assert!(id.is_some());
        let id = id.unwrap();
        let size = h.cache.texture(id).map(|t| t.size());

        let mut handles = h.cache.handles(id);
        let expected = if layers > 8 { (layers * levels) as usize } else { 1 };
        prop_assert_eq!(handles.len(), expected);

        handles.sort_by_key(|handle| handle.offset);
        let mut cursor = 0;
        for handle in &handles {
            prop_assert_eq!(handle.offset, cursor);
            prop_assert!(handle.size > 0);
            cursor += handle.size;
        }
        prop_assert_eq!(Some(cursor), size);
    }
}
