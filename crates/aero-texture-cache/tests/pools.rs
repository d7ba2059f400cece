mod common;

use aero_texture_cache::format::Format;
use aero_texture_cache::pool::{
    DescriptorTarget, Filter, MipFilter, PoolCache, SamplerDescriptor, SamplerPool,
    TextureDescriptor, TexturePool, DESCRIPTOR_SIZE,
};
use aero_texture_cache::HandleState;
use common::{pattern, Harness, GPU_BASE};
use pretty_assertions::assert_eq;

const TEXTURE_POOL: u64 = 0x100;
const SAMPLER_POOL: u64 = 0x400;

fn linear_descriptor(gpu_address: u64) -> TextureDescriptor {
    TextureDescriptor::default()
        .with_address(gpu_address)
        .with_format(Format::R8G8B8A8Unorm, false)
        .with_target(DescriptorTarget::Texture2D)
        .with_size(64, 64, 1)
        .with_pitch(64 * 4)
}

fn tiled_descriptor(gpu_address: u64, format: Format, srgb: bool) -> TextureDescriptor {
    TextureDescriptor::default()
        .with_address(gpu_address)
        .with_format(format, srgb)
        .with_target(DescriptorTarget::Texture2D)
        .with_size(64, 64, 1)
        .with_block_linear(1, 1)
}

fn write_descriptor(h: &Harness, pool: u64, slot: u32, bytes: &[u8]) -> anyhow::Result<()> {
    h.cache
        .physical()
        .write(pool + slot as u64 * DESCRIPTOR_SIZE, bytes)?;
    Ok(())
}

#[test]
fn out_of_range_slots_resolve_to_nothing() {
    let mut h = Harness::new();
    let mut pool = TexturePool::new(&mut h.cache, TEXTURE_POOL, 1);
    assert_eq!(pool.get(&mut h.cache, 2), None);
    pool.dispose(&mut h.cache);
}

#[test]
fn slot_resolves_once_per_descriptor() -> anyhow::Result<()> {
    let mut h = Harness::new();
    write_descriptor(&h, TEXTURE_POOL, 0, linear_descriptor(GPU_BASE).as_bytes())?;
    let mut pool = TexturePool::new(&mut h.cache, TEXTURE_POOL, 3);

    let first = pool.get(&mut h.cache, 0);
    assert!(first.is_some());
    assert_eq!(pool.get(&mut h.cache, 0), first);
    assert_eq!(h.cache.stats().textures_created, 1);
    assert_eq!(
        pool.descriptor(0).map(|d| d.unpack_address()),
        Some(GPU_BASE)
    );
    pool.dispose(&mut h.cache);
    Ok(())
}

#[test]
fn rewritten_descriptor_parks_the_old_texture_in_the_short_cache() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let old = linear_descriptor(GPU_BASE);
    let new = linear_descriptor(GPU_BASE + 0x8000);
    write_descriptor(&h, TEXTURE_POOL, 0, old.as_bytes())?;
    let mut pool = TexturePool::new(&mut h.cache, TEXTURE_POOL, 0);

    let original = pool
        .get(&mut h.cache, 0)
        .ok_or_else(|| anyhow::anyhow!("slot did not resolve"))?;
    let sequence = pool.check_modified(&mut h.cache);

    write_descriptor(&h, TEXTURE_POOL, 0, new.as_bytes())?;
    h.cache.context_mut().advance_sequence();
    let replacement = pool
        .get(&mut h.cache, 0)
        .ok_or_else(|| anyhow::anyhow!("slot did not resolve"))?;
    assert_ne!(replacement, original);
    assert!(pool.check_modified(&mut h.cache) > sequence);
    assert!(h.cache.texture(original).is_some(), "short cache keeps it alive");

    // Switching back within the short cache lifetime reuses the parked texture.
    write_descriptor(&h, TEXTURE_POOL, 0, old.as_bytes())?;
    h.cache.context_mut().advance_sequence();
    assert_eq!(pool.get(&mut h.cache, 0), Some(original));
    assert_eq!(h.cache.stats().textures_created, 2);

    pool.dispose(&mut h.cache);
    Ok(())
}

#[test]
fn linear_samplers_see_srgb_textures_through_an_alias() -> anyhow::Result<()> {
    let mut h = Harness::new();
    write_descriptor(
        &h,
        TEXTURE_POOL,
        0,
        tiled_descriptor(GPU_BASE, Format::R8G8B8A8Srgb, true).as_bytes(),
    )?;
    let mut pool = TexturePool::new(&mut h.cache, TEXTURE_POOL, 0);

    let base = pool
        .get(&mut h.cache, 0)
        .ok_or_else(|| anyhow::anyhow!("slot did not resolve"))?;
    let alias = pool
        .get_for_sampler(&mut h.cache, 0, false)
        .ok_or_else(|| anyhow::anyhow!("alias not created"))?;
    assert_ne!(alias, base);

    let format_of = |id| h.cache.texture(id).map(|t| t.info().format_info.format);
    assert_eq!(format_of(base), Some(Format::R8G8B8A8Srgb));
    assert_eq!(format_of(alias), Some(Format::R8G8B8A8Unorm));

    assert_eq!(pool.get_for_sampler(&mut h.cache, 0, false), Some(alias));
    assert_eq!(pool.get_for_sampler(&mut h.cache, 0, true), Some(base));

    pool.dispose(&mut h.cache);
    Ok(())
}

#[test]
fn unmapped_texture_follows_its_remap() -> anyhow::Result<()> {
    const REMAP_TARGET: u64 = 0x18_0000;
    const HALF: u64 = 0x2000;

    let mut h = Harness::new();
    h.write_guest(GPU_BASE, &pattern(2 * HALF as usize, 1))?;
    write_descriptor(&h, TEXTURE_POOL, 0, linear_descriptor(GPU_BASE).as_bytes())?;
    let mut pool = TexturePool::new(&mut h.cache, TEXTURE_POOL, 1);

    let id = pool
        .get(&mut h.cache, 0)
        .ok_or_else(|| anyhow::anyhow!("slot did not resolve"))?;
    assert!(!h.cache.is_partially_mapped(id));

    h.vm.unmap(GPU_BASE + HALF, HALF);
    assert_eq!(pool.get(&mut h.cache, 0), Some(id));
    assert!(h.cache.is_partially_mapped(id));
    assert!(h
        .cache
        .texture(id)
        .is_some_and(|t| t.range().has_unmapped()));

    let remapped = pattern(HALF as usize, 99);
    h.cache.physical().write(REMAP_TARGET, &remapped)?;
    h.vm.map(GPU_BASE + HALF, REMAP_TARGET, HALF);

    assert_eq!(pool.get(&mut h.cache, 0), Some(id));
    assert!(!h.cache.is_partially_mapped(id));
    let range = h
        .cache
        .texture(id)
        .map(|t| t.range().clone())
        .ok_or_else(|| anyhow::anyhow!("texture dropped"))?;
    assert!(!range.has_unmapped());
    assert!(range.mapped().any(|r| r.address == REMAP_TARGET));

    let host = h
        .host_slice(id, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("no host data"))?;
    assert_eq!(&host[HALF as usize..], remapped.as_slice());

    pool.dispose(&mut h.cache);
    Ok(())
}

#[test]
fn remapped_array_reloads_only_the_moved_slices() -> anyhow::Result<()> {
    const REMAP_TARGET: u64 = 0x18_0000;
    const PAGE: u64 = 0x1000;
    const LAYERS: u32 = 4;
    const LEVELS: u32 = 3;

    let mut h = Harness::new();
    let descriptor = TextureDescriptor::default()
        .with_address(GPU_BASE)
        .with_format(Format::R8G8B8A8Unorm, false)
        .with_target(DescriptorTarget::Texture2DArray)
        .with_size(64, 64, LAYERS)
        .with_levels(LEVELS)
        .with_block_linear(1, 1);
    write_descriptor(&h, TEXTURE_POOL, 0, descriptor.as_bytes())?;
    let mut pool = TexturePool::new(&mut h.cache, TEXTURE_POOL, 0);

    let id = pool
        .get(&mut h.cache, 0)
        .ok_or_else(|| anyhow::anyhow!("slot did not resolve"))?;
    let (offsets, size) = h
        .cache
        .texture(id)
        .map(|t| {
            assert_eq!((t.info().depth_or_layers, t.info().levels), (LAYERS, LEVELS));
            (t.info().calculate_size_info(0).all_offsets().to_vec(), t.size())
        })
        .ok_or_else(|| anyhow::anyhow!("texture missing"))?;
    h.write_guest(GPU_BASE, &pattern(size as usize, 5))?;
    h.cache.synchronize_memory(id);
    let layer0 = h.host_slice(id, 0, 0);
    assert!(layer0.is_some());

    // Unmap from inside layer 2 to the end, so layer 3 moves entirely.
    let start = offsets[(2 * LEVELS) as usize].next_multiple_of(PAGE);
    assert!(start <= offsets[(3 * LEVELS) as usize]);
    let moved = (size - start).next_multiple_of(PAGE);

    h.vm.unmap(GPU_BASE + start, moved);
    assert_eq!(pool.get(&mut h.cache, 0), Some(id));
    assert!(h.cache.is_partially_mapped(id));
    h.cache.synchronize_memory(id);

    h.cache
        .physical()
        .write(REMAP_TARGET, &vec![0xab; moved as usize])?;
    h.vm.map(GPU_BASE + start, REMAP_TARGET, moved);
    // Applies the remap without loading anything yet.
    pool.check_modified(&mut h.cache);
    assert!(!h.cache.is_partially_mapped(id));

    let handles = h.cache.handles(id);
    assert_eq!(handles.len(), (LAYERS * LEVELS) as usize);
    for handle in &handles {
        let touches_moved = handle.offset + handle.size > start;
        let expected = if touches_moved {
            HandleState::Dirty
        } else {
            HandleState::Clean
        };
        assert_eq!(
            handle.state, expected,
            "handle at layer {} level {}",
            handle.first_layer, handle.first_level
        );
    }

    assert_eq!(pool.get(&mut h.cache, 0), Some(id));
    for level in 0..LEVELS {
        let slice = h
            .host_slice(id, 3, level)
            .ok_or_else(|| anyhow::anyhow!("no host data for level {level}"))?;
        assert!(slice.iter().all(|&b| b == 0xab), "layer 3 level {level}");
    }
    assert_eq!(h.host_slice(id, 0, 0), layer0);
    assert!(h
        .cache
        .handles(id)
        .iter()
        .all(|handle| handle.state == HandleState::Clean));

    pool.dispose(&mut h.cache);
    Ok(())
}

#[test]
fn forced_anisotropy_recreates_only_eligible_samplers() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let trilinear = SamplerDescriptor::default()
        .with_filters(Filter::Linear, Filter::Linear, MipFilter::Linear)
        .with_max_anisotropy(1.0);
    let point = SamplerDescriptor::default()
        .with_filters(Filter::Nearest, Filter::Nearest, MipFilter::Nearest)
        .with_max_anisotropy(1.0);
    write_descriptor(&h, SAMPLER_POOL, 0, trilinear.as_bytes())?;
    write_descriptor(&h, SAMPLER_POOL, 1, point.as_bytes())?;

    let mut pool = SamplerPool::new(&mut h.cache, SAMPLER_POOL, 1);
    let before = pool
        .get(&mut h.cache, 0)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("sampler not created"))?;
    let point_before = pool
        .get(&mut h.cache, 1)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("sampler not created"))?;
    assert_eq!(before.info().max_anisotropy, 1.0);
    let sequence = pool.check_modified(&mut h.cache);

    h.cache.context_mut().set_max_anisotropy(Some(16.0));
    h.cache.context_mut().advance_sequence();

    let after = pool
        .get(&mut h.cache, 0)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("sampler not recreated"))?;
    assert_ne!(after.host(), before.host());
    let host_max = h.cache.context().capabilities().max_anisotropy;
    assert_eq!(after.info().max_anisotropy, 16.0f32.min(host_max));
    assert!(pool.check_modified(&mut h.cache) > sequence);

    let point_after = pool
        .get(&mut h.cache, 1)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("sampler dropped"))?;
    assert_eq!(point_after, point_before);
    assert_eq!(h.renderer.live_samplers(), 2);

    pool.dispose(&mut h.cache);
    assert_eq!(h.renderer.live_samplers(), 0);
    Ok(())
}

#[test]
fn pool_cache_keeps_recently_used_pools_past_capacity() {
    let mut h = Harness::new();
    let mut pools: PoolCache<SamplerPool> = PoolCache::new(1, 2);

    pools.find_or_create(&mut h.cache, SAMPLER_POOL, 0);
    pools.tick();
    pools.find_or_create(&mut h.cache, SAMPLER_POOL + 0x100, 0);
    assert_eq!(pools.len(), 2);

    // One tick of disuse is not enough to evict.
    pools.find_or_create(&mut h.cache, SAMPLER_POOL + 0x100, 0);
    assert!(pools.contains(SAMPLER_POOL));

    pools.tick();
    pools.find_or_create(&mut h.cache, SAMPLER_POOL + 0x100, 0);
    assert!(!pools.contains(SAMPLER_POOL));
    assert_eq!(pools.len(), 1);

    pools.dispose(&mut h.cache);
}

#[test]
fn pool_cache_sized_from_config() {
    let mut h = Harness::new();
    let mut pools: PoolCache<TexturePool> = PoolCache::from_config(&h.cache);
    assert!(pools.is_empty());
    let address = pools.find_or_create(&mut h.cache, TEXTURE_POOL, 4).address();
    assert_eq!(address, TEXTURE_POOL);
    assert!(pools.contains(TEXTURE_POOL));
    pools.dispose(&mut h.cache);
}
