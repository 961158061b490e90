//! Sampler descriptions and the per-device static-sampler cache.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use ash::vk;
use parking_lot::Mutex;

use crate::error::{D12Error, D12Result};
use crate::native::{NativeDevice, SamplerCreateInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
    MirrorOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BorderColor {
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    #[default]
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// API-level sampler description.
#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub compare_enable: bool,
    pub compare_op: CompareOp,
    pub border_color: BorderColor,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Nearest,
            min_filter: Filter::Nearest,
            mip_filter: Filter::Nearest,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            mip_lod_bias: 0.0,
            max_anisotropy: 0,
            compare_enable: false,
            compare_op: CompareOp::Never,
            border_color: BorderColor::TransparentBlack,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

impl SamplerDesc {
    /// Border color only participates in sampling (and in cache identity)
    /// when some address mode actually reaches the border.
    pub fn needs_border_color(&self) -> bool {
        self.address_u == AddressMode::Border
            || self.address_v == AddressMode::Border
            || self.address_w == AddressMode::Border
    }

    pub fn to_native(&self) -> SamplerCreateInfo {
        SamplerCreateInfo {
            mag_filter: vk_filter(self.mag_filter),
            min_filter: vk_filter(self.min_filter),
            mipmap_mode: match self.mip_filter {
                Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
                Filter::Linear => vk::SamplerMipmapMode::LINEAR,
            },
            address_mode_u: vk_address_mode(self.address_u),
            address_mode_v: vk_address_mode(self.address_v),
            address_mode_w: vk_address_mode(self.address_w),
            mip_lod_bias: self.mip_lod_bias,
            anisotropy_enable: self.max_anisotropy > 1,
            max_anisotropy: self.max_anisotropy as f32,
            compare_enable: self.compare_enable,
            compare_op: vk_compare_op(self.compare_op),
            min_lod: self.min_lod,
            max_lod: self.max_lod,
            border_color: vk_border_color(self.border_color),
        }
    }
}

fn vk_filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

fn vk_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        AddressMode::MirrorOnce => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

fn vk_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

fn vk_border_color(color: BorderColor) -> vk::BorderColor {
    match color {
        BorderColor::TransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        BorderColor::OpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        BorderColor::OpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
    }
}

/// Cache identity for a sampler description.
///
/// Floats hash by bit pattern; border color is masked out entirely when
/// no address mode uses a border, so otherwise-identical descriptions
/// share one native sampler.
#[derive(Debug, Clone, Copy)]
pub struct SamplerKey(SamplerDesc);

impl SamplerKey {
    pub fn new(desc: &SamplerDesc) -> Self {
        let mut desc = *desc;
        if !desc.needs_border_color() {
            desc.border_color = BorderColor::TransparentBlack;
        }
        if !desc.compare_enable {
            desc.compare_op = CompareOp::Never;
        }
        Self(desc)
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.0
    }
}

impl PartialEq for SamplerKey {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.0, &other.0);
        a.mag_filter == b.mag_filter
            && a.min_filter == b.min_filter
            && a.mip_filter == b.mip_filter
            && a.address_u == b.address_u
            && a.address_v == b.address_v
            && a.address_w == b.address_w
            && a.mip_lod_bias.to_bits() == b.mip_lod_bias.to_bits()
            && a.max_anisotropy == b.max_anisotropy
            && a.compare_enable == b.compare_enable
            && a.compare_op == b.compare_op
            && a.border_color == b.border_color
            && a.min_lod.to_bits() == b.min_lod.to_bits()
            && a.max_lod.to_bits() == b.max_lod.to_bits()
    }
}

impl Eq for SamplerKey {}

impl Hash for SamplerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let d = &self.0;
        d.mag_filter.hash(state);
        d.min_filter.hash(state);
        d.mip_filter.hash(state);
        d.address_u.hash(state);
        d.address_v.hash(state);
        d.address_w.hash(state);
        d.mip_lod_bias.to_bits().hash(state);
        d.max_anisotropy.hash(state);
        d.compare_enable.hash(state);
        d.compare_op.hash(state);
        d.border_color.hash(state);
        d.min_lod.to_bits().hash(state);
        d.max_lod.to_bits().hash(state);
    }
}

/// Per-device cache of immutable (static) samplers.
#[derive(Default)]
pub struct SamplerCache {
    samplers: Mutex<HashMap<SamplerKey, vk::Sampler>>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        native: &dyn NativeDevice,
        desc: &SamplerDesc,
    ) -> D12Result<vk::Sampler> {
        let key = SamplerKey::new(desc);
        let mut samplers = self.samplers.lock();
        if let Some(&sampler) = samplers.get(&key) {
            return Ok(sampler);
        }
        let sampler = native.create_sampler(&desc.to_native())?;
        samplers.insert(key, sampler);
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.samplers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.lock().is_empty()
    }

    /// Destroy every cached native sampler. Called on device teardown.
    pub fn destroy(&self, native: &dyn NativeDevice) {
        let mut samplers = self.samplers.lock();
        for (_, sampler) in samplers.drain() {
            native.destroy_sampler(sampler);
        }
    }
}

/// Descriptor pools dedicated to single static-sampler sets, grown on
/// demand.
pub struct SamplerPoolList {
    pools: Mutex<Vec<vk::DescriptorPool>>,
    sets_per_pool: u32,
}

impl SamplerPoolList {
    pub fn new(sets_per_pool: u32) -> Self {
        Self {
            pools: Mutex::new(Vec::new()),
            sets_per_pool,
        }
    }

    /// Allocate one sampler set, adding a fresh pool and retrying once
    /// when the current pool is exhausted or fragmented.
    pub fn allocate_set(&self, native: &dyn NativeDevice) -> D12Result<vk::DescriptorSet> {
        let mut pools = self.pools.lock();
        if let Some(&pool) = pools.last() {
            match native.allocate_descriptor_set(pool, vk::DescriptorType::SAMPLER, 1) {
                Ok(set) => return Ok(set),
                Err(D12Error::NativeFailure(
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
                )) => {}
                Err(e) => return Err(e),
            }
        }
        let pool = native.create_descriptor_pool(
            &[(vk::DescriptorType::SAMPLER, self.sets_per_pool)],
            self.sets_per_pool,
        )?;
        pools.push(pool);
        native.allocate_descriptor_set(pool, vk::DescriptorType::SAMPLER, 1)
    }

    pub fn destroy(&self, native: &dyn NativeDevice) {
        let mut pools = self.pools.lock();
        for pool in pools.drain(..) {
            native.destroy_descriptor_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_key(key: &SamplerKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_border_color_ignored_without_border_mode() {
        let a = SamplerDesc {
            border_color: BorderColor::OpaqueWhite,
            ..Default::default()
        };
        let b = SamplerDesc {
            border_color: BorderColor::OpaqueBlack,
            ..Default::default()
        };
        let (ka, kb) = (SamplerKey::new(&a), SamplerKey::new(&b));
        assert_eq!(ka, kb);
        assert_eq!(hash_key(&ka), hash_key(&kb));
    }

    #[test]
    fn test_border_color_matters_with_border_mode() {
        let a = SamplerDesc {
            address_u: AddressMode::Border,
            border_color: BorderColor::OpaqueWhite,
            ..Default::default()
        };
        let b = SamplerDesc {
            address_u: AddressMode::Border,
            border_color: BorderColor::OpaqueBlack,
            ..Default::default()
        };
        assert_ne!(SamplerKey::new(&a), SamplerKey::new(&b));
    }

    #[test]
    fn test_lod_compared_by_bits() {
        let a = SamplerDesc {
            min_lod: 1.0,
            ..Default::default()
        };
        let b = SamplerDesc {
            min_lod: 2.0,
            ..Default::default()
        };
        assert_ne!(SamplerKey::new(&a), SamplerKey::new(&b));
        assert_eq!(SamplerKey::new(&a), SamplerKey::new(&a));
    }

    #[test]
    fn test_anisotropy_enables_above_one() {
        let desc = SamplerDesc {
            max_anisotropy: 8,
            ..Default::default()
        };
        let info = desc.to_native();
        assert!(info.anisotropy_enable);
        assert_eq!(info.max_anisotropy, 8.0);

        let info = SamplerDesc::default().to_native();
        assert!(!info.anisotropy_enable);
    }
}
