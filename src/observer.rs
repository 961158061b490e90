//! Descriptor/resource QA instrumentation hooks.
//!
//! All hooks are side-effect-free observers: they must never affect
//! control flow or correctness, and every method defaults to a no-op so
//! disabling instrumentation costs nothing.

use bitflags::bitflags;

use crate::cookie::Cookie;
use crate::resource::ResourceDesc;

bitflags! {
    /// What kind of native descriptor content a write produced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorTypeBits: u32 {
        const UNIFORM_BUFFER = 1 << 0;
        const STORAGE_BUFFER = 1 << 1;
        const SAMPLED_IMAGE = 1 << 2;
        const STORAGE_IMAGE = 1 << 3;
        const UNIFORM_TEXEL_BUFFER = 1 << 4;
        const STORAGE_TEXEL_BUFFER = 1 << 5;
        const SAMPLER = 1 << 6;
        const RAW_VA = 1 << 7;
        const ACCELERATION_STRUCTURE = 1 << 8;
    }
}

/// Observer collaborator for QA/debug instrumentation.
pub trait QaObserver: Send + Sync {
    fn register_resource(&self, _cookie: Cookie, _desc: &ResourceDesc) {}
    fn register_view(&self, _cookie: Cookie, _owner_cookie: Cookie) {}
    fn unregister(&self, _cookie: Cookie) {}
    fn write_descriptor(
        &self,
        _heap_cookie: Cookie,
        _offset: u32,
        _type_bits: DescriptorTypeBits,
        _cookie: Cookie,
    ) {
    }
    fn copy_descriptor(
        &self,
        _dst_heap_cookie: Cookie,
        _dst_offset: u32,
        _src_heap_cookie: Cookie,
        _src_offset: u32,
        _cookie: Cookie,
    ) {
    }
}

/// Default observer: every hook is a no-op.
pub struct NullObserver;

impl QaObserver for NullObserver {}
