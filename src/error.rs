//! Error types for the translation layer.

use std::fmt;

use ash::vk;

/// Errors that can occur while managing resources, views and descriptors.
///
/// Validation failures are always detected before any native call is made,
/// so a returned [`D12Error::InvalidArgument`] or [`D12Error::Unsupported`]
/// guarantees no partially-constructed native state was left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum D12Error {
    /// A caller-supplied description violates a structural invariant.
    InvalidArgument(String),
    /// Host or device allocation failure, or native object-count exhaustion.
    OutOfMemory,
    /// The requested feature combination is not representable on this device.
    Unsupported(String),
    /// The underlying driver call itself failed.
    NativeFailure(vk::Result),
}

impl fmt::Display for D12Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Self::NativeFailure(vr) => write!(f, "native call failed: {vr:?}"),
        }
    }
}

impl std::error::Error for D12Error {}

/// Result alias used throughout the crate.
pub type D12Result<T> = Result<T, D12Error>;

impl D12Error {
    /// Map a raw Vulkan status to the error taxonomy.
    ///
    /// Allocation failures map 1:1 to [`D12Error::OutOfMemory`]; everything
    /// else is surfaced as a generic native failure with the status kept
    /// for logging.
    pub fn from_vk(vr: vk::Result) -> Self {
        match vr {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => Self::OutOfMemory,
            vr => Self::NativeFailure(vr),
        }
    }
}
