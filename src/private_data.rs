//! Per-object private data blobs, keyed by 128-bit application GUIDs.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Well-known key under which object debug names are stored, as a
/// NUL-free UTF-8 blob.
pub const DEBUG_NAME_GUID: u128 = 0x4cca_5fd8_921f_44d8_8b87_9f24_6a62_52ec;

#[derive(Debug, Clone)]
pub enum PrivateDataValue {
    Blob(Vec<u8>),
    /// An opaque interface pointer surrogate; kept alive by the caller.
    Interface(u64),
}

/// Thread-safe private data storage attached to resources and heaps.
#[derive(Debug, Default)]
pub struct PrivateDataStore {
    entries: Mutex<HashMap<u128, PrivateDataValue>>,
}

impl PrivateDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `guid`. Returns true when the debug-name key
    /// changed, so the caller can propagate the name to the native object.
    pub fn set(&self, guid: u128, value: PrivateDataValue) -> bool {
        self.entries.lock().insert(guid, value);
        guid == DEBUG_NAME_GUID
    }

    pub fn remove(&self, guid: u128) {
        self.entries.lock().remove(&guid);
    }

    pub fn get_blob(&self, guid: u128) -> Option<Vec<u8>> {
        match self.entries.lock().get(&guid) {
            Some(PrivateDataValue::Blob(blob)) => Some(blob.clone()),
            _ => None,
        }
    }

    /// Convenience accessor for the debug name, if one is set and valid.
    pub fn name(&self) -> Option<String> {
        let blob = self.get_blob(DEBUG_NAME_GUID)?;
        String::from_utf8(blob).ok()
    }

    pub fn set_name(&self, name: &str) {
        self.set(
            DEBUG_NAME_GUID,
            PrivateDataValue::Blob(name.as_bytes().to_vec()),
        );
    }
}
