//! The global-variable table.
//!
//! Every declared global variable or class static owns a fixed 8-byte slot
//! in the global segment, keyed by its symbol UID. Slots are handed out in
//! registration order; registering a UID twice is an error.

use crate::fx::FxHashMap;
use crate::result::{CodegenError, CodegenResult};
use crate::srcmap::Loc;
use crate::writer::CodeOffset;

/// Allocates and resolves global slots.
#[derive(Default)]
pub struct GlobalTable {
    offsets: FxHashMap<u32, CodeOffset>,
    size: CodeOffset,
}

impl GlobalTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next 8-byte slot to `uid`.
    pub fn register(&mut self, uid: u32, name: &str, loc: &Loc) -> CodegenResult<CodeOffset> {
        if self.offsets.contains_key(&uid) {
            return Err(CodegenError::resolution(
                format!("global `{name}` (uid {uid}) is already registered"),
                loc,
            ));
        }
        let offset = self.size;
        self.offsets.insert(uid, offset);
        self.size += 8;
        Ok(offset)
    }

    /// The slot offset of a registered UID.
    pub fn offset_of(&self, uid: u32) -> Option<CodeOffset> {
        self.offsets.get(&uid).copied()
    }

    /// Size of the segment in bytes.
    pub fn byte_size(&self) -> CodeOffset {
        self.size
    }

    /// The segment's bytes: zero-initialized slots.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![0; self.size as usize]
    }
}
