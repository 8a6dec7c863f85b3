//! The constant pool.
//!
//! Values too large or too structured to embed in the instruction stream
//! live in the constant pool and are referenced by byte offset. The pool is
//! append-only during a build, so offsets handed out are stable. Inserting
//! the same bytes twice returns the same offset.

use crate::ir::types::Width;
use crate::writer::CodeOffset;
use std::collections::BTreeMap;

/// Append-only, deduplicating pool of constant bytes.
///
/// The mapping from data to offset is kept in a `BTreeMap` so pool layout
/// is deterministic for identical inputs.
#[derive(Default)]
pub struct ConstantPool {
    data: Vec<u8>,
    offsets: BTreeMap<Vec<u8>, CodeOffset>,
}

impl ConstantPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert raw bytes, returning their starting offset.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> CodeOffset {
        if let Some(&offset) = self.offsets.get(bytes) {
            return offset;
        }
        let offset = self.data.len() as CodeOffset;
        self.data.extend_from_slice(bytes);
        self.offsets.insert(bytes.to_vec(), offset);
        offset
    }

    /// Insert an integer in `width` little-endian bytes.
    pub fn push_int(&mut self, value: u64, width: Width) -> CodeOffset {
        self.push_bytes(&value.to_le_bytes()[..width.bytes() as usize])
    }

    /// Insert a 32-bit float as its bit pattern.
    pub fn push_f32(&mut self, value: f32) -> CodeOffset {
        self.push_bytes(&value.to_bits().to_le_bytes())
    }

    /// Insert a 64-bit float as its bit pattern.
    pub fn push_f64(&mut self, value: f64) -> CodeOffset {
        self.push_bytes(&value.to_bits().to_le_bytes())
    }

    /// The pool's bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Size of the pool in bytes.
    pub fn byte_size(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_stable_and_deduplicated() {
        let mut pool = ConstantPool::new();
        let a = pool.push_bytes(b"hello");
        let b = pool.push_bytes(b"world");
        assert_eq!(a, 0);
        assert_eq!(b, 5);
        assert_eq!(pool.push_bytes(b"hello"), a);
        assert_eq!(pool.byte_size(), 10);
    }

    #[test]
    fn ints_are_little_endian() {
        let mut pool = ConstantPool::new();
        pool.push_int(0x0102, Width::B2);
        assert_eq!(pool.as_slice(), &[0x02, 0x01]);
    }

    #[test]
    fn floats_enter_as_bit_patterns() {
        let mut pool = ConstantPool::new();
        let offset = pool.push_f64(1.5);
        assert_eq!(offset, 0);
        assert_eq!(pool.as_slice(), &1.5f64.to_bits().to_le_bytes());
    }
}
