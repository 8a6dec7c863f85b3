//! IR entity references.
//!
//! Instructions reference other entities, such as temporaries and branch
//! targets, through compact `u32` index newtypes rather than Rust
//! references. There is a separate index type for each entity type, so we
//! don't lose type safety.

use cranelift_entity::entity_impl;

/// An opaque reference to a temporary: a named virtual-register slot within
/// one function, minted by lowering and resolved to a physical register by
/// the allocator.
///
/// Displays as `tmp_N`, the textual spelling of temporaries in the IR.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Temp(u32);
entity_impl!(Temp, "tmp_");

/// An opaque reference to a code label: a function entry, a class method
/// entry, or a synthesized branch target inside a function.
///
/// Labels live in one build-wide namespace so the unresolved-reference map
/// in the linker can be keyed by them directly.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "label");
