//! Sable bytecode generation library.
//!
//! This crate is the code-generation back end of the Sable compiler: it
//! consumes a fully type-checked program representation (see [`sema`]) and
//! produces a linearly addressable bytecode image for the Sable virtual
//! machine, a register machine with 256 general-purpose registers per
//! frame.
//!
//! The pipeline, leaves first:
//!
//! - [`writer`]: the append-only little-endian byte buffer all segments are
//!   built in.
//! - [`sema`]: the resolved types and syntax the front end hands over,
//!   with value sizing and classification.
//! - [`ir`]: typed three-address instructions over virtual registers.
//! - [`lower`]: per-function code generation from the checked AST.
//! - [`regalloc`]: live-range construction and interference-graph coloring
//!   onto the VM's register file, spilling to frame slots when coloring
//!   fails.
//! - [`isa`] and [`encode`]: the opcode table and the byte-stream encoder
//!   with deferred resolution of labels.
//! - [`segments`] and [`image`]: the constant pool, global table, template
//!   descriptors and object keys, linked and concatenated into the final
//!   image.
//!
//! The main entry point is [`Context::compile`].

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use cranelift_entity as entity;

pub mod encode;
pub mod image;
pub mod interner;
pub mod ir;
pub mod isa;
pub mod lower;
pub mod regalloc;
pub mod segments;
pub mod sema;
pub mod srcmap;
pub mod writer;

mod context;
mod fx;
mod result;

pub use crate::context::Context;
pub use crate::image::Image;
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
