//! Intermediate representation.
//!
//! Lowering produces, per function, a flat list of typed three-address
//! [`Inst`]ructions over virtual registers, labels and symbolic operands.
//! The list is created by code generation, mutated only by the register
//! allocator (which inserts spill traffic and resolves temporaries to
//! physical registers), and then consumed by the instruction encoder.

pub mod condcodes;
pub mod entities;
pub mod inst;
pub mod types;

pub use self::condcodes::CmpKind;
pub use self::entities::{Label, Temp};
pub use self::inst::{AluOp, Arg, Imm, Inst, Op, TmpKind};
pub use self::types::{NumFamily, NumTy, Width};
