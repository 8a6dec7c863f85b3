//! The target instruction set.
//!
//! The Sable VM is a register machine with 256 general-purpose registers
//! per frame and a one-byte opcode space. This module is the single source
//! of truth for opcode byte values and operand schemas; the encoder writes
//! whatever the schema table says, so adding an opcode means adding a row.

pub mod opcodes;
pub mod regs;

pub use self::opcodes::{InvalidOpcode, Opcode, OperandKind};
pub use self::regs::{ret_reg, ALLOC_LIMIT, NUM_REGS, RET_REG};
