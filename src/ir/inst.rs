//! IR instructions.
//!
//! An [`Inst`] is an opcode tag plus a short argument list. Arguments are a
//! tagged union: temporaries, fixed physical registers, widened immediates,
//! labels, symbol UIDs and small descriptor bytes. Opcode tags carry the
//! operand width and family the mnemonic would spell out, e.g. `add_i32`
//! displays from `Op::Bin { op: AluOp::Add, ty: NumTy::I32 }`.

use crate::ir::entities::{Label, Temp};
use crate::ir::types::{NumFamily, NumTy, Width};
use crate::srcmap::Loc;
use core::fmt;
use smallvec::SmallVec;

/// Where a `tmp_*` load instruction takes its value from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TmpKind {
    /// A global variable slot, by byte offset in the global segment.
    Global,
    /// Another temporary; a coalescing hint.
    Reg,
    /// Another temporary, forcing a fresh live range. Used when a value is
    /// conceptually re-typed, e.g. for a mixed-width comparison.
    RegCopy,
    /// A function argument, by index.
    Arg,
    /// A local variable, by index.
    Local,
    /// A captured upvalue, by index.
    Upvalue,
    /// The code address of a function; pointer-width only.
    Func,
}

impl TmpKind {
    fn keyword(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Reg => "reg",
            Self::RegCopy => "reg_copy",
            Self::Arg => "arg",
            Self::Local => "local",
            Self::Upvalue => "upvalue",
            Self::Func => "func",
        }
    }
}

/// Arithmetic and logic operation selectors, combined with a [`NumTy`] to
/// pick the concrete opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Mod,
    /// Bitwise and; integers only.
    BAnd,
    /// Bitwise or; integers only.
    BOr,
    /// Bitwise exclusive or; integers only.
    BXor,
    /// Left shift; integers only.
    Shl,
    /// Right shift; integers only.
    Shr,
    /// Boolean and.
    And,
    /// Boolean or.
    Or,
}

/// An immediate literal, widened to 64 bits.
///
/// Floats are reinterpreted to their unsigned bit patterns when they enter
/// the byte stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Imm {
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    Uint(u64),
    /// A float.
    Float(f64),
}

impl Imm {
    /// The raw bits to encode, truncated to `width`.
    pub fn bits(self, width: Width) -> u64 {
        let full = match self {
            Self::Int(v) => v as u64,
            Self::Uint(v) => v,
            Self::Float(v) => {
                if width == Width::B4 {
                    u64::from((v as f32).to_bits())
                } else {
                    v.to_bits()
                }
            }
        };
        match width {
            Width::B8 => full,
            w => full & w.max_value(),
        }
    }
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Uint(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// An instruction argument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Arg {
    /// A temporary, resolved to a physical register by the allocator.
    Tmp(Temp),
    /// A fixed physical register; invisible to the allocator. Used for the
    /// return-register file.
    Reg(u8),
    /// An immediate literal.
    Imm(Imm),
    /// A branch or call target.
    Label(Label),
    /// A 32-bit symbolic quantity: a symbol UID, field ID, byte offset or
    /// slot number.
    Uid(u32),
    /// A small descriptor: an argument index, a count, a comparison kind.
    Byte(u8),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tmp(t) => write!(f, "{t}"),
            Self::Reg(r) => write!(f, "r{r}"),
            Self::Imm(imm) => write!(f, "{imm}"),
            Self::Label(l) => write!(f, "{l}"),
            Self::Uid(u) => write!(f, "{u}"),
            Self::Byte(b) => write!(f, "{b}"),
        }
    }
}

/// The opcode tag of an IR instruction.
///
/// Width- and family-parametric mnemonics carry their parameters as fields;
/// everything else matches its bytecode opcode one to one. The first three
/// variants are pseudo-instructions that never reach the encoder as bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Op {
    /// Function entry marker, the `fn` label.
    FnEntry,
    /// Defines a branch target at this position.
    Label,
    /// Terminates the live range of a discarded temporary.
    DestroyTmp,

    /// Reserve spill slots for this frame; inserted by the allocator right
    /// after the `fn` label.
    AllocSpill,
    /// Save a register into a spill slot.
    Spill,
    /// Restore a register from a spill slot.
    Unspill,

    /// Load a value into a temporary; see [`TmpKind`].
    Tmp {
        /// Value width.
        width: Width,
        /// True when the value is a pointer.
        ptr: bool,
        /// Source kind.
        kind: TmpKind,
    },
    /// Load an immediate.
    MvImm {
        /// Value width.
        width: Width,
    },
    /// Load from the constant pool.
    MvConst {
        /// Value width.
        width: Width,
        /// True when the constant is a pointer-sized byte blob.
        ptr: bool,
    },
    /// Store a temporary into a global slot.
    SetGlobal {
        /// Value width.
        width: Width,
        /// True when the value is a pointer.
        ptr: bool,
    },

    /// Allocate a struct without a template.
    SAlloc,
    /// Allocate a struct from a template descriptor.
    SAllocT,
    /// Register one field of a templateless struct.
    SRegField,
    /// Load a struct field.
    SLoadF {
        /// Field width.
        width: Width,
        /// True for pointer fields.
        ptr: bool,
    },
    /// Store a register into a struct field.
    SStoreF {
        /// Field width.
        width: Width,
        /// True for pointer fields.
        ptr: bool,
    },
    /// Store a pool constant into a struct field.
    SStoreFConst {
        /// Field width.
        width: Width,
    },

    /// Allocate a class instance from a template descriptor.
    CAllocT,
    /// Load a method address from an object's method table.
    CLoadM,
    /// Load a class attribute.
    CLoadF {
        /// Attribute width.
        width: Width,
        /// True for pointer attributes.
        ptr: bool,
    },
    /// Store a register into a class attribute.
    CStoreF {
        /// Attribute width.
        width: Width,
        /// True for pointer attributes.
        ptr: bool,
    },
    /// Test whether an interface value is an instance of a class.
    IIsC,
    /// Test whether an interface value's class has a method.
    IHasM,

    /// Allocate an array.
    AAlloc,
    /// Load an array element.
    AGetIndex {
        /// Element width.
        width: Width,
        /// True for pointer elements.
        ptr: bool,
    },
    /// Store a register into an array element.
    ASetIndex {
        /// Element width.
        width: Width,
        /// True for pointer elements.
        ptr: bool,
    },
    /// Store a pool constant into an array element at a fixed index.
    AStoreFConst {
        /// Element width.
        width: Width,
    },
    /// Load an array's length.
    ALen,

    /// A binary arithmetic or logic operation.
    Bin {
        /// Operation selector.
        op: AluOp,
        /// Operand class; floats are rejected by shift and bitwise ops.
        ty: NumTy,
    },
    /// Boolean negation.
    Not,
    /// Bitwise complement.
    BNot {
        /// Operand width.
        width: Width,
    },

    /// Unconditional jump.
    J,
    /// Compare-and-jump.
    JCmp {
        /// Operand class.
        ty: NumTy,
    },
    /// Jump if a value is null.
    JEqNull {
        /// Value width.
        width: Width,
        /// True when the value is a pointer.
        ptr: bool,
    },

    /// Same-width reinterpretation.
    Cast {
        /// Source class.
        from: NumTy,
        /// Target class.
        to: NumTy,
    },
    /// Widening conversion within a family.
    Upcast {
        /// Family of the conversion.
        family: NumFamily,
        /// Source width.
        from: Width,
        /// Target width.
        to: Width,
    },
    /// Narrowing conversion within a family.
    Dcast {
        /// Family of the conversion.
        family: NumFamily,
        /// Source width.
        from: Width,
        /// Target width.
        to: Width,
    },

    /// Open a fresh callee frame.
    FnAlloc,
    /// Pass an argument into the open callee frame.
    FnSetReg {
        /// Argument width.
        width: Width,
        /// True for pointer arguments.
        ptr: bool,
    },
    /// Call a function by label.
    CallLabel,
    /// Call a function address held in a register.
    CallPtr,
    /// Retrieve the VM's return register after a call.
    FnGetRet {
        /// True for pointer returns.
        ptr: bool,
    },
    /// Return from the current function.
    FnRet,
    /// Move a return value into the return-register file: register
    /// `255 - i` for return index `i`.
    Ret {
        /// Value width.
        width: Width,
        /// True for pointer returns.
        ptr: bool,
    },

    /// Allocate a closure over a function label.
    ClosureAlloc,
    /// Push a captured value into a closure environment.
    ClosurePushEnv {
        /// Capture width.
        width: Width,
        /// True for pointer captures.
        ptr: bool,
    },
    /// Call a closure.
    ClosureCall,

    /// Allocate a coroutine over a function label.
    CoroutineAlloc,
    /// Allocate a coroutine over a function value.
    CoroutineFnAlloc,
    /// Read a coroutine's state word.
    CoroutineGetState,
    /// Resume a coroutine.
    CoroutineCall,
    /// Suspend the current coroutine.
    CoroutineYield,
    /// Return from a coroutine body.
    CoroutineRet,

    /// Print a register for debugging.
    DebugReg,
}

impl Op {
    /// True for pseudo-instructions that never encode to bytes.
    pub fn is_pseudo(self) -> bool {
        matches!(self, Self::FnEntry | Self::Label | Self::DestroyTmp)
    }

    /// True for intra-function jumps, whose label operands participate in
    /// live-range extension over back edges.
    pub fn is_branch(self) -> bool {
        matches!(self, Self::J | Self::JCmp { .. } | Self::JEqNull { .. })
    }

    fn width_suffix(f: &mut fmt::Formatter, width: Width, ptr: bool) -> fmt::Result {
        if ptr {
            f.write_str("_ptr")
        } else {
            write!(f, "_{}", width.bits())
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::FnEntry => f.write_str("fn"),
            Self::Label => f.write_str("label"),
            Self::DestroyTmp => f.write_str("destroy_tmp"),
            Self::AllocSpill => f.write_str("alloc_spill"),
            Self::Spill => f.write_str("spill"),
            Self::Unspill => f.write_str("unspill"),
            Self::Tmp { width, ptr, .. } => {
                f.write_str("tmp")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::MvImm { .. } => f.write_str("mv_reg_i"),
            Self::MvConst { width, ptr } => {
                f.write_str("mv_reg_const")?;
                if ptr {
                    f.write_str("_ptr")?;
                } else {
                    write!(f, "_{}", width.bits())?;
                }
                Ok(())
            }
            Self::SetGlobal { width, ptr } => {
                f.write_str("mv_global_reg")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::SAlloc => f.write_str("s_alloc"),
            Self::SAllocT => f.write_str("s_alloc_t"),
            Self::SRegField => f.write_str("s_reg_field"),
            Self::SLoadF { width, ptr } => {
                f.write_str("s_get_field")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::SStoreF { width, ptr } => {
                f.write_str("s_set_field")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::SStoreFConst { width } => write!(f, "s_set_field_const_{}", width.bits()),
            Self::CAllocT => f.write_str("c_alloc_t"),
            Self::CLoadM => f.write_str("c_loadm"),
            Self::CLoadF { width, ptr } => {
                f.write_str("c_get_field")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::CStoreF { width, ptr } => {
                f.write_str("c_set_field")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::IIsC => f.write_str("i_is_c"),
            Self::IHasM => f.write_str("i_has_m"),
            Self::AAlloc => f.write_str("a_alloc"),
            Self::AGetIndex { width, ptr } => {
                f.write_str("a_get_index")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::ASetIndex { width, ptr } => {
                f.write_str("a_set_index")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::AStoreFConst { width } => write!(f, "a_storef_const_{}", width.bits()),
            Self::ALen => f.write_str("a_len"),
            Self::Bin { op, ty } => match op {
                AluOp::Add => write!(f, "add_{ty}"),
                AluOp::Sub => write!(f, "sub_{ty}"),
                AluOp::Mul => write!(f, "mul_{ty}"),
                AluOp::Div => write!(f, "div_{ty}"),
                AluOp::Mod => write!(f, "mod_{ty}"),
                AluOp::BAnd => write!(f, "band_{}", ty.width().bits()),
                AluOp::BOr => write!(f, "bor_{}", ty.width().bits()),
                AluOp::BXor => write!(f, "bxor_{}", ty.width().bits()),
                AluOp::Shl => write!(f, "lshift_{}", ty.width().bits()),
                AluOp::Shr => write!(f, "rshift_{}", ty.width().bits()),
                AluOp::And => f.write_str("and"),
                AluOp::Or => f.write_str("or"),
            },
            Self::Not => f.write_str("not"),
            Self::BNot { width } => write!(f, "bnot_{}", width.bits()),
            Self::J => f.write_str("j"),
            Self::JCmp { ty } => write!(f, "j_cmp_{ty}"),
            Self::JEqNull { width, ptr } => {
                f.write_str("j_eq_null")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::Cast { from, to } => write!(f, "cast_{from}_{to}"),
            Self::Upcast { family, from, to } => {
                let fam = match family {
                    NumFamily::Signed => "i",
                    NumFamily::Unsigned => "u",
                    NumFamily::Float => "f",
                };
                write!(f, "upcast_{fam}_{}_{}", from.bits(), to.bits())
            }
            Self::Dcast { family, from, to } => {
                let fam = match family {
                    NumFamily::Signed => "i",
                    NumFamily::Unsigned => "u",
                    NumFamily::Float => "f",
                };
                write!(f, "dcast_{fam}_{}_{}", from.bits(), to.bits())
            }
            Self::FnAlloc => f.write_str("fn_alloc"),
            Self::FnSetReg { width, ptr } => {
                f.write_str("fn_set_reg")?;
                if ptr {
                    f.write_str("_ptr")?;
                } else {
                    write!(f, "_{}", width.bits())?;
                }
                Ok(())
            }
            Self::CallLabel => f.write_str("call"),
            Self::CallPtr => f.write_str("call_ptr"),
            Self::FnGetRet { ptr } => {
                f.write_str("fn_get_ret_reg")?;
                if ptr {
                    f.write_str("_ptr")?;
                }
                Ok(())
            }
            Self::FnRet => f.write_str("fn_ret"),
            Self::Ret { width, ptr } => {
                f.write_str("ret")?;
                Self::width_suffix(f, width, ptr)
            }
            Self::ClosureAlloc => f.write_str("closure_alloc"),
            Self::ClosurePushEnv { width, ptr } => {
                f.write_str("closure_push_env")?;
                if ptr {
                    f.write_str("_ptr")?;
                } else {
                    write!(f, "_{}", width.bits())?;
                }
                Ok(())
            }
            Self::ClosureCall => f.write_str("closure_call"),
            Self::CoroutineAlloc => f.write_str("coroutine_alloc"),
            Self::CoroutineFnAlloc => f.write_str("coroutine_fn_alloc"),
            Self::CoroutineGetState => f.write_str("coroutine_get_state"),
            Self::CoroutineCall => f.write_str("coroutine_call"),
            Self::CoroutineYield => f.write_str("coroutine_yield"),
            Self::CoroutineRet => f.write_str("coroutine_ret"),
            Self::DebugReg => f.write_str("debug_reg"),
        }
    }
}

/// One IR instruction: opcode tag, arguments, and the source location on
/// top of the location stack when it was created.
#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
    /// The opcode tag.
    pub op: Op,
    /// The argument list.
    pub args: SmallVec<[Arg; 4]>,
    /// Source annotation for the source map.
    pub loc: Loc,
}

impl Inst {
    /// Create an instruction.
    pub fn new(op: Op, args: impl IntoIterator<Item = Arg>, loc: Loc) -> Self {
        Self {
            op,
            args: args.into_iter().collect(),
            loc,
        }
    }

    /// The branch target of a jump instruction, if any.
    pub fn branch_target(&self) -> Option<Label> {
        if !self.op.is_branch() {
            return None;
        }
        self.args.iter().find_map(|arg| match arg {
            Arg::Label(l) => Some(*l),
            _ => None,
        })
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if let Op::Tmp { kind, .. } = self.op {
            // tmp loads spell their source kind as the second operand.
            if let [dst, rest @ ..] = &self.args[..] {
                write!(f, " {dst}, {}", kind.keyword())?;
                for arg in rest {
                    write!(f, ", {arg}")?;
                }
                return Ok(());
            }
        }
        if let Op::JCmp { .. } = self.op {
            if let [a, b, Arg::Byte(kind), target] = &self.args[..] {
                let kind = match kind {
                    0 => "==",
                    1 => "!=",
                    2 => "<",
                    3 => "<=",
                    4 => ">",
                    _ => ">=",
                };
                return write!(f, " {a}, {b}, {kind}, {target}");
            }
        }
        for (i, arg) in self.args.iter().enumerate() {
            if i == 0 {
                write!(f, " {arg}")?;
            } else {
                write!(f, ", {arg}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn display_spells_mnemonics() {
        let loc = Loc::unknown();
        let add = Inst::new(
            Op::Bin { op: AluOp::Add, ty: NumTy::I32 },
            [Arg::Tmp(Temp::new(2)), Arg::Tmp(Temp::new(0)), Arg::Tmp(Temp::new(1))],
            loc.clone(),
        );
        assert_eq!(add.to_string(), "add_i32 tmp_2, tmp_0, tmp_1");

        let load = Inst::new(
            Op::Tmp { width: Width::B8, ptr: false, kind: TmpKind::Local },
            [Arg::Tmp(Temp::new(4)), Arg::Uid(1)],
            loc.clone(),
        );
        assert_eq!(load.to_string(), "tmp_64 tmp_4, local, 1");

        let band = Inst::new(
            Op::Bin { op: AluOp::BAnd, ty: NumTy::U64 },
            [Arg::Tmp(Temp::new(5)), Arg::Tmp(Temp::new(3)), Arg::Tmp(Temp::new(4))],
            loc,
        );
        assert_eq!(band.to_string(), "band_64 tmp_5, tmp_3, tmp_4");
    }

    #[test]
    fn branch_target_only_for_branches() {
        let loc = Loc::unknown();
        let j = Inst::new(Op::J, [Arg::Label(Label::new(3))], loc.clone());
        assert_eq!(j.branch_target(), Some(Label::new(3)));
        let call = Inst::new(Op::CallLabel, [Arg::Label(Label::new(3))], loc);
        assert_eq!(call.branch_target(), None);
    }
}
