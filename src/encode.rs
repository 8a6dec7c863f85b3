//! Instruction encoding.
//!
//! Every IR instruction encodes to one opcode byte followed by the fixed
//! operand schema the ISA table declares for it. Branch and call targets
//! are emitted as 4-byte placeholders; each placeholder site is recorded in
//! the unresolved-labels map keyed by the target [`Label`], and the linker
//! patches all of them once every label has a resolved offset.
//!
//! Temporary-load instructions (`tmp_*`) are the one many-to-less mapping:
//! when the allocator coalesced the destination with the source they encode
//! to nothing at all, otherwise they become the matching `mv_*` opcode.

use crate::fx::FxHashMap;
use crate::ir::entities::{Label, Temp};
use crate::ir::inst::{Arg, Inst, Op, TmpKind};
use crate::ir::types::Width;
use crate::isa::{Opcode, OperandKind};
use crate::result::{CodegenError, CodegenResult};
use crate::srcmap::{Loc, SourceMapBuilder};
use crate::writer::{ByteWriter, CodeOffset};
use smallvec::SmallVec;

/// The build-wide label namespace: allocation, resolution, and the
/// unresolved-reference map.
#[derive(Default)]
pub struct Labels {
    next: u32,
    names: FxHashMap<Label, String>,
    resolved: FxHashMap<Label, CodeOffset>,
    uses: FxHashMap<Label, Vec<CodeOffset>>,
}

impl Labels {
    /// Create an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh label.
    pub fn alloc(&mut self) -> Label {
        let label = Label::from_u32(self.next);
        self.next += 1;
        label
    }

    /// Allocate a fresh label carrying a diagnostic name.
    pub fn alloc_named(&mut self, name: impl Into<String>) -> Label {
        let label = self.alloc();
        self.names.insert(label, name.into());
        label
    }

    /// Record the resolved code offset of `label`.
    pub fn resolve(&mut self, label: Label, offset: CodeOffset) {
        let prev = self.resolved.insert(label, offset);
        debug_assert!(prev.is_none(), "label {label} resolved twice");
    }

    /// Record a placeholder site that must be patched with `label`'s
    /// resolved offset.
    pub fn use_at(&mut self, label: Label, site: CodeOffset) {
        self.uses.entry(label).or_default().push(site);
    }

    /// The resolved offset of `label`, if it has one.
    pub fn resolved_offset(&self, label: Label) -> Option<CodeOffset> {
        self.resolved.get(&label).copied()
    }

    /// The diagnostic name of `label`.
    pub fn name_of(&self, label: Label) -> String {
        self.names
            .get(&label)
            .cloned()
            .unwrap_or_else(|| label.to_string())
    }

    /// Patch every recorded site in `code`, draining the unresolved map.
    ///
    /// Any label that was used but never resolved is a fatal error.
    pub fn link(&mut self, code: &mut ByteWriter) -> CodegenResult<()> {
        let uses = std::mem::take(&mut self.uses);
        for (label, sites) in uses {
            let offset = self
                .resolved
                .get(&label)
                .copied()
                .ok_or_else(|| CodegenError::UnresolvedLabel(self.name_of(label)))?;
            for site in sites {
                code.patch_at(site, u64::from(offset), Width::B4)?;
            }
        }
        Ok(())
    }

    /// True once `link` has drained every recorded use.
    pub fn is_fully_resolved(&self) -> bool {
        self.uses.is_empty()
    }
}

/// One operand value handed to [`Encoder::emit`].
#[derive(Clone, Copy, Debug)]
pub enum EncOp {
    /// A plain unsigned value, truncated per the schema slot.
    U(u64),
    /// A label whose offset the linker fills in.
    Target(Label),
}

/// Streams encoded instructions into the code segment.
pub struct Encoder<'a> {
    code: &'a mut ByteWriter,
    labels: &'a mut Labels,
    srcmap: &'a mut SourceMapBuilder,
}

impl<'a> Encoder<'a> {
    /// Create an encoder over the code segment.
    pub fn new(
        code: &'a mut ByteWriter,
        labels: &'a mut Labels,
        srcmap: &'a mut SourceMapBuilder,
    ) -> Self {
        Self {
            code,
            labels,
            srcmap,
        }
    }

    /// Current offset in the code segment.
    pub fn offset(&self) -> CodeOffset {
        self.code.len()
    }

    /// Encode one complete function.
    ///
    /// `entry` resolves to the first executable byte; class methods are
    /// prefixed with their 4-byte interface-method UID for the VM's
    /// dispatch cache, and `entry` points just past the prefix.
    pub fn encode_func(
        &mut self,
        name: &str,
        entry: Label,
        method_uid: Option<u32>,
        insts: &[Inst],
        colors: &FxHashMap<Temp, u8>,
    ) -> CodegenResult<()> {
        log::debug!("encoding `{name}` at code offset {}", self.code.len());
        for inst in insts {
            match inst.op {
                Op::FnEntry => {
                    if let Some(uid) = method_uid {
                        self.code.u32(uid);
                    }
                    self.labels.resolve(entry, self.code.len());
                }
                Op::Label => {
                    let label = match inst.args[..] {
                        [Arg::Label(label)] => label,
                        _ => {
                            return Err(CodegenError::Encoding(
                                "label instruction without a label operand".into(),
                            ))
                        }
                    };
                    self.labels.resolve(label, self.code.len());
                }
                Op::DestroyTmp => {}
                _ => self.encode_inst(name, inst, colors)?,
            }
        }
        Ok(())
    }

    fn reg(&self, arg: &Arg, colors: &FxHashMap<Temp, u8>) -> CodegenResult<u8> {
        match arg {
            Arg::Reg(r) => Ok(*r),
            Arg::Tmp(t) => colors.get(t).copied().ok_or_else(|| {
                CodegenError::Encoding(format!("temporary {t} has no register assignment"))
            }),
            other => Err(CodegenError::Encoding(format!(
                "expected a register operand, found {other:?}"
            ))),
        }
    }

    fn uid(arg: &Arg) -> CodegenResult<u64> {
        match arg {
            Arg::Uid(u) => Ok(u64::from(*u)),
            Arg::Byte(b) => Ok(u64::from(*b)),
            other => Err(CodegenError::Encoding(format!(
                "expected an immediate operand, found {other:?}"
            ))),
        }
    }

    fn label(arg: &Arg) -> CodegenResult<Label> {
        match arg {
            Arg::Label(label) => Ok(*label),
            other => Err(CodegenError::Encoding(format!(
                "expected a label operand, found {other:?}"
            ))),
        }
    }

    fn encode_inst(
        &mut self,
        func: &str,
        inst: &Inst,
        colors: &FxHashMap<Temp, u8>,
    ) -> CodegenResult<()> {
        use EncOp::{Target, U};

        let mismatch =
            || CodegenError::Encoding(format!("argument count mismatch for `{}`", inst.op));
        let args = &inst.args[..];
        let mut ops: SmallVec<[EncOp; 6]> = SmallVec::new();

        let opcode = match inst.op {
            Op::FnEntry | Op::Label | Op::DestroyTmp => unreachable!("pseudo ops handled earlier"),

            Op::AllocSpill => {
                let [total] = args else { return Err(mismatch()) };
                ops.push(U(Self::uid(total)?));
                Opcode::AllocSpill
            }
            Op::Spill => {
                let [slot, src] = args else { return Err(mismatch()) };
                ops.push(U(Self::uid(slot)?));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                Opcode::Spill
            }
            Op::Unspill => {
                let [dst, slot] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(Self::uid(slot)?));
                Opcode::Unspill
            }

            Op::Tmp { width, ptr, kind } => {
                return self.encode_tmp(func, inst, width, ptr, kind, colors);
            }
            Op::MvImm { width } => {
                let [dst, Arg::Imm(imm)] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(imm.bits(width)));
                Opcode::MvRegI
            }
            Op::MvConst { width, ptr } => {
                let [dst, offset] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(Self::uid(offset)?));
                if ptr {
                    Opcode::MvRegConstPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::MvRegConst
                }
            }
            Op::SetGlobal { width, ptr } => {
                let [offset, src] = args else { return Err(mismatch()) };
                ops.push(U(Self::uid(offset)?));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                if ptr {
                    Opcode::MvGlobalRegPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::MvGlobalReg
                }
            }

            Op::SAlloc => {
                let [dst, count, size] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(Self::uid(count)?));
                ops.push(U(Self::uid(size)?));
                Opcode::SAlloc
            }
            Op::SAllocT => {
                let [dst, template] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(Self::uid(template)?));
                Opcode::SAllocT
            }
            Op::SRegField => {
                let [obj, local, field, offset, is_ptr] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(local)?));
                ops.push(U(Self::uid(field)?));
                ops.push(U(Self::uid(offset)?));
                ops.push(U(Self::uid(is_ptr)?));
                Opcode::SRegField
            }
            Op::SLoadF { width, ptr } => {
                let [dst, obj, field] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(field)?));
                if ptr {
                    Opcode::SLoadFPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::SLoadF
                }
            }
            Op::SStoreF { width, ptr } => {
                let [obj, field, src] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(field)?));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                if ptr {
                    Opcode::SStorefRegPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::SStorefReg
                }
            }
            Op::SStoreFConst { width } => {
                let [obj, field, offset] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(field)?));
                ops.push(U(Self::uid(offset)?));
                ops.push(U(u64::from(width.bytes())));
                Opcode::SStorefConst
            }

            Op::CAllocT => {
                let [dst, template] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(Self::uid(template)?));
                Opcode::CAllocT
            }
            Op::CLoadM => {
                let [dst, obj, uid] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(uid)?));
                Opcode::CLoadm
            }
            Op::CLoadF { width, ptr } => {
                let [dst, obj, offset] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(offset)?));
                if ptr {
                    Opcode::CLoadfPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::CLoadf
                }
            }
            Op::CStoreF { width, ptr } => {
                let [obj, offset, src] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(offset)?));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                if ptr {
                    Opcode::CStorefRegPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::CStorefReg
                }
            }
            Op::IIsC => {
                let [dst, obj, class] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(class)?));
                Opcode::IIsC
            }
            Op::IHasM => {
                let [dst, obj, uid] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(obj, colors)?)));
                ops.push(U(Self::uid(uid)?));
                Opcode::IHasM
            }

            Op::AAlloc => {
                let [dst, kind, Arg::Imm(len), size] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(Self::uid(kind)?));
                ops.push(U(len.bits(Width::B8)));
                ops.push(U(Self::uid(size)?));
                Opcode::AAlloc
            }
            Op::AGetIndex { width, ptr } => {
                let [dst, arr, index] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(arr, colors)?)));
                ops.push(U(u64::from(self.reg(index, colors)?)));
                if ptr {
                    Opcode::AGetIndexPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::AGetIndex
                }
            }
            Op::ASetIndex { width, ptr } => {
                let [arr, index, src] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(arr, colors)?)));
                ops.push(U(u64::from(self.reg(index, colors)?)));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                if ptr {
                    Opcode::ASetIndexPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::ASetIndex
                }
            }
            Op::AStoreFConst { width } => {
                let [arr, index, offset] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(arr, colors)?)));
                ops.push(U(Self::uid(index)?));
                ops.push(U(Self::uid(offset)?));
                ops.push(U(u64::from(width.bytes())));
                Opcode::AStorefConst
            }
            Op::ALen => {
                let [dst, arr] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(arr, colors)?)));
                Opcode::ALen
            }

            Op::Bin { op, ty } => {
                let [dst, a, b] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(a, colors)?)));
                ops.push(U(u64::from(self.reg(b, colors)?)));
                Opcode::bin_alu(op, ty).ok_or_else(|| {
                    CodegenError::Encoding(format!("no opcode for {op:?} over {ty}"))
                })?
            }
            Op::Not => {
                let [dst, src] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                Opcode::Not
            }
            Op::BNot { width } => {
                let [dst, src] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                Opcode::bnot(width)
            }

            Op::J => {
                let [target] = args else { return Err(mismatch()) };
                ops.push(U(8));
                ops.push(Target(Self::label(target)?));
                Opcode::J
            }
            Op::JCmp { ty } => {
                let [a, b, kind, target] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(a, colors)?)));
                ops.push(U(u64::from(self.reg(b, colors)?)));
                ops.push(U(Self::uid(kind)?));
                ops.push(Target(Self::label(target)?));
                Opcode::j_cmp(ty)
            }
            Op::JEqNull { width, ptr } => {
                let [value, target] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(value, colors)?)));
                ops.push(Target(Self::label(target)?));
                if ptr {
                    Opcode::JEqNullPtr
                } else {
                    Opcode::j_eq_null(width)
                }
            }

            Op::Cast { from, to } => {
                let [reg] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(reg, colors)?)));
                Opcode::cast(from, to).ok_or_else(|| {
                    CodegenError::Encoding(format!("no reinterpretation from {from} to {to}"))
                })?
            }
            Op::Upcast { family, from, to } => {
                let [reg] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(reg, colors)?)));
                ops.push(U(u64::from(from.bytes())));
                ops.push(U(u64::from(to.bytes())));
                Opcode::upcast(family)
            }
            Op::Dcast { family, from, to } => {
                let [reg] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(reg, colors)?)));
                ops.push(U(u64::from(from.bytes())));
                ops.push(U(u64::from(to.bytes())));
                Opcode::dcast(family)
            }

            Op::FnAlloc => {
                if !args.is_empty() {
                    return Err(mismatch());
                }
                Opcode::FnAlloc
            }
            Op::FnSetReg { width, ptr } => {
                let [slot, src] = args else { return Err(mismatch()) };
                ops.push(U(Self::uid(slot)?));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                if ptr {
                    Opcode::FnSetRegPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::FnSetReg
                }
            }
            Op::CallLabel => {
                let [target] = args else { return Err(mismatch()) };
                ops.push(Target(Self::label(target)?));
                Opcode::FnCalli
            }
            Op::CallPtr => {
                let [callee] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(callee, colors)?)));
                Opcode::FnCall
            }
            Op::FnGetRet { ptr } => {
                if ptr {
                    let [dst, src] = args else { return Err(mismatch()) };
                    ops.push(U(u64::from(self.reg(dst, colors)?)));
                    ops.push(U(u64::from(self.reg(src, colors)?)));
                    Opcode::FnGetRetRegPtr
                } else {
                    let [dst, src, size] = args else { return Err(mismatch()) };
                    ops.push(U(u64::from(self.reg(dst, colors)?)));
                    ops.push(U(u64::from(self.reg(src, colors)?)));
                    ops.push(U(Self::uid(size)?));
                    Opcode::FnGetRetReg
                }
            }
            Op::FnRet => {
                if !args.is_empty() {
                    return Err(mismatch());
                }
                Opcode::FnRet
            }
            Op::Ret { width, ptr } => {
                // `ret_<w> val, i` moves the value into return register
                // `255 - i` of the current frame.
                let [val, index] = args else { return Err(mismatch()) };
                let index = Self::uid(index)? as u8;
                ops.push(U(u64::from(crate::isa::ret_reg(index))));
                ops.push(U(u64::from(self.reg(val, colors)?)));
                if ptr {
                    Opcode::MvRegRegPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::MvRegReg
                }
            }

            Op::ClosureAlloc => {
                let [dst, target, env] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(Target(Self::label(target)?));
                ops.push(U(Self::uid(env)?));
                Opcode::ClosureAlloc
            }
            Op::ClosurePushEnv { width, ptr } => {
                let [closure, src] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(closure, colors)?)));
                ops.push(U(u64::from(self.reg(src, colors)?)));
                if ptr {
                    Opcode::ClosurePushEnvPtr
                } else {
                    ops.push(U(u64::from(width.bytes())));
                    Opcode::ClosurePushEnv
                }
            }
            Op::ClosureCall => {
                let [closure] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(closure, colors)?)));
                Opcode::ClosureCall
            }

            Op::CoroutineAlloc => {
                let [dst, target] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(Target(Self::label(target)?));
                Opcode::CoroutineAlloc
            }
            Op::CoroutineFnAlloc => {
                let [dst, func] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(func, colors)?)));
                Opcode::CoroutineFnAlloc
            }
            Op::CoroutineGetState => {
                let [dst, coro] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(dst, colors)?)));
                ops.push(U(u64::from(self.reg(coro, colors)?)));
                Opcode::CoroutineGetState
            }
            Op::CoroutineCall => {
                let [coro] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(coro, colors)?)));
                Opcode::CoroutineCall
            }
            Op::CoroutineYield => {
                if !args.is_empty() {
                    return Err(mismatch());
                }
                Opcode::CoroutineYield
            }
            Op::CoroutineRet => {
                if !args.is_empty() {
                    return Err(mismatch());
                }
                Opcode::CoroutineRet
            }

            Op::DebugReg => {
                let [value] = args else { return Err(mismatch()) };
                ops.push(U(u64::from(self.reg(value, colors)?)));
                Opcode::DebugReg
            }
        };

        self.emit(opcode, &ops, &inst.loc, func)
    }

    fn encode_tmp(
        &mut self,
        func: &str,
        inst: &Inst,
        width: Width,
        ptr: bool,
        kind: TmpKind,
        colors: &FxHashMap<Temp, u8>,
    ) -> CodegenResult<()> {
        use EncOp::{Target, U};

        let mismatch =
            || CodegenError::Encoding(format!("argument count mismatch for `{}`", inst.op));
        let [dst, src] = &inst.args[..] else { return Err(mismatch()) };
        let dst = self.reg(dst, colors)?;
        match kind {
            TmpKind::Global => {
                let offset = Self::uid(src)?;
                if ptr {
                    self.emit(
                        Opcode::MvRegGlobalPtr,
                        &[U(u64::from(dst)), U(offset)],
                        &inst.loc,
                        func,
                    )
                } else {
                    self.emit(
                        Opcode::MvRegGlobal,
                        &[U(u64::from(dst)), U(offset), U(u64::from(width.bytes()))],
                        &inst.loc,
                        func,
                    )
                }
            }
            TmpKind::Func => {
                let target = Self::label(src)?;
                self.emit(
                    Opcode::MvRegFn,
                    &[U(u64::from(dst)), Target(target)],
                    &inst.loc,
                    func,
                )
            }
            TmpKind::Reg
            | TmpKind::RegCopy
            | TmpKind::Arg
            | TmpKind::Local
            | TmpKind::Upvalue => {
                let src = self.reg(src, colors)?;
                if src == dst {
                    // Coalesced: the temporary lives in the symbol's
                    // register already.
                    return Ok(());
                }
                if ptr {
                    self.emit(
                        Opcode::MvRegRegPtr,
                        &[U(u64::from(dst)), U(u64::from(src))],
                        &inst.loc,
                        func,
                    )
                } else {
                    self.emit(
                        Opcode::MvRegReg,
                        &[U(u64::from(dst)), U(u64::from(src)), U(u64::from(width.bytes()))],
                        &inst.loc,
                        func,
                    )
                }
            }
        }
    }

    /// Emit one opcode with its operands against the schema table.
    pub fn emit(
        &mut self,
        opcode: Opcode,
        ops: &[EncOp],
        loc: &Loc,
        func: &str,
    ) -> CodegenResult<()> {
        let schema = opcode.schema();
        if schema.len() != ops.len() {
            return Err(CodegenError::Encoding(format!(
                "`{opcode}` takes {} operands, got {}",
                schema.len(),
                ops.len()
            )));
        }
        self.code.u8(opcode.into());
        for (kind, op) in schema.iter().zip(ops) {
            match (kind, op) {
                (OperandKind::Reg, EncOp::U(v)) | (OperandKind::Imm8, EncOp::U(v)) => {
                    self.code.uint(*v, Width::B1)?;
                }
                (OperandKind::Imm16, EncOp::U(v)) => {
                    self.code.uint(*v, Width::B2)?;
                }
                (OperandKind::Imm32, EncOp::U(v)) => {
                    self.code.uint(*v, Width::B4)?;
                }
                (OperandKind::Imm64, EncOp::U(v)) => {
                    self.code.u64(*v);
                }
                (OperandKind::VarUint, EncOp::U(v)) => {
                    self.code.var_uint(*v);
                }
                (OperandKind::Target, EncOp::Target(label)) => {
                    let site = self.code.u32(0);
                    self.labels.use_at(*label, site);
                }
                (kind, op) => {
                    return Err(CodegenError::Encoding(format!(
                        "`{opcode}` schema slot {kind:?} cannot take {op:?}"
                    )));
                }
            }
        }
        self.srcmap.push(loc, func);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::inst::Imm;

    #[test]
    fn linking_patches_every_site() {
        let mut code = ByteWriter::new();
        let mut labels = Labels::new();
        let mut srcmap = SourceMapBuilder::new();
        let target = labels.alloc_named("target");
        {
            let mut enc = Encoder::new(&mut code, &mut labels, &mut srcmap);
            enc.emit(
                Opcode::FnCalli,
                &[EncOp::Target(target)],
                &Loc::unknown(),
                "t",
            )
            .unwrap();
        }
        labels.resolve(target, 0x11223344);
        labels.link(&mut code).unwrap();
        assert!(labels.is_fully_resolved());
        assert_eq!(code.as_slice(), &[0xb4, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn unresolved_labels_are_fatal() {
        let mut code = ByteWriter::new();
        let mut labels = Labels::new();
        let mut srcmap = SourceMapBuilder::new();
        let target = labels.alloc_named("missing");
        {
            let mut enc = Encoder::new(&mut code, &mut labels, &mut srcmap);
            enc.emit(Opcode::J, &[EncOp::U(8), EncOp::Target(target)], &Loc::unknown(), "t")
                .unwrap();
        }
        let err = labels.link(&mut code).unwrap_err();
        assert!(matches!(err, CodegenError::UnresolvedLabel(name) if name == "missing"));
    }

    #[test]
    fn schema_mismatch_is_an_encoding_error() {
        let mut code = ByteWriter::new();
        let mut labels = Labels::new();
        let mut srcmap = SourceMapBuilder::new();
        let mut enc = Encoder::new(&mut code, &mut labels, &mut srcmap);
        let err = enc
            .emit(Opcode::MvRegReg, &[EncOp::U(1)], &Loc::unknown(), "t")
            .unwrap_err();
        assert!(matches!(err, CodegenError::Encoding(_)));
    }

    #[test]
    fn coalesced_tmp_loads_encode_to_nothing() {
        let mut code = ByteWriter::new();
        let mut labels = Labels::new();
        let mut srcmap = SourceMapBuilder::new();
        let mut colors = FxHashMap::default();
        let t0 = Temp::from_u32(0);
        colors.insert(t0, 3u8);
        let inst = Inst::new(
            Op::Tmp { width: Width::B4, ptr: false, kind: TmpKind::Reg },
            [Arg::Tmp(t0), Arg::Reg(3)],
            Loc::unknown(),
        );
        let mut enc = Encoder::new(&mut code, &mut labels, &mut srcmap);
        enc.encode_inst("t", &inst, &colors).unwrap();
        assert!(code.is_empty());
        // Different registers materialize as a move.
        let inst = Inst::new(
            Op::Tmp { width: Width::B4, ptr: false, kind: TmpKind::Reg },
            [Arg::Tmp(t0), Arg::Reg(5)],
            Loc::unknown(),
        );
        let mut enc = Encoder::new(&mut code, &mut labels, &mut srcmap);
        enc.encode_inst("t", &inst, &colors).unwrap();
        assert_eq!(code.as_slice(), &[0x01, 3, 5, 4]);
    }

    #[test]
    fn immediates_use_var_uint() {
        let mut code = ByteWriter::new();
        let mut labels = Labels::new();
        let mut srcmap = SourceMapBuilder::new();
        let mut colors = FxHashMap::default();
        colors.insert(Temp::from_u32(0), 7u8);
        let inst = Inst::new(
            Op::MvImm { width: Width::B4 },
            [Arg::Tmp(Temp::from_u32(0)), Arg::Imm(Imm::Int(2))],
            Loc::unknown(),
        );
        let mut enc = Encoder::new(&mut code, &mut labels, &mut srcmap);
        enc.encode_inst("t", &inst, &colors).unwrap();
        assert_eq!(code.as_slice(), &[0x03, 7, 1, 2]);
    }
}
