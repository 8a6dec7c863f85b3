//! Function code generation: walking type-checked bodies into IR.
//!
//! One [`FuncLowering`] exists per function. It owns the IR list under
//! construction, the temporary counter, the source-location stack and the
//! loop-label stack, and borrows the build-wide accumulators (constant
//! pool, template segment, field interner, label namespace).
//!
//! Temporaries that read a named symbol are linked to it with a `tmp_*`
//! instruction; the allocator either coalesces the link away or turns it
//! into a register move. Temporaries holding intermediate results get a
//! `destroy_tmp` marker after their last use so their live range ends
//! there.

mod expr;

use crate::encode::Labels;
use crate::interner::FieldInterner;
use crate::ir::entities::{Label, Temp};
use crate::ir::inst::{Arg, Imm, Inst, Op, TmpKind};
use crate::ir::types::{NumTy, Width};
use crate::ir::CmpKind;
use crate::fx::FxHashSet;
use crate::result::{CodegenError, CodegenResult};
use crate::segments::{ConstantPool, GlobalTable, TemplateBuilder};
use crate::sema::ast::{
    BinaryOp, Expr, ExprKind, FuncDecl, FuncId, FuncKind, LValue, Pattern, Program, Stmt, StmtKind,
};
use crate::sema::types::{StructLayout, StructType, TypeData};
use crate::srcmap::Loc;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{EntityRef, SecondaryMap};

/// Build-wide state lowering borrows from the driver.
pub struct LowerCtx<'a> {
    /// The program being compiled.
    pub program: &'a Program,
    /// Field-name interner.
    pub interner: &'a mut FieldInterner,
    /// Constant pool segment.
    pub constants: &'a mut ConstantPool,
    /// Template segment.
    pub templates: &'a mut TemplateBuilder,
    /// Global slot table, fully registered before lowering starts.
    pub globals: &'a GlobalTable,
    /// Label namespace.
    pub labels: &'a mut Labels,
    /// Entry label of every function.
    pub func_labels: &'a SecondaryMap<FuncId, PackedOption<Label>>,
}

impl<'a> LowerCtx<'a> {
    /// The entry label of `func`.
    pub fn func_label(&self, func: FuncId) -> Label {
        self.func_labels[func].expect("every function has an entry label")
    }
}

/// Lower one function body to IR.
pub fn lower_func(ctx: &mut LowerCtx, func_id: FuncId) -> CodegenResult<Vec<Inst>> {
    let program = ctx.program;
    let func = &program.funcs[func_id];
    log::debug!("lowering `{}`", func.name);
    let mut lowering = FuncLowering {
        ctx,
        func,
        insts: Vec::new(),
        next_temp: 0,
        loc_stack: Vec::new(),
        loops: Vec::new(),
        pinned: FxHashSet::default(),
    };
    lowering.push_loc(func.loc.clone());
    lowering.emit(Op::FnEntry, []);
    for stmt in &func.body {
        lowering.stmt(stmt)?;
    }
    lowering.terminate();
    lowering.pop_loc();
    Ok(lowering.insts)
}

struct LoopLabels {
    head: Label,
    end: Label,
}

pub(crate) struct FuncLowering<'a, 'b> {
    pub(crate) ctx: &'a mut LowerCtx<'b>,
    pub(crate) func: &'a FuncDecl,
    insts: Vec<Inst>,
    next_temp: u32,
    loc_stack: Vec<Loc>,
    loops: Vec<LoopLabels>,
    /// Temporaries linked to an argument, local or upvalue; never destroyed.
    pinned: FxHashSet<Temp>,
}

impl<'a, 'b> FuncLowering<'a, 'b> {
    pub(crate) fn push_loc(&mut self, loc: Loc) {
        // Nodes without a real location inherit the enclosing one, so a
        // statement's location reaches the instructions of its
        // sub-expressions.
        if loc.is_unknown() {
            let top = self.loc();
            self.loc_stack.push(top);
        } else {
            self.loc_stack.push(loc);
        }
    }

    pub(crate) fn pop_loc(&mut self) {
        self.loc_stack.pop();
    }

    pub(crate) fn loc(&self) -> Loc {
        self.loc_stack.last().cloned().unwrap_or_default()
    }

    pub(crate) fn emit(&mut self, op: Op, args: impl IntoIterator<Item = Arg>) {
        let loc = self.loc();
        self.insts.push(Inst::new(op, args, loc));
    }

    pub(crate) fn temp(&mut self) -> Temp {
        let t = Temp::new(self.next_temp as usize);
        self.next_temp += 1;
        t
    }

    /// End the live range of an intermediate temporary. Temporaries linked
    /// to a named symbol keep living with the symbol.
    pub(crate) fn kill(&mut self, t: Temp) {
        if !self.pinned.contains(&t) {
            self.emit(Op::DestroyTmp, [Arg::Tmp(t)]);
        }
    }

    /// Mark `t` as aliasing a named symbol.
    pub(crate) fn pin(&mut self, t: Temp) {
        self.pinned.insert(t);
    }

    /// `(width, is_pointer)` of a type.
    pub(crate) fn class_of(&self, ty: crate::sema::types::TypeId) -> (Width, bool) {
        let types = &self.ctx.program.types;
        (types.size_of(ty), types.is_pointer(ty))
    }

    /// The numeric opcode family of a type, or a type error.
    pub(crate) fn num_ty_of(
        &self,
        ty: crate::sema::types::TypeId,
        loc: &Loc,
    ) -> CodegenResult<NumTy> {
        self.ctx.program.types.num_ty(ty).ok_or_else(|| {
            CodegenError::ty("operand of a numeric opcode family is not a scalar", loc)
        })
    }

    fn terminate(&mut self) {
        let falls_through = !matches!(
            self.insts.last().map(|inst| inst.op),
            Some(Op::FnRet) | Some(Op::CoroutineRet)
        );
        if falls_through {
            self.emit(self.ret_op(), []);
        }
    }

    fn ret_op(&self) -> Op {
        if self.func.kind == FuncKind::Coroutine {
            Op::CoroutineRet
        } else {
            Op::FnRet
        }
    }

    fn stmt(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        self.push_loc(stmt.loc.clone());
        let result = self.stmt_inner(stmt);
        self.pop_loc();
        result
    }

    fn stmt_inner(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        match &stmt.kind {
            StmtKind::Let { pattern, init } => self.lower_let(pattern, init),
            StmtKind::Assign { target, value } => self.lower_assign(target, value),
            StmtKind::Expr(expr) => {
                match &expr.kind {
                    // Calls in statement position may be void.
                    ExprKind::Call { callee, args } => {
                        if let Some(t) = self.lower_call(callee, args, &expr.loc)? {
                            self.kill(t);
                        }
                    }
                    ExprKind::MethodCall { recv, uid, args } => {
                        if let Some(t) = self.lower_method_call(recv, *uid, args, &expr.loc)? {
                            self.kill(t);
                        }
                    }
                    _ => {
                        let t = self.expr(expr)?;
                        self.kill(t);
                    }
                }
                Ok(())
            }
            StmtKind::If { cond, then, orelse } => self.lower_if(cond, then, orelse),
            StmtKind::While { cond, body } => self.lower_while(cond, body),
            StmtKind::Break => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.end)
                    .ok_or_else(|| CodegenError::resolution("`break` outside a loop", &self.loc()))?;
                self.emit(Op::J, [Arg::Label(target)]);
                Ok(())
            }
            StmtKind::Continue => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.head)
                    .ok_or_else(|| {
                        CodegenError::resolution("`continue` outside a loop", &self.loc())
                    })?;
                self.emit(Op::J, [Arg::Label(target)]);
                Ok(())
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    let t = self.expr(value)?;
                    let (width, ptr) = self.class_of(value.ty);
                    self.emit(Op::Ret { width, ptr }, [Arg::Tmp(t), Arg::Byte(0)]);
                    self.kill(t);
                }
                let op = self.ret_op();
                self.emit(op, []);
                Ok(())
            }
            StmtKind::Yield(value) => {
                if self.func.kind != FuncKind::Coroutine {
                    return Err(CodegenError::ty(
                        "`yield` outside a coroutine body",
                        &self.loc(),
                    ));
                }
                if let Some(value) = value {
                    let t = self.expr(value)?;
                    let (width, ptr) = self.class_of(value.ty);
                    self.emit(Op::Ret { width, ptr }, [Arg::Tmp(t), Arg::Byte(0)]);
                    self.kill(t);
                }
                self.emit(Op::CoroutineYield, []);
                Ok(())
            }
        }
    }

    fn block(&mut self, stmts: &[Stmt]) -> CodegenResult<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_if(&mut self, cond: &Expr, then: &[Stmt], orelse: &[Stmt]) -> CodegenResult<()> {
        let merge = self.ctx.labels.alloc();
        if orelse.is_empty() {
            self.branch_if_false(cond, merge)?;
            self.block(then)?;
            self.emit(Op::Label, [Arg::Label(merge)]);
        } else {
            let else_label = self.ctx.labels.alloc();
            self.branch_if_false(cond, else_label)?;
            self.block(then)?;
            self.emit(Op::J, [Arg::Label(merge)]);
            self.emit(Op::Label, [Arg::Label(else_label)]);
            self.block(orelse)?;
            self.emit(Op::Label, [Arg::Label(merge)]);
        }
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &[Stmt]) -> CodegenResult<()> {
        let head = self.ctx.labels.alloc();
        let end = self.ctx.labels.alloc();
        self.emit(Op::Label, [Arg::Label(head)]);
        self.branch_if_false(cond, end)?;
        self.loops.push(LoopLabels { head, end });
        let result = self.block(body);
        self.loops.pop();
        result?;
        self.emit(Op::J, [Arg::Label(head)]);
        self.emit(Op::Label, [Arg::Label(end)]);
        Ok(())
    }

    /// Branch to `target` when `cond` is false.
    ///
    /// Comparisons fuse directly into an inverted `j_cmp`; everything else
    /// materializes the boolean and compares it against zero.
    fn branch_if_false(&mut self, cond: &Expr, target: Label) -> CodegenResult<()> {
        if let ExprKind::Binary { op, lhs, rhs } = &cond.kind {
            if *op == BinaryOp::Ne && matches!(rhs.kind, ExprKind::Null) {
                // `x != null` is false exactly when x is null.
                let value = self.expr(lhs)?;
                let (width, ptr) = self.class_of(lhs.ty);
                self.emit(Op::JEqNull { width, ptr }, [Arg::Tmp(value), Arg::Label(target)]);
                self.kill(value);
                return Ok(());
            }
            if let Some(kind) = cmp_kind(*op) {
                if !matches!(rhs.kind, ExprKind::Null) && !matches!(lhs.kind, ExprKind::Null) {
                    let a = self.expr(lhs)?;
                    let b = self.expr(rhs)?;
                    let ty = self.num_ty_of(lhs.ty, &cond.loc)?;
                    self.emit(
                        Op::JCmp { ty },
                        [
                            Arg::Tmp(a),
                            Arg::Tmp(b),
                            Arg::Byte(kind.inverse() as u8),
                            Arg::Label(target),
                        ],
                    );
                    self.kill(a);
                    self.kill(b);
                    return Ok(());
                }
            }
        }
        let value = self.expr(cond)?;
        let zero = self.temp();
        self.emit(Op::MvImm { width: Width::B1 }, [Arg::Tmp(zero), Arg::Imm(Imm::Uint(0))]);
        self.emit(
            Op::JCmp { ty: NumTy::U8 },
            [
                Arg::Tmp(value),
                Arg::Tmp(zero),
                Arg::Byte(CmpKind::Eq as u8),
                Arg::Label(target),
            ],
        );
        self.kill(value);
        self.kill(zero);
        Ok(())
    }

    fn lower_let(&mut self, pattern: &Pattern, init: &Expr) -> CodegenResult<()> {
        match pattern {
            Pattern::Name(local) => {
                let t = self.expr(init)?;
                let (width, ptr) = self.class_of(init.ty);
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Local },
                    [Arg::Tmp(t), Arg::Uid(local.index() as u32)],
                );
                self.pin(t);
                Ok(())
            }
            Pattern::Struct { bindings, rest } => self.lower_deconstruction(bindings, *rest, init),
        }
    }

    fn lower_deconstruction(
        &mut self,
        bindings: &[(String, crate::sema::ast::LocalId)],
        rest: Option<crate::sema::ast::LocalId>,
        init: &Expr,
    ) -> CodegenResult<()> {
        let source = self.expr(init)?;
        let types = &self.ctx.program.types;
        let strukt = match types.get(types.resolve(init.ty)) {
            TypeData::Struct(s) => s.clone(),
            _ => {
                return Err(CodegenError::ty(
                    "deconstruction requires a struct value",
                    &init.loc,
                ))
            }
        };
        let layout = StructLayout::compute(&self.ctx.program.types, self.ctx.interner, &strukt);

        let mut visited: Vec<&str> = Vec::new();
        for (name, local) in bindings {
            let field = layout.field(name).ok_or_else(|| {
                CodegenError::resolution(
                    format!("struct has no field named `{name}`"),
                    &self.loc(),
                )
            })?;
            let t = self.temp();
            self.emit(
                Op::SLoadF { width: field.width, ptr: field.is_ptr },
                [Arg::Tmp(t), Arg::Tmp(source), Arg::Uid(field.field_id)],
            );
            self.emit(
                Op::Tmp { width: field.width, ptr: field.is_ptr, kind: TmpKind::Local },
                [Arg::Tmp(t), Arg::Uid(local.index() as u32)],
            );
            self.pin(t);
            visited.push(name);
        }

        if let Some(rest_local) = rest {
            let remaining: Vec<_> = strukt
                .fields
                .iter()
                .filter(|f| !visited.contains(&f.name.as_str()))
                .cloned()
                .collect();
            if remaining.is_empty() {
                return Err(CodegenError::resolution(
                    "All fields of the struct have been deconstructed",
                    &self.loc(),
                ));
            }
            // The rest binding gets a synthesized struct of the unvisited
            // fields. No template exists for it, so it goes through the
            // registration path.
            let rest_ty = StructType { fields: remaining };
            let rest_layout =
                StructLayout::compute(&self.ctx.program.types, self.ctx.interner, &rest_ty);
            let rest_t = self.temp();
            self.emit(
                Op::SAlloc,
                [
                    Arg::Tmp(rest_t),
                    Arg::Byte(rest_layout.fields.len() as u8),
                    Arg::Uid(u32::from(rest_layout.total_size)),
                ],
            );
            for (index, field) in rest_layout.fields.iter().enumerate() {
                self.emit(
                    Op::SRegField,
                    [
                        Arg::Tmp(rest_t),
                        Arg::Byte(index as u8),
                        Arg::Uid(field.field_id),
                        Arg::Uid(u32::from(field.offset)),
                        Arg::Byte(field.is_ptr as u8),
                    ],
                );
            }
            for field in &rest_layout.fields {
                let t = self.temp();
                self.emit(
                    Op::SLoadF { width: field.width, ptr: field.is_ptr },
                    [Arg::Tmp(t), Arg::Tmp(source), Arg::Uid(field.field_id)],
                );
                self.emit(
                    Op::SStoreF { width: field.width, ptr: field.is_ptr },
                    [Arg::Tmp(rest_t), Arg::Uid(field.field_id), Arg::Tmp(t)],
                );
                self.kill(t);
            }
            self.emit(
                Op::Tmp { width: Width::B8, ptr: true, kind: TmpKind::Local },
                [Arg::Tmp(rest_t), Arg::Uid(rest_local.index() as u32)],
            );
            self.pin(rest_t);
        }

        self.kill(source);
        Ok(())
    }

    fn lower_assign(&mut self, target: &LValue, value: &Expr) -> CodegenResult<()> {
        match target {
            LValue::Local(local) => {
                let t = self.expr(value)?;
                let (width, ptr) = self.class_of(value.ty);
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Local },
                    [Arg::Tmp(t), Arg::Uid(local.index() as u32)],
                );
                self.pin(t);
                Ok(())
            }
            LValue::Arg(index) => {
                let t = self.expr(value)?;
                let (width, ptr) = self.class_of(value.ty);
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Arg },
                    [Arg::Tmp(t), Arg::Byte(*index as u8)],
                );
                self.pin(t);
                Ok(())
            }
            LValue::Upvalue(index) => {
                let t = self.expr(value)?;
                let (width, ptr) = self.class_of(value.ty);
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Upvalue },
                    [Arg::Tmp(t), Arg::Byte(*index as u8)],
                );
                self.pin(t);
                Ok(())
            }
            LValue::Global(uid) => {
                let t = self.expr(value)?;
                let offset = self.ctx.globals.offset_of(*uid).ok_or_else(|| {
                    CodegenError::resolution(
                        format!("assignment to unregistered global uid {uid}"),
                        &self.loc(),
                    )
                })?;
                let (width, ptr) = self.class_of(value.ty);
                self.emit(Op::SetGlobal { width, ptr }, [Arg::Uid(offset), Arg::Tmp(t)]);
                self.kill(t);
                Ok(())
            }
            LValue::Field { base, field } => {
                let obj = self.expr(base)?;
                let t = self.expr(value)?;
                if let Some(strukt) = self.struct_ty(base.ty) {
                    let layout =
                        StructLayout::compute(&self.ctx.program.types, self.ctx.interner, &strukt);
                    let f = layout.field(field).ok_or_else(|| {
                        CodegenError::resolution(
                            format!("struct has no field named `{field}`"),
                            &self.loc(),
                        )
                    })?;
                    self.emit(
                        Op::SStoreF { width: f.width, ptr: f.is_ptr },
                        [Arg::Tmp(obj), Arg::Uid(f.field_id), Arg::Tmp(t)],
                    );
                } else {
                    let class = self.class_ty(base.ty, &self.loc())?;
                    let (offset, is_ptr, width) = self.class_attr(&class, field)?;
                    self.emit(
                        Op::CStoreF { width, ptr: is_ptr },
                        [Arg::Tmp(obj), Arg::Uid(u32::from(offset)), Arg::Tmp(t)],
                    );
                }
                self.kill(obj);
                self.kill(t);
                Ok(())
            }
            LValue::Index { base, index } => {
                let arr = self.expr(base)?;
                let idx = self.expr(index)?;
                let t = self.expr(value)?;
                let (width, ptr) = self.class_of(value.ty);
                self.emit(
                    Op::ASetIndex { width, ptr },
                    [Arg::Tmp(arr), Arg::Tmp(idx), Arg::Tmp(t)],
                );
                self.kill(arr);
                self.kill(idx);
                self.kill(t);
                Ok(())
            }
        }
    }
}

pub(crate) fn cmp_kind(op: BinaryOp) -> Option<CmpKind> {
    match op {
        BinaryOp::Eq => Some(CmpKind::Eq),
        BinaryOp::Ne => Some(CmpKind::Ne),
        BinaryOp::Lt => Some(CmpKind::Lt),
        BinaryOp::Le => Some(CmpKind::Le),
        BinaryOp::Gt => Some(CmpKind::Gt),
        BinaryOp::Ge => Some(CmpKind::Ge),
        _ => None,
    }
}
