//! Expression lowering.

use crate::ir::entities::Temp;
use crate::ir::inst::{AluOp, Arg, Imm, Op, TmpKind};
use crate::ir::types::{NumTy, Width};
use crate::ir::CmpKind;
use crate::lower::{cmp_kind, FuncLowering};
use crate::result::{CodegenError, CodegenResult};
use crate::sema::ast::{
    BinaryOp, Callee, Capture, CoroutineSource, Expr, ExprKind, Literal, UnaryOp,
};
use crate::sema::types::{ClassLayout, ClassType, StructLayout, StructType, TypeData, TypeId};
use crate::srcmap::Loc;
use cranelift_entity::EntityRef;

impl<'a, 'b> FuncLowering<'a, 'b> {
    /// Lower an expression, returning the temporary holding its value.
    pub(crate) fn expr(&mut self, expr: &Expr) -> CodegenResult<Temp> {
        self.push_loc(expr.loc.clone());
        let result = self.expr_inner(expr);
        self.pop_loc();
        result
    }

    fn expr_inner(&mut self, expr: &Expr) -> CodegenResult<Temp> {
        match &expr.kind {
            ExprKind::Literal(lit) => self.lower_literal(lit, expr),
            ExprKind::Null => {
                let (width, _) = self.class_of(expr.ty);
                let t = self.temp();
                self.emit(Op::MvImm { width }, [Arg::Tmp(t), Arg::Imm(Imm::Uint(0))]);
                Ok(t)
            }
            ExprKind::EnumMember { index } => {
                let types = &self.ctx.program.types;
                let resolved = types.resolve(expr.ty);
                let (value, width) = match types.get(resolved) {
                    TypeData::Enum(e) => {
                        let values = e.resolve_values()?;
                        let value = *values.get(*index as usize).ok_or_else(|| {
                            CodegenError::resolution(
                                format!("enum has no field at index {index}"),
                                &expr.loc,
                            )
                        })?;
                        (value, e.backing_width())
                    }
                    _ => {
                        return Err(CodegenError::ty(
                            "enum member access on a non-enum type",
                            &expr.loc,
                        ))
                    }
                };
                let t = self.temp();
                self.emit(Op::MvImm { width }, [Arg::Tmp(t), Arg::Imm(Imm::Uint(value))]);
                Ok(t)
            }
            ExprKind::Arg(index) => {
                let (width, ptr) = self.class_of(expr.ty);
                let t = self.temp();
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Arg },
                    [Arg::Tmp(t), Arg::Byte(*index as u8)],
                );
                self.pin(t);
                Ok(t)
            }
            ExprKind::Local(local) => {
                let (width, ptr) = self.class_of(expr.ty);
                let t = self.temp();
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Local },
                    [Arg::Tmp(t), Arg::Uid(local.index() as u32)],
                );
                self.pin(t);
                Ok(t)
            }
            ExprKind::Upvalue(index) => {
                let (width, ptr) = self.class_of(expr.ty);
                let t = self.temp();
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Upvalue },
                    [Arg::Tmp(t), Arg::Byte(*index as u8)],
                );
                self.pin(t);
                Ok(t)
            }
            ExprKind::Global(uid) => {
                let offset = self.ctx.globals.offset_of(*uid).ok_or_else(|| {
                    CodegenError::resolution(
                        format!("read of unregistered global uid {uid}"),
                        &expr.loc,
                    )
                })?;
                let (width, ptr) = self.class_of(expr.ty);
                let t = self.temp();
                self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Global },
                    [Arg::Tmp(t), Arg::Uid(offset)],
                );
                Ok(t)
            }
            ExprKind::FuncRef(func) => {
                let (width, _) = self.class_of(expr.ty);
                if width != Width::B8 {
                    // A code address never fits a narrow register.
                    return Err(CodegenError::ty(
                        "function address loaded into a narrow register",
                        &expr.loc,
                    ));
                }
                let label = self.ctx.func_label(*func);
                let t = self.temp();
                self.emit(
                    Op::Tmp { width: Width::B8, ptr: true, kind: TmpKind::Func },
                    [Arg::Tmp(t), Arg::Label(label)],
                );
                Ok(t)
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(expr, *op, lhs, rhs),
            ExprKind::Unary { op, operand } => self.lower_unary(expr, *op, operand),
            ExprKind::Call { callee, args } => {
                self.lower_call(callee, args, &expr.loc)?.ok_or_else(|| {
                    CodegenError::ty("void call used as a value", &expr.loc)
                })
            }
            ExprKind::MethodCall { recv, uid, args } => self
                .lower_method_call(recv, *uid, args, &expr.loc)?
                .ok_or_else(|| CodegenError::ty("void method call used as a value", &expr.loc)),
            ExprKind::Field { base, field } => self.lower_field_read(expr, base, field),
            ExprKind::Index { base, index } => {
                let arr = self.expr(base)?;
                let idx = self.expr(index)?;
                let (width, ptr) = self.class_of(expr.ty);
                let t = self.temp();
                self.emit(
                    Op::AGetIndex { width, ptr },
                    [Arg::Tmp(t), Arg::Tmp(arr), Arg::Tmp(idx)],
                );
                self.kill(arr);
                self.kill(idx);
                Ok(t)
            }
            ExprKind::Len(base) => {
                let arr = self.expr(base)?;
                let t = self.temp();
                self.emit(Op::ALen, [Arg::Tmp(t), Arg::Tmp(arr)]);
                self.kill(arr);
                Ok(t)
            }
            ExprKind::StructLit { fields } => self.lower_struct_lit(expr, fields),
            ExprKind::NewClass => {
                let class = self.class_ty(expr.ty, &expr.loc)?;
                let template = self.ctx.templates.class_template(
                    &self.ctx.program.types,
                    self.ctx.program.types.resolve(expr.ty),
                    &class,
                    self.ctx.func_labels,
                )?;
                let t = self.temp();
                self.emit(Op::CAllocT, [Arg::Tmp(t), Arg::Uid(template)]);
                Ok(t)
            }
            ExprKind::ArrayLit { elems } => self.lower_array_lit(expr, elems),
            ExprKind::ClosureLit { func, captures } => self.lower_closure(*func, captures),
            ExprKind::NewCoroutine(source) => {
                let t = self.temp();
                match source {
                    CoroutineSource::Direct(func) => {
                        let label = self.ctx.func_label(*func);
                        self.emit(Op::CoroutineAlloc, [Arg::Tmp(t), Arg::Label(label)]);
                    }
                    CoroutineSource::Value(value) => {
                        let v = self.expr(value)?;
                        self.emit(Op::CoroutineFnAlloc, [Arg::Tmp(t), Arg::Tmp(v)]);
                        self.kill(v);
                    }
                }
                Ok(t)
            }
            ExprKind::CoroutineState(coro) => {
                let c = self.expr(coro)?;
                let t = self.temp();
                self.emit(Op::CoroutineGetState, [Arg::Tmp(t), Arg::Tmp(c)]);
                self.kill(c);
                Ok(t)
            }
            ExprKind::Cast(value) => self.lower_cast(expr, value),
            ExprKind::Is { value, class } => {
                let v = self.expr(value)?;
                let class = self.class_ty(*class, &expr.loc)?;
                let t = self.temp();
                self.emit(Op::IIsC, [Arg::Tmp(t), Arg::Tmp(v), Arg::Uid(class.id)]);
                self.kill(v);
                Ok(t)
            }
            ExprKind::HasMethod { value, uid } => {
                let v = self.expr(value)?;
                let t = self.temp();
                self.emit(Op::IHasM, [Arg::Tmp(t), Arg::Tmp(v), Arg::Uid(*uid)]);
                self.kill(v);
                Ok(t)
            }
        }
    }

    fn lower_literal(&mut self, lit: &Literal, expr: &Expr) -> CodegenResult<Temp> {
        let t = self.temp();
        match lit {
            Literal::Int(value) => {
                let (width, _) = self.class_of(expr.ty);
                self.emit(Op::MvImm { width }, [Arg::Tmp(t), Arg::Imm(Imm::Int(*value))]);
            }
            Literal::Bool(value) => {
                self.emit(
                    Op::MvImm { width: Width::B1 },
                    [Arg::Tmp(t), Arg::Imm(Imm::Uint(u64::from(*value)))],
                );
            }
            Literal::Float(value) => {
                // Float constants are hoisted into the pool as their bit
                // patterns.
                let (width, _) = self.class_of(expr.ty);
                let offset = match width {
                    Width::B4 => self.ctx.constants.push_f32(*value as f32),
                    _ => self.ctx.constants.push_f64(*value),
                };
                self.emit(
                    Op::MvConst { width, ptr: false },
                    [Arg::Tmp(t), Arg::Uid(offset)],
                );
            }
            Literal::Str(value) => {
                // Strings are UTF-8 byte arrays: allocate, then fill
                // element-wise from the constant pool.
                let bytes = value.as_bytes();
                let base = self.ctx.constants.push_bytes(bytes);
                self.emit(
                    Op::AAlloc,
                    [
                        Arg::Tmp(t),
                        Arg::Byte(0),
                        Arg::Imm(Imm::Uint(bytes.len() as u64)),
                        Arg::Byte(1),
                    ],
                );
                for index in 0..bytes.len() as u32 {
                    self.emit(
                        Op::AStoreFConst { width: Width::B1 },
                        [Arg::Tmp(t), Arg::Uid(index), Arg::Uid(base + index)],
                    );
                }
            }
        }
        Ok(t)
    }

    fn lower_binary(
        &mut self,
        expr: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<Temp> {
        if let Some(kind) = cmp_kind(op) {
            return self.lower_comparison(expr, kind, lhs, rhs);
        }
        let alu = match op {
            BinaryOp::Add => AluOp::Add,
            BinaryOp::Sub => AluOp::Sub,
            BinaryOp::Mul => AluOp::Mul,
            BinaryOp::Div => AluOp::Div,
            BinaryOp::Mod => AluOp::Mod,
            BinaryOp::BitAnd => AluOp::BAnd,
            BinaryOp::BitOr => AluOp::BOr,
            BinaryOp::BitXor => AluOp::BXor,
            BinaryOp::Shl => AluOp::Shl,
            BinaryOp::Shr => AluOp::Shr,
            BinaryOp::And => AluOp::And,
            BinaryOp::Or => AluOp::Or,
            _ => unreachable!("comparisons handled above"),
        };
        let ty = match alu {
            AluOp::And | AluOp::Or => NumTy::U8,
            _ => self.num_ty_of(expr.ty, &expr.loc)?,
        };
        if ty.is_float()
            && matches!(alu, AluOp::BAnd | AluOp::BOr | AluOp::BXor | AluOp::Shl | AluOp::Shr)
        {
            return Err(CodegenError::ty(
                "bitwise and shift operations reject floats",
                &expr.loc,
            ));
        }
        let a = self.expr(lhs)?;
        let b = self.expr(rhs)?;
        let t = self.temp();
        self.emit(Op::Bin { op: alu, ty }, [Arg::Tmp(t), Arg::Tmp(a), Arg::Tmp(b)]);
        self.kill(a);
        self.kill(b);
        Ok(t)
    }

    /// Materialize a comparison as a boolean: set the result to 1, jump
    /// over the clear when the comparison holds.
    fn lower_comparison(
        &mut self,
        expr: &Expr,
        kind: CmpKind,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<Temp> {
        // Null tests use the dedicated null-jump family.
        let null_operand = match (&lhs.kind, &rhs.kind) {
            (_, ExprKind::Null) => Some(lhs),
            (ExprKind::Null, _) => Some(rhs),
            _ => None,
        };
        if let Some(operand) = null_operand {
            if kind != CmpKind::Eq && kind != CmpKind::Ne {
                return Err(CodegenError::ty("null only compares for equality", &expr.loc));
            }
            let v = self.expr(operand)?;
            let (width, ptr) = self.class_of(operand.ty);
            let t = self.temp();
            let done = self.ctx.labels.alloc();
            let (on_null, otherwise) = if kind == CmpKind::Eq { (1, 0) } else { (0, 1) };
            self.emit(
                Op::MvImm { width: Width::B1 },
                [Arg::Tmp(t), Arg::Imm(Imm::Uint(on_null))],
            );
            self.emit(Op::JEqNull { width, ptr }, [Arg::Tmp(v), Arg::Label(done)]);
            self.emit(
                Op::MvImm { width: Width::B1 },
                [Arg::Tmp(t), Arg::Imm(Imm::Uint(otherwise))],
            );
            self.emit(Op::Label, [Arg::Label(done)]);
            self.kill(v);
            return Ok(t);
        }

        let a = self.expr(lhs)?;
        let b = self.expr(rhs)?;
        let ty = self.num_ty_of(lhs.ty, &expr.loc)?;
        let t = self.temp();
        let done = self.ctx.labels.alloc();
        self.emit(Op::MvImm { width: Width::B1 }, [Arg::Tmp(t), Arg::Imm(Imm::Uint(1))]);
        self.emit(
            Op::JCmp { ty },
            [Arg::Tmp(a), Arg::Tmp(b), Arg::Byte(kind as u8), Arg::Label(done)],
        );
        self.emit(Op::MvImm { width: Width::B1 }, [Arg::Tmp(t), Arg::Imm(Imm::Uint(0))]);
        self.emit(Op::Label, [Arg::Label(done)]);
        self.kill(a);
        self.kill(b);
        Ok(t)
    }

    fn lower_unary(&mut self, expr: &Expr, op: UnaryOp, operand: &Expr) -> CodegenResult<Temp> {
        match op {
            UnaryOp::Not => {
                let v = self.expr(operand)?;
                let t = self.temp();
                self.emit(Op::Not, [Arg::Tmp(t), Arg::Tmp(v)]);
                self.kill(v);
                Ok(t)
            }
            UnaryOp::BitNot => {
                let ty = self.num_ty_of(expr.ty, &expr.loc)?;
                if ty.is_float() {
                    return Err(CodegenError::ty("bitwise complement rejects floats", &expr.loc));
                }
                let v = self.expr(operand)?;
                let t = self.temp();
                self.emit(Op::BNot { width: ty.width() }, [Arg::Tmp(t), Arg::Tmp(v)]);
                self.kill(v);
                Ok(t)
            }
            UnaryOp::Neg => {
                // No dedicated negate: subtract from zero.
                let ty = self.num_ty_of(expr.ty, &expr.loc)?;
                let zero = self.temp();
                self.emit(
                    Op::MvImm { width: ty.width() },
                    [Arg::Tmp(zero), Arg::Imm(Imm::Uint(0))],
                );
                let v = self.expr(operand)?;
                let t = self.temp();
                self.emit(
                    Op::Bin { op: AluOp::Sub, ty },
                    [Arg::Tmp(t), Arg::Tmp(zero), Arg::Tmp(v)],
                );
                self.kill(zero);
                self.kill(v);
                Ok(t)
            }
        }
    }

    /// Lower a call: evaluate arguments, open a callee frame, pass the
    /// arguments, dispatch, then fetch the return register if the callee
    /// produces a value.
    pub(crate) fn lower_call(
        &mut self,
        callee: &Callee,
        args: &[Expr],
        loc: &Loc,
    ) -> CodegenResult<Option<Temp>> {
        let mut arg_temps = Vec::with_capacity(args.len());
        for arg in args {
            let t = self.expr(arg)?;
            arg_temps.push((t, self.class_of(arg.ty)));
        }
        let ret = match callee {
            Callee::Direct(func) => {
                let decl = &self.ctx.program.funcs[*func];
                let ret = decl.ret;
                self.emit(Op::FnAlloc, []);
                self.pass_args(&arg_temps, 0);
                let label = self.ctx.func_label(*func);
                self.emit(Op::CallLabel, [Arg::Label(label)]);
                ret
            }
            Callee::Value(value) => {
                let types = &self.ctx.program.types;
                let (ret, dispatch) = match types.get(types.resolve(value.ty)) {
                    TypeData::Func(sig) => (sig.ret, Op::CallPtr),
                    TypeData::Closure(sig) => (sig.ret, Op::ClosureCall),
                    TypeData::Coroutine(sig) => (sig.ret, Op::CoroutineCall),
                    _ => return Err(CodegenError::ty("call through a non-callable value", loc)),
                };
                let v = self.expr(value)?;
                self.emit(Op::FnAlloc, []);
                self.pass_args(&arg_temps, 0);
                self.emit(dispatch, [Arg::Tmp(v)]);
                self.kill(v);
                ret
            }
        };
        for (t, _) in &arg_temps {
            self.kill(*t);
        }
        Ok(self.fetch_return(ret))
    }

    /// Lower a method call: fetch the method address by UID, pass the
    /// receiver in slot 0, then dispatch through the address.
    pub(crate) fn lower_method_call(
        &mut self,
        recv: &Expr,
        uid: u32,
        args: &[Expr],
        loc: &Loc,
    ) -> CodegenResult<Option<Temp>> {
        let ret = self.method_ret(recv.ty, uid, loc)?;
        let obj = self.expr(recv)?;
        let method = self.temp();
        self.emit(Op::CLoadM, [Arg::Tmp(method), Arg::Tmp(obj), Arg::Uid(uid)]);
        let mut arg_temps = Vec::with_capacity(args.len());
        for arg in args {
            let t = self.expr(arg)?;
            arg_temps.push((t, self.class_of(arg.ty)));
        }
        self.emit(Op::FnAlloc, []);
        self.emit(
            Op::FnSetReg { width: Width::B8, ptr: true },
            [Arg::Byte(0), Arg::Tmp(obj)],
        );
        self.pass_args(&arg_temps, 1);
        self.emit(Op::CallPtr, [Arg::Tmp(method)]);
        self.kill(method);
        self.kill(obj);
        for (t, _) in &arg_temps {
            self.kill(*t);
        }
        Ok(self.fetch_return(ret))
    }

    fn pass_args(&mut self, arg_temps: &[(Temp, (Width, bool))], first_slot: u8) {
        for (index, (t, (width, ptr))) in arg_temps.iter().enumerate() {
            self.emit(
                Op::FnSetReg { width: *width, ptr: *ptr },
                [Arg::Byte(first_slot + index as u8), Arg::Tmp(*t)],
            );
        }
    }

    /// Emit the return-register fetch that follows every value-producing
    /// call.
    fn fetch_return(&mut self, ret: Option<TypeId>) -> Option<Temp> {
        let ret = ret?;
        let (width, ptr) = self.class_of(ret);
        let t = self.temp();
        if ptr {
            self.emit(
                Op::FnGetRet { ptr: true },
                [Arg::Tmp(t), Arg::Reg(crate::isa::RET_REG)],
            );
        } else {
            self.emit(
                Op::FnGetRet { ptr: false },
                [
                    Arg::Tmp(t),
                    Arg::Reg(crate::isa::RET_REG),
                    Arg::Byte(width.bytes()),
                ],
            );
        }
        Some(t)
    }

    fn method_ret(&self, recv: TypeId, uid: u32, loc: &Loc) -> CodegenResult<Option<TypeId>> {
        let types = &self.ctx.program.types;
        match types.get(types.resolve(recv)) {
            TypeData::Class(class) => {
                let method = class.methods.iter().find(|m| m.uid == uid).ok_or_else(|| {
                    CodegenError::resolution(format!("class has no method with uid {uid}"), loc)
                })?;
                Ok(self.ctx.program.funcs[method.func].ret)
            }
            TypeData::Interface(iface) => {
                let method = iface.methods.iter().find(|m| m.uid == uid).ok_or_else(|| {
                    CodegenError::resolution(
                        format!("interface has no method with uid {uid}"),
                        loc,
                    )
                })?;
                Ok(method.ret)
            }
            _ => Err(CodegenError::ty(
                "method call on a value that is neither class nor interface",
                loc,
            )),
        }
    }

    fn lower_field_read(&mut self, expr: &Expr, base: &Expr, field: &str) -> CodegenResult<Temp> {
        let base_ty = base.ty;
        if let Some(strukt) = self.struct_ty(base_ty) {
            let obj = self.expr(base)?;
            let layout = StructLayout::compute(&self.ctx.program.types, self.ctx.interner, &strukt);
            let f = layout.field(field).ok_or_else(|| {
                CodegenError::resolution(
                    format!("struct has no field named `{field}`"),
                    &expr.loc,
                )
            })?;
            let t = self.temp();
            self.emit(
                Op::SLoadF { width: f.width, ptr: f.is_ptr },
                [Arg::Tmp(t), Arg::Tmp(obj), Arg::Uid(f.field_id)],
            );
            self.kill(obj);
            return Ok(t);
        }
        let class = self.class_ty(base_ty, &expr.loc)?;
        let obj = self.expr(base)?;
        let (offset, is_ptr, width) = self.class_attr(&class, field)?;
        let t = self.temp();
        self.emit(
            Op::CLoadF { width, ptr: is_ptr },
            [Arg::Tmp(t), Arg::Tmp(obj), Arg::Uid(u32::from(offset))],
        );
        self.kill(obj);
        Ok(t)
    }

    fn lower_struct_lit(&mut self, expr: &Expr, fields: &[(String, Expr)]) -> CodegenResult<Temp> {
        let resolved = self.ctx.program.types.resolve(expr.ty);
        let strukt = self.struct_ty(expr.ty).ok_or_else(|| {
            CodegenError::ty("struct literal of a non-struct type", &expr.loc)
        })?;
        let template = self.ctx.templates.struct_template(
            &self.ctx.program.types,
            self.ctx.interner,
            resolved,
            &strukt,
        )?;
        let t = self.temp();
        self.emit(Op::SAllocT, [Arg::Tmp(t), Arg::Uid(template)]);
        let layout = StructLayout::compute(&self.ctx.program.types, self.ctx.interner, &strukt);
        for (name, value) in fields {
            let f = layout.field(name).ok_or_else(|| {
                CodegenError::resolution(
                    format!("struct has no field named `{name}`"),
                    &value.loc,
                )
            })?;
            let (field_id, width, is_ptr) = (f.field_id, f.width, f.is_ptr);
            let v = self.expr(value)?;
            self.emit(
                Op::SStoreF { width, ptr: is_ptr },
                [Arg::Tmp(t), Arg::Uid(field_id), Arg::Tmp(v)],
            );
            self.kill(v);
        }
        Ok(t)
    }

    fn lower_array_lit(&mut self, expr: &Expr, elems: &[Expr]) -> CodegenResult<Temp> {
        let types = &self.ctx.program.types;
        let elem_ty = match types.get(types.resolve(expr.ty)) {
            TypeData::Array { elem } => *elem,
            _ => return Err(CodegenError::ty("array literal of a non-array type", &expr.loc)),
        };
        let (width, ptr) = self.class_of(elem_ty);
        let t = self.temp();
        self.emit(
            Op::AAlloc,
            [
                Arg::Tmp(t),
                Arg::Byte(ptr as u8),
                Arg::Imm(Imm::Uint(elems.len() as u64)),
                Arg::Byte(width.bytes()),
            ],
        );
        for (index, elem) in elems.iter().enumerate() {
            let idx = self.temp();
            self.emit(
                Op::MvImm { width: Width::B8 },
                [Arg::Tmp(idx), Arg::Imm(Imm::Uint(index as u64))],
            );
            let v = self.expr(elem)?;
            self.emit(
                Op::ASetIndex { width, ptr },
                [Arg::Tmp(t), Arg::Tmp(idx), Arg::Tmp(v)],
            );
            self.kill(idx);
            self.kill(v);
        }
        Ok(t)
    }

    fn lower_closure(
        &mut self,
        func: crate::sema::ast::FuncId,
        captures: &[Capture],
    ) -> CodegenResult<Temp> {
        let label = self.ctx.func_label(func);
        let upvalue_types: Vec<TypeId> = self.ctx.program.funcs[func].upvalues.clone();
        let t = self.temp();
        self.emit(
            Op::ClosureAlloc,
            [Arg::Tmp(t), Arg::Label(label), Arg::Byte(captures.len() as u8)],
        );
        // Environment entries are pushed in capture-analysis order, which
        // is the order the body's upvalue indices expect.
        for (capture, ty) in captures.iter().zip(&upvalue_types) {
            let (width, ptr) = self.class_of(*ty);
            let c = self.temp();
            match capture {
                Capture::Local(local) => self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Local },
                    [Arg::Tmp(c), Arg::Uid(local.index() as u32)],
                ),
                Capture::Arg(index) => self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Arg },
                    [Arg::Tmp(c), Arg::Byte(*index as u8)],
                ),
                Capture::Upvalue(index) => self.emit(
                    Op::Tmp { width, ptr, kind: TmpKind::Upvalue },
                    [Arg::Tmp(c), Arg::Byte(*index as u8)],
                ),
            }
            self.pin(c);
            self.emit(
                Op::ClosurePushEnv { width, ptr },
                [Arg::Tmp(t), Arg::Tmp(c)],
            );
        }
        Ok(t)
    }

    fn lower_cast(&mut self, expr: &Expr, value: &Expr) -> CodegenResult<Temp> {
        let from = self.num_ty_of(value.ty, &value.loc)?;
        let to = self.num_ty_of(expr.ty, &expr.loc)?;
        let v = self.expr(value)?;
        if from == to {
            return Ok(v);
        }
        // The value is conceptually re-typed, so it must not alias the
        // source: force a fresh live range.
        let t = self.temp();
        self.emit(
            Op::Tmp { width: from.width().max(to.width()), ptr: false, kind: TmpKind::RegCopy },
            [Arg::Tmp(t), Arg::Tmp(v)],
        );
        self.kill(v);
        if from.width() == to.width() {
            self.emit(Op::Cast { from, to }, [Arg::Tmp(t)]);
        } else if from.family() == to.family() {
            let op = if from.width() < to.width() {
                Op::Upcast { family: from.family(), from: from.width(), to: to.width() }
            } else {
                Op::Dcast { family: from.family(), from: from.width(), to: to.width() }
            };
            self.emit(op, [Arg::Tmp(t)]);
        } else {
            return Err(CodegenError::ty(
                format!("no conversion from {from} to {to}"),
                &expr.loc,
            ));
        }
        Ok(t)
    }

    /// A cloned struct payload, if `ty` resolves to a struct.
    pub(crate) fn struct_ty(&self, ty: TypeId) -> Option<StructType> {
        let types = &self.ctx.program.types;
        match types.get(types.resolve(ty)) {
            TypeData::Struct(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// A cloned class payload, or a type error.
    pub(crate) fn class_ty(&self, ty: TypeId, loc: &Loc) -> CodegenResult<ClassType> {
        let types = &self.ctx.program.types;
        match types.get(types.resolve(ty)) {
            TypeData::Class(c) => Ok(c.clone()),
            _ => Err(CodegenError::ty("expected a class type", loc)),
        }
    }

    /// `(offset, is_ptr, width)` of a class attribute by name.
    pub(crate) fn class_attr(
        &self,
        class: &ClassType,
        name: &str,
    ) -> CodegenResult<(u16, bool, Width)> {
        let index = class
            .attributes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| {
                CodegenError::resolution(
                    format!("class has no attribute named `{name}`"),
                    &self.loc(),
                )
            })?;
        let layout = ClassLayout::compute(&self.ctx.program.types, class);
        Ok(layout.attributes[index])
    }
}
