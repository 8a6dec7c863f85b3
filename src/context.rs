//! Compilation context and main entry point.
//!
//! A [`Context`] owns everything that accumulates across the functions of
//! one compilation: the field-name interner, the four non-code segments,
//! the label namespace, the code writer and the source map. `compile`
//! drives the pipeline: lower, allocate and encode each function, then
//! link and assemble. It consumes the context, since the accumulated
//! segments are only meaningful for one image.

use crate::encode::{EncOp, Encoder, Labels};
use crate::image::{assemble, Image};
use crate::interner::FieldInterner;
use crate::ir::entities::Label;
use crate::isa::{ret_reg, Opcode, RET_REG};
use crate::lower::{lower_func, LowerCtx};
use crate::regalloc;
use crate::result::{CodegenError, CodegenResult};
use crate::segments::{render_object_keys, ConstantPool, GlobalTable, TemplateBuilder};
use crate::sema::ast::{FuncId, FuncKind, Program};
use crate::srcmap::{Loc, SourceMapBuilder};
use crate::writer::ByteWriter;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

/// Per-compilation state and the pipeline driver.
pub struct Context {
    interner: FieldInterner,
    constants: ConstantPool,
    globals: GlobalTable,
    templates: TemplateBuilder,
    labels: Labels,
    code: ByteWriter,
    srcmap: SourceMapBuilder,
    regalloc: regalloc::Context,
}

impl Context {
    /// Create a context for one compilation.
    pub fn new() -> Self {
        Self {
            interner: FieldInterner::new(),
            constants: ConstantPool::new(),
            globals: GlobalTable::new(),
            templates: TemplateBuilder::new(),
            labels: Labels::new(),
            code: ByteWriter::new(),
            srcmap: SourceMapBuilder::new(),
            regalloc: regalloc::Context::new(),
        }
    }

    /// Compile `program` into a loadable image.
    pub fn compile(mut self, program: &Program) -> CodegenResult<Image> {
        for global in &program.globals {
            self.globals.register(global.uid, &global.name, &global.loc)?;
        }

        let mut func_labels: SecondaryMap<FuncId, PackedOption<Label>> = SecondaryMap::new();
        for (id, decl) in program.funcs.iter() {
            func_labels[id] = PackedOption::from(self.labels.alloc_named(decl.name.clone()));
        }

        if let Some(main) = program.main {
            self.emit_prologue(program, main, &func_labels)?;
        }

        for (id, decl) in program.funcs.iter() {
            let insts = {
                let mut ctx = LowerCtx {
                    program,
                    interner: &mut self.interner,
                    constants: &mut self.constants,
                    templates: &mut self.templates,
                    globals: &self.globals,
                    labels: &mut self.labels,
                    func_labels: &func_labels,
                };
                lower_func(&mut ctx, id)?
            };
            let allocation = self.regalloc.run(
                &decl.name,
                insts,
                decl.params.len() as u16,
                decl.upvalues.len() as u16,
            )?;
            let method_uid = match decl.kind {
                FuncKind::Method { uid } => Some(uid),
                _ => None,
            };
            let entry = func_labels[id].expect("entry label was allocated");
            Encoder::new(&mut self.code, &mut self.labels, &mut self.srcmap).encode_func(
                &decl.name,
                entry,
                method_uid,
                &allocation.insts,
                &allocation.colors,
            )?;
        }

        self.link()?;

        let object_keys = render_object_keys(&self.interner);
        Ok(assemble(
            self.constants.as_slice(),
            &self.globals.to_bytes(),
            self.templates.as_slice(),
            &object_keys,
            self.code.as_slice(),
            self.srcmap.render(),
        ))
    }

    /// The entry-point prologue: open a frame, forward `argv` when main
    /// wants it, call main, fetch its return value, halt.
    fn emit_prologue(
        &mut self,
        program: &Program,
        main: FuncId,
        func_labels: &SecondaryMap<FuncId, PackedOption<Label>>,
    ) -> CodegenResult<()> {
        let decl = &program.funcs[main];
        let loc = Loc::unknown();
        let mut encoder = Encoder::new(&mut self.code, &mut self.labels, &mut self.srcmap);
        encoder.emit(Opcode::FnAlloc, &[], &loc, &decl.name)?;
        if !decl.params.is_empty() {
            encoder.emit(Opcode::FnSetRegPtr, &[EncOp::U(0), EncOp::U(0)], &loc, &decl.name)?;
        }
        let entry = func_labels[main].expect("entry label was allocated");
        encoder.emit(Opcode::FnCalli, &[EncOp::Target(entry)], &loc, &decl.name)?;
        if let Some(ret) = decl.ret {
            let width = program.types.size_of(ret);
            encoder.emit(
                Opcode::FnGetRetReg,
                &[
                    EncOp::U(u64::from(ret_reg(0))),
                    EncOp::U(u64::from(RET_REG)),
                    EncOp::U(u64::from(width.bytes())),
                ],
                &loc,
                &decl.name,
            )?;
        }
        encoder.emit(Opcode::Halt, &[EncOp::U(u64::from(RET_REG))], &loc, &decl.name)?;
        Ok(())
    }

    /// Resolve every recorded label site in the code segment and drain the
    /// method-offset placeholders in the template segment.
    fn link(&mut self) -> CodegenResult<()> {
        self.labels.link(&mut self.code)?;
        let fixups: Vec<(u32, Label)> = self
            .templates
            .fixups()
            .iter()
            .map(|f| (f.site, f.label))
            .collect();
        for (site, label) in fixups {
            let offset = self
                .labels
                .resolved_offset(label)
                .ok_or_else(|| CodegenError::UnresolvedLabel(self.labels.name_of(label)))?;
            self.templates.patch(site, offset)?;
        }
        debug_assert!(self.labels.is_fully_resolved());
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
