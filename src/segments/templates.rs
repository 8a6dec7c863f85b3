//! The template segment.
//!
//! For every struct and class type the generated code instantiates, a
//! compact descriptor is written into the template segment; `s_alloc_t` and
//! `c_alloc_t` refer to descriptors by their byte offset, which doubles as
//! the template ID.
//!
//! Struct records store fields sorted by field ID so the VM's lookup agrees
//! with the compile-time layout. Class records store methods sorted by
//! interface-method UID for the VM's binary-search dispatch; their code
//! offsets are written as placeholders and patched by the linker once every
//! function has been emitted.

use crate::fx::FxHashMap;
use crate::interner::FieldInterner;
use crate::ir::entities::Label;
use crate::result::CodegenResult;
use crate::sema::ast::FuncId;
use crate::sema::types::{ClassLayout, ClassType, StructLayout, StructType, TypeId, TypeStore};
use crate::writer::{ByteWriter, CodeOffset};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

/// A placeholder site in the template segment waiting for a method's code
/// offset.
pub struct TemplateFixup {
    /// The method's entry label.
    pub label: Label,
    /// Offset of the 4-byte placeholder within the template segment.
    pub site: CodeOffset,
}

/// Builds the template segment.
#[derive(Default)]
pub struct TemplateBuilder {
    writer: ByteWriter,
    by_type: FxHashMap<TypeId, CodeOffset>,
    fixups: Vec<TemplateFixup>,
}

impl TemplateBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The template ID (byte offset) of the descriptor for struct `ty`,
    /// writing the descriptor on first request.
    pub fn struct_template(
        &mut self,
        types: &TypeStore,
        interner: &mut FieldInterner,
        ty: TypeId,
        strukt: &StructType,
    ) -> CodegenResult<CodeOffset> {
        if let Some(&id) = self.by_type.get(&ty) {
            return Ok(id);
        }
        let layout = StructLayout::compute(types, interner, strukt);
        let id = self.writer.len();
        self.writer.u8(layout.fields.len() as u8);
        self.writer.u16(layout.total_size);
        for field in &layout.fields {
            self.writer.u32(field.field_id);
            self.writer.u16(field.offset);
            self.writer.u8(field.is_ptr as u8);
        }
        self.by_type.insert(ty, id);
        Ok(id)
    }

    /// The template ID of the descriptor for class `ty`, writing the
    /// descriptor on first request.
    pub fn class_template(
        &mut self,
        types: &TypeStore,
        ty: TypeId,
        class: &ClassType,
        method_labels: &SecondaryMap<FuncId, PackedOption<Label>>,
    ) -> CodegenResult<CodeOffset> {
        if let Some(&id) = self.by_type.get(&ty) {
            return Ok(id);
        }
        let layout = ClassLayout::compute(types, class);
        let id = self.writer.len();
        self.writer.u8(class.attributes.len() as u8);
        self.writer.u16(class.methods.len() as u16);
        self.writer.u16(layout.attrs_size);
        self.writer.u32(class.id);
        for &(offset, is_ptr, _) in &layout.attributes {
            self.writer.u16(offset);
            self.writer.u8(is_ptr as u8);
        }
        let mut methods: Vec<_> = class.methods.iter().collect();
        methods.sort_by_key(|m| m.uid);
        for method in methods {
            self.writer.u32(method.uid);
            let site = self.writer.u32(0);
            let label = method_labels[method.func]
                .expect("method function was assigned an entry label");
            self.fixups.push(TemplateFixup { label, site });
        }
        self.by_type.insert(ty, id);
        Ok(id)
    }

    /// The placeholder sites to patch at link time.
    pub fn fixups(&self) -> &[TemplateFixup] {
        &self.fixups
    }

    /// Patch a placeholder site with a resolved code offset.
    pub fn patch(&mut self, site: CodeOffset, code_offset: u32) -> CodegenResult<()> {
        self.writer.patch_at(site, u64::from(code_offset), crate::writer::Width::B4)
    }

    /// The segment's bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.writer.as_slice()
    }

    /// Size of the segment in bytes.
    pub fn byte_size(&self) -> CodeOffset {
        self.writer.len()
    }
}
