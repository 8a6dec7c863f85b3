//! Resolved types and their layout in the VM's value model.
//!
//! Types are stored by index in an arena ([`TypeStore`]); cyclic type graphs
//! (a struct holding a reference to itself, a class method returning its own
//! class) are simply cycles of indices, and every traversal that follows
//! type references carries a visited set instead of marking nodes.
//!
//! At the value level the VM knows four scalar widths and pointers. Every
//! composite type is referenced through an 8-byte pointer; `size_of` and
//! `is_pointer` are the only classification the instruction selector needs.

use crate::fx::FxHashSet;
use crate::interner::FieldInterner;
use crate::ir::types::{NumTy, Width};
use crate::result::{CodegenError, CodegenResult};
use crate::sema::ast::FuncId;
use crate::srcmap::Loc;
use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a type in the [`TypeStore`] arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);
entity_impl!(TypeId, "ty");

/// A basic scalar type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BasicType {
    /// 8-bit signed integer.
    I8,
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit signed integer.
    I16,
    /// 16-bit unsigned integer.
    U16,
    /// 32-bit signed integer.
    I32,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit signed integer.
    I64,
    /// 64-bit unsigned integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Boolean, stored in one byte.
    Bool,
}

impl BasicType {
    /// The numeric opcode family for this scalar.
    pub fn num_ty(self) -> NumTy {
        match self {
            Self::I8 => NumTy::I8,
            Self::U8 | Self::Bool => NumTy::U8,
            Self::I16 => NumTy::I16,
            Self::U16 => NumTy::U16,
            Self::I32 => NumTy::I32,
            Self::U32 => NumTy::U32,
            Self::I64 => NumTy::I64,
            Self::U64 => NumTy::U64,
            Self::F32 => NumTy::F32,
            Self::F64 => NumTy::F64,
        }
    }
}

/// A named struct field.
#[derive(Clone, Debug)]
pub struct StructField {
    /// Field name, interned into the global field-ID table at layout time.
    pub name: String,
    /// Resolved field type.
    pub ty: TypeId,
    /// Where the field was declared.
    pub loc: Loc,
}

/// A struct: an ordered list of named fields.
#[derive(Clone, Debug)]
pub struct StructType {
    /// Fields in declaration order.
    pub fields: Vec<StructField>,
}

/// A class attribute with a fixed slot in the instance.
#[derive(Clone, Debug)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Resolved attribute type.
    pub ty: TypeId,
}

/// A class method bound to a generated function.
#[derive(Clone, Debug)]
pub struct Method {
    /// Method name.
    pub name: String,
    /// Stable interface-method UID used for virtual dispatch.
    pub uid: u32,
    /// The function holding the method body.
    pub func: FuncId,
}

/// A class: attributes, a method table and a stable class ID.
#[derive(Clone, Debug)]
pub struct ClassType {
    /// Unique class ID.
    pub id: u32,
    /// Attributes in declaration order; offsets are fixed by that order.
    pub attributes: Vec<Attribute>,
    /// Methods in declaration order; sorted by UID before template emission.
    pub methods: Vec<Method>,
    /// Implemented interfaces.
    pub interfaces: Vec<TypeId>,
}

/// A method declared by an interface.
#[derive(Clone, Debug)]
pub struct InterfaceMethod {
    /// Method name.
    pub name: String,
    /// Stable interface-method UID.
    pub uid: u32,
    /// Return type, if the method produces a value.
    pub ret: Option<TypeId>,
}

/// An interface: a set of method declarations.
#[derive(Clone, Debug)]
pub struct InterfaceType {
    /// Declared methods.
    pub methods: Vec<InterfaceMethod>,
}

/// An enum field, possibly with an explicit value.
///
/// The parser has already folded decimal/binary/octal/hex literal text into
/// the integer; resolution of unassigned fields is the back end's job.
#[derive(Clone, Debug)]
pub struct EnumField {
    /// Field name.
    pub name: String,
    /// Explicit value, if the source assigned one.
    pub value: Option<u64>,
    /// Where the field was declared.
    pub loc: Loc,
}

/// An enum: ordered fields over an integer backing width.
#[derive(Clone, Debug)]
pub struct EnumType {
    /// Fields in declaration order.
    pub fields: Vec<EnumField>,
    /// Declared backing width; defaults to four bytes.
    pub backing: Option<Width>,
}

impl EnumType {
    /// The backing width of the enum's values.
    pub fn backing_width(&self) -> Width {
        self.backing.unwrap_or(Width::B4)
    }

    /// Resolve every field to a concrete value.
    ///
    /// Either all fields are unassigned (first = 0, incrementing), or the
    /// first is assigned and unassigned successors auto-increment; once an
    /// explicit value appears after the first field, every later field must
    /// be explicit. Resolved values must be unique.
    pub fn resolve_values(&self) -> CodegenResult<Vec<u64>> {
        let mut values = Vec::with_capacity(self.fields.len());
        let mut forced_explicit = false;
        let mut next = 0u64;
        for (index, field) in self.fields.iter().enumerate() {
            let value = match field.value {
                Some(value) => {
                    if index > 0 {
                        forced_explicit = true;
                    }
                    value
                }
                None => {
                    if forced_explicit {
                        return Err(CodegenError::resolution(
                            format!(
                                "enum field `{}` must be assigned a value explicitly",
                                field.name
                            ),
                            &field.loc,
                        ));
                    }
                    next
                }
            };
            if values.contains(&value) {
                return Err(CodegenError::resolution(
                    "Enum fields values must be unique",
                    &field.loc,
                ));
            }
            next = value + 1;
            values.push(value);
        }
        Ok(values)
    }
}

/// A function, closure or coroutine signature.
#[derive(Clone, Debug)]
pub struct Signature {
    /// Parameter types in order.
    pub params: Vec<TypeId>,
    /// Return type, if the function produces a value.
    pub ret: Option<TypeId>,
}

/// A resolved type.
#[derive(Clone, Debug)]
pub enum TypeData {
    /// A basic scalar.
    Basic(BasicType),
    /// An array of `elem` values.
    Array {
        /// Element type.
        elem: TypeId,
    },
    /// A struct.
    Struct(StructType),
    /// A class.
    Class(ClassType),
    /// An interface.
    Interface(InterfaceType),
    /// An enum.
    Enum(EnumType),
    /// A plain function address.
    Func(Signature),
    /// A closure: function address plus captured environment.
    Closure(Signature),
    /// A coroutine instance.
    Coroutine(Signature),
    /// A promise wrapping a future value.
    Promise {
        /// The resolved value's type.
        inner: TypeId,
    },
    /// A nullable wrapper.
    Nullable {
        /// The wrapped type.
        inner: TypeId,
    },
    /// A reference to (alias of) another type.
    Ref(TypeId),
    /// The type of expressions that never produce a value.
    Unreachable,
}

/// The arena all resolved types live in.
#[derive(Default)]
pub struct TypeStore {
    data: PrimaryMap<TypeId, TypeData>,
}

impl TypeStore {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type, returning its index.
    pub fn push(&mut self, data: TypeData) -> TypeId {
        self.data.push(data)
    }

    /// Look at a type without following references.
    pub fn get(&self, ty: TypeId) -> &TypeData {
        &self.data[ty]
    }

    /// Follow `Ref` links to the underlying type.
    ///
    /// Reference cycles are a checker bug; the traversal guards against
    /// them with a visited set and stops at the first repeat.
    pub fn resolve(&self, ty: TypeId) -> TypeId {
        let mut seen = FxHashSet::default();
        let mut cur = ty;
        while let TypeData::Ref(to) = self.data[cur] {
            if !seen.insert(cur) {
                break;
            }
            cur = to;
        }
        cur
    }

    /// The byte size of a value of this type: 1, 2, 4 or 8.
    ///
    /// Composite and heap types are held by pointer and size 8; enums take
    /// their backing width; references resolve to the base type's size.
    pub fn size_of(&self, ty: TypeId) -> Width {
        match self.get(self.resolve(ty)) {
            TypeData::Basic(basic) => basic.num_ty().width(),
            TypeData::Enum(e) => e.backing_width(),
            TypeData::Array { .. }
            | TypeData::Struct(_)
            | TypeData::Class(_)
            | TypeData::Interface(_)
            | TypeData::Func(_)
            | TypeData::Closure(_)
            | TypeData::Coroutine(_)
            | TypeData::Promise { .. }
            | TypeData::Nullable { .. }
            | TypeData::Unreachable => Width::B8,
            TypeData::Ref(_) => unreachable!("resolve() removed all references"),
        }
    }

    /// True for composite and heap types referenced through a pointer.
    pub fn is_pointer(&self, ty: TypeId) -> bool {
        match self.get(self.resolve(ty)) {
            TypeData::Basic(_) | TypeData::Enum(_) | TypeData::Unreachable => false,
            TypeData::Array { .. }
            | TypeData::Struct(_)
            | TypeData::Class(_)
            | TypeData::Interface(_)
            | TypeData::Func(_)
            | TypeData::Closure(_)
            | TypeData::Coroutine(_)
            | TypeData::Promise { .. }
            | TypeData::Nullable { .. } => true,
            TypeData::Ref(_) => unreachable!("resolve() removed all references"),
        }
    }

    /// The numeric opcode family of a scalar-valued type, if it has one.
    pub fn num_ty(&self, ty: TypeId) -> Option<NumTy> {
        match self.get(self.resolve(ty)) {
            TypeData::Basic(basic) => Some(basic.num_ty()),
            TypeData::Enum(e) => Some(NumTy::unsigned(e.backing_width())),
            _ => None,
        }
    }
}

/// One field of a laid-out struct, in post-sort order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutField {
    /// Field name.
    pub name: String,
    /// Interned field ID.
    pub field_id: u32,
    /// Field type.
    pub ty: TypeId,
    /// Byte offset within the struct.
    pub offset: u16,
    /// True if the field holds a pointer.
    pub is_ptr: bool,
    /// Value width of the field.
    pub width: Width,
}

/// The computed layout of a struct: fields sorted by field ID so the VM's
/// hash probe and the compiler agree on slot positions.
#[derive(Clone, Debug)]
pub struct StructLayout {
    /// Fields in ascending field-ID order.
    pub fields: Vec<LayoutField>,
    /// Total instance size: `max(field size) * field count`.
    pub total_size: u16,
}

impl StructLayout {
    /// Compute the layout of `strukt`, interning its field names.
    ///
    /// Every field occupies a slot of the largest field's size, and slots
    /// are assigned in ascending field-ID order.
    pub fn compute(
        types: &TypeStore,
        interner: &mut FieldInterner,
        strukt: &StructType,
    ) -> StructLayout {
        let slot = strukt
            .fields
            .iter()
            .map(|f| u16::from(types.size_of(f.ty).bytes()))
            .max()
            .unwrap_or(0);
        let mut fields: Vec<LayoutField> = strukt
            .fields
            .iter()
            .map(|f| LayoutField {
                name: f.name.clone(),
                field_id: interner.intern(&f.name),
                ty: f.ty,
                offset: 0,
                is_ptr: types.is_pointer(f.ty),
                width: types.size_of(f.ty),
            })
            .collect();
        fields.sort_by_key(|f| f.field_id);
        for (index, field) in fields.iter_mut().enumerate() {
            field.offset = index as u16 * slot;
        }
        StructLayout {
            total_size: slot * strukt.fields.len() as u16,
            fields,
        }
    }

    /// Find a field by name.
    pub fn field(&self, name: &str) -> Option<&LayoutField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The attribute layout of a class: declaration order, fixed offsets.
#[derive(Clone, Debug)]
pub struct ClassLayout {
    /// Per-attribute `(offset, is_ptr, width)` in declaration order.
    pub attributes: Vec<(u16, bool, Width)>,
    /// Total attribute block size.
    pub attrs_size: u16,
}

impl ClassLayout {
    /// Compute the layout of `class`'s attribute block.
    pub fn compute(types: &TypeStore, class: &ClassType) -> ClassLayout {
        let slot = class
            .attributes
            .iter()
            .map(|a| u16::from(types.size_of(a.ty).bytes()))
            .max()
            .unwrap_or(0);
        let attributes = class
            .attributes
            .iter()
            .enumerate()
            .map(|(index, a)| {
                (
                    index as u16 * slot,
                    types.is_pointer(a.ty),
                    types.size_of(a.ty),
                )
            })
            .collect();
        ClassLayout {
            attributes,
            attrs_size: slot * class.attributes.len() as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Loc {
        Loc::unknown()
    }

    #[test]
    fn scalar_sizes() {
        let mut types = TypeStore::new();
        let b = types.push(TypeData::Basic(BasicType::Bool));
        let i16_ = types.push(TypeData::Basic(BasicType::I16));
        let f32_ = types.push(TypeData::Basic(BasicType::F32));
        let u64_ = types.push(TypeData::Basic(BasicType::U64));
        assert_eq!(types.size_of(b), Width::B1);
        assert_eq!(types.size_of(i16_), Width::B2);
        assert_eq!(types.size_of(f32_), Width::B4);
        assert_eq!(types.size_of(u64_), Width::B8);
        assert!(!types.is_pointer(u64_));
    }

    #[test]
    fn composites_are_pointers() {
        let mut types = TypeStore::new();
        let i32_ = types.push(TypeData::Basic(BasicType::I32));
        let arr = types.push(TypeData::Array { elem: i32_ });
        let opt = types.push(TypeData::Nullable { inner: i32_ });
        assert_eq!(types.size_of(arr), Width::B8);
        assert!(types.is_pointer(arr));
        assert!(types.is_pointer(opt));
    }

    #[test]
    fn references_resolve_to_base_size() {
        let mut types = TypeStore::new();
        let i16_ = types.push(TypeData::Basic(BasicType::I16));
        let r = types.push(TypeData::Ref(i16_));
        let rr = types.push(TypeData::Ref(r));
        assert_eq!(types.size_of(rr), Width::B2);
        assert!(!types.is_pointer(rr));
    }

    #[test]
    fn enum_auto_numbering() {
        let e = EnumType {
            fields: vec![
                EnumField { name: "A".into(), value: None, loc: loc() },
                EnumField { name: "B".into(), value: None, loc: loc() },
                EnumField { name: "C".into(), value: None, loc: loc() },
            ],
            backing: None,
        };
        assert_eq!(e.resolve_values().unwrap(), vec![0, 1, 2]);
        assert_eq!(e.backing_width(), Width::B4);
    }

    #[test]
    fn enum_first_assigned_then_increment() {
        let e = EnumType {
            fields: vec![
                EnumField { name: "A".into(), value: Some(0x10), loc: loc() },
                EnumField { name: "B".into(), value: None, loc: loc() },
                EnumField { name: "C".into(), value: None, loc: loc() },
            ],
            backing: None,
        };
        assert_eq!(e.resolve_values().unwrap(), vec![16, 17, 18]);
    }

    #[test]
    fn enum_explicit_after_first_forces_rest() {
        let e = EnumType {
            fields: vec![
                EnumField { name: "A".into(), value: None, loc: loc() },
                EnumField { name: "B".into(), value: Some(5), loc: loc() },
                EnumField { name: "C".into(), value: None, loc: loc() },
            ],
            backing: None,
        };
        assert!(matches!(
            e.resolve_values(),
            Err(CodegenError::Resolution { .. })
        ));
    }

    #[test]
    fn enum_values_must_be_unique() {
        let e = EnumType {
            fields: vec![
                EnumField { name: "A".into(), value: Some(1), loc: loc() },
                EnumField { name: "B".into(), value: Some(1), loc: loc() },
            ],
            backing: None,
        };
        let err = e.resolve_values().unwrap_err();
        assert!(err.to_string().contains("Enum fields values must be unique"));
    }

    #[test]
    fn struct_layout_sorts_by_field_id() {
        let mut types = TypeStore::new();
        let i64_ = types.push(TypeData::Basic(BasicType::I64));
        let mut interner = FieldInterner::new();
        // An earlier struct already registered x, y, z.
        interner.intern("x");
        interner.intern("y");
        interner.intern("z");
        let strukt = StructType {
            fields: vec![
                StructField { name: "y".into(), ty: i64_, loc: loc() },
                StructField { name: "w".into(), ty: i64_, loc: loc() },
                StructField { name: "x".into(), ty: i64_, loc: loc() },
            ],
        };
        let layout = StructLayout::compute(&types, &mut interner, &strukt);
        let order: Vec<&str> = layout.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, ["x", "y", "w"]);
        let offsets: Vec<u16> = layout.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, [0, 8, 16]);
        assert_eq!(layout.total_size, 24);
    }
}
