//! The resolved program representation the back end consumes.
//!
//! The parser and type checker live upstream; by the time a program reaches
//! this crate every expression carries its canonical [`TypeId`](types::TypeId)
//! and every name has been classified as an argument, local, upvalue, global
//! or function reference. The back end reads this representation and never
//! mutates it.

pub mod ast;
pub mod types;

pub use self::ast::{
    BinaryOp, Callee, Capture, CoroutineSource, Expr, ExprKind, FuncDecl, FuncId, FuncKind,
    GlobalDecl, LValue, Literal, LocalId, Pattern, Program, Stmt, StmtKind, UnaryOp,
};
pub use self::types::{
    Attribute, BasicType, ClassLayout, ClassType, EnumField, EnumType, InterfaceMethod,
    InterfaceType, Method, Signature, StructField, StructLayout, StructType, TypeData, TypeId,
    TypeStore,
};
