//! The type-checked abstract syntax the back end lowers.
//!
//! One sum type per syntactic category. Every [`Expr`] node carries the
//! canonical [`TypeId`] the checker resolved for it, and every name
//! reference arrives pre-classified: capture analysis has already decided
//! what is an argument, a local, an upvalue or a global, and in which slot
//! it lives.

use crate::sema::types::{TypeId, TypeStore};
use crate::srcmap::Loc;
use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a generated function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "fn");

/// An opaque reference to a local variable of one function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u32);
entity_impl!(LocalId, "local");

/// A whole compilation unit, ready for code generation.
pub struct Program {
    /// The type arena every `TypeId` points into.
    pub types: TypeStore,
    /// All functions, including class methods and coroutine bodies.
    pub funcs: PrimaryMap<FuncId, FuncDecl>,
    /// Declared global variables and class statics.
    pub globals: Vec<GlobalDecl>,
    /// The entry function, if this unit has one.
    pub main: Option<FuncId>,
}

/// A global variable or class static. Each one occupies a fixed 8-byte slot
/// in the image's global segment, keyed by its symbol UID.
pub struct GlobalDecl {
    /// Variable name, for diagnostics.
    pub name: String,
    /// Stable symbol UID assigned by the checker.
    pub uid: u32,
    /// Resolved type of the stored value.
    pub ty: TypeId,
    /// Declaration site.
    pub loc: Loc,
}

/// What kind of code a function body compiles to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncKind {
    /// A free function.
    Plain,
    /// A class method; its code is prefixed with the interface-method UID
    /// for the VM's dispatch cache.
    Method {
        /// The interface-method UID.
        uid: u32,
    },
    /// A coroutine body; returns suspend instead of tearing the frame down.
    Coroutine,
}

/// A function declaration with a type-checked body.
pub struct FuncDecl {
    /// Function name, used in diagnostics and the source map.
    pub name: String,
    /// Parameter types; parameter `i` arrives pinned in register `i`.
    pub params: Vec<TypeId>,
    /// Captured upvalue types; upvalue `i` arrives pinned in register
    /// `params.len() + i`, in capture-analysis order.
    pub upvalues: Vec<TypeId>,
    /// Declared locals.
    pub locals: PrimaryMap<LocalId, TypeId>,
    /// Return type, if any.
    pub ret: Option<TypeId>,
    /// The body.
    pub body: Vec<Stmt>,
    /// Plain function, method or coroutine.
    pub kind: FuncKind,
    /// Declaration site.
    pub loc: Loc,
}

/// A statement.
pub struct Stmt {
    /// What the statement does.
    pub kind: StmtKind,
    /// Where it was written.
    pub loc: Loc,
}

/// Statement forms.
pub enum StmtKind {
    /// `let <pattern> = <expr>`.
    Let {
        /// Binding pattern.
        pattern: Pattern,
        /// Initializer.
        init: Expr,
    },
    /// `<lvalue> = <expr>`.
    Assign {
        /// Assignment target.
        target: LValue,
        /// Value to store.
        value: Expr,
    },
    /// An expression evaluated for its effects.
    Expr(Expr),
    /// `if <cond> { .. } else { .. }`.
    If {
        /// Condition, boolean-typed.
        cond: Expr,
        /// Then branch.
        then: Vec<Stmt>,
        /// Else branch, possibly empty.
        orelse: Vec<Stmt>,
    },
    /// `while <cond> { .. }`.
    While {
        /// Condition, boolean-typed.
        cond: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// Jump past the innermost loop.
    Break,
    /// Jump to the innermost loop's condition.
    Continue,
    /// `return [<expr>]`.
    Return(Option<Expr>),
    /// `yield [<expr>]`, inside a coroutine body.
    Yield(Option<Expr>),
}

/// A `let` binding pattern.
pub enum Pattern {
    /// Bind the whole value to one local.
    Name(LocalId),
    /// Deconstruct a struct value: `let {x, y, ...rest} = ..`.
    Struct {
        /// `(field name, local)` bindings.
        bindings: Vec<(String, LocalId)>,
        /// Local receiving a synthesized struct of the unvisited fields.
        rest: Option<LocalId>,
    },
}

/// An assignable place.
pub enum LValue {
    /// A local variable.
    Local(LocalId),
    /// A function argument.
    Arg(u16),
    /// A captured upvalue.
    Upvalue(u16),
    /// A global, by symbol UID.
    Global(u32),
    /// A struct or class field.
    Field {
        /// The struct or class value.
        base: Expr,
        /// Field or attribute name.
        field: String,
    },
    /// An array element.
    Index {
        /// The array value.
        base: Expr,
        /// Element index.
        index: Expr,
    },
}

/// A literal value.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    /// An integer literal, sign-extended to 64 bits.
    Int(i64),
    /// A float literal.
    Float(f64),
    /// A boolean literal.
    Bool(bool),
    /// A string literal; lowered to a `u8` array built from the constant
    /// pool.
    Str(String),
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// Boolean `&&` (strict; the checker has already inserted any
    /// short-circuiting control flow it wants).
    And,
    /// Boolean `||` (strict).
    Or,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Boolean negation.
    Not,
    /// Bitwise complement.
    BitNot,
}

/// What a call dispatches through.
pub enum Callee {
    /// A direct call to a known function.
    Direct(FuncId),
    /// A call through a first-class value: a function address, closure or
    /// coroutine, decided by the value's type.
    Value(Box<Expr>),
}

/// Where a new coroutine gets its body from.
pub enum CoroutineSource {
    /// A known function.
    Direct(FuncId),
    /// A function value computed at run time.
    Value(Box<Expr>),
}

/// An expression, annotated with its checked type.
pub struct Expr {
    /// What the expression computes.
    pub kind: ExprKind,
    /// The canonical resolved type of the value.
    pub ty: TypeId,
    /// Where it was written.
    pub loc: Loc,
}

/// Expression forms.
pub enum ExprKind {
    /// A literal.
    Literal(Literal),
    /// The null value of a nullable type.
    Null,
    /// A member of the expression's enum type, by declaration index.
    EnumMember {
        /// Index into the enum's field list.
        index: u32,
    },
    /// Function argument `n`.
    Arg(u16),
    /// A local variable.
    Local(LocalId),
    /// Captured upvalue `n`.
    Upvalue(u16),
    /// A global, by symbol UID.
    Global(u32),
    /// The address of a function, as a first-class value.
    FuncRef(FuncId),
    /// A binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// A unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// A call.
    Call {
        /// Callee.
        callee: Callee,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// A method call through the receiver's method table.
    MethodCall {
        /// Receiver object.
        recv: Box<Expr>,
        /// Interface-method UID to dispatch on.
        uid: u32,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// Read a struct field or class attribute.
    Field {
        /// Base value.
        base: Box<Expr>,
        /// Field or attribute name.
        field: String,
    },
    /// Read an array element.
    Index {
        /// Array value.
        base: Box<Expr>,
        /// Element index.
        index: Box<Expr>,
    },
    /// The length of an array.
    Len(Box<Expr>),
    /// Construct a struct of the expression's type.
    StructLit {
        /// `(field name, value)` in source order.
        fields: Vec<(String, Expr)>,
    },
    /// Instantiate the expression's class type.
    NewClass,
    /// Construct an array of the expression's type.
    ArrayLit {
        /// Element expressions.
        elems: Vec<Expr>,
    },
    /// Build a closure over a function and its captured environment.
    ClosureLit {
        /// The function body.
        func: FuncId,
        /// Captured values, in the order the body's upvalues expect.
        captures: Vec<Capture>,
    },
    /// Instantiate a coroutine.
    NewCoroutine(CoroutineSource),
    /// Read a coroutine's state word.
    CoroutineState(Box<Expr>),
    /// Convert to the expression's type: reinterpretation at equal width,
    /// widening or narrowing within a numeric family otherwise.
    Cast(Box<Expr>),
    /// Test whether an interface value is an instance of a class.
    Is {
        /// The interface-typed value.
        value: Box<Expr>,
        /// The class type tested against.
        class: TypeId,
    },
    /// Test whether an interface value's class has a method.
    HasMethod {
        /// The interface-typed value.
        value: Box<Expr>,
        /// Interface-method UID looked for.
        uid: u32,
    },
}

/// A value captured into a closure environment.
#[derive(Clone, Copy, Debug)]
pub enum Capture {
    /// Capture a local of the enclosing function.
    Local(LocalId),
    /// Capture an argument of the enclosing function.
    Arg(u16),
    /// Re-capture an upvalue of the enclosing function.
    Upvalue(u16),
}

impl Expr {
    /// Convenience constructor.
    pub fn new(kind: ExprKind, ty: TypeId, loc: Loc) -> Self {
        Self { kind, ty, loc }
    }
}

impl Program {
    /// Create an empty program over a type arena.
    pub fn new(types: TypeStore) -> Self {
        Self {
            types,
            funcs: PrimaryMap::new(),
            globals: Vec::new(),
            main: None,
        }
    }
}
