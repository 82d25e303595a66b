//! Declarative + expression IR for the pattern language.
//!
//! This is a plain tagged-variant tree, not a class hierarchy: the few
//! operations every node needs (`create_patterns`/`evaluate`/`execute`)
//! are implemented as free functions over these types in the evaluator
//! crate, walked from a separate module rather than via trait objects on
//! the AST itself.
//!
//! Building a program means constructing this tree directly; lexing and
//! parsing PL source text into it is an external concern and
//! is represented only by the `Lexer`/`Parser` traits in `pattern-runtime`.

use pattern_core::Literal;
use std::collections::HashMap;

/// `(file, start_line, end_line)` span used for diagnostics. Attached to
/// declarations and statements; expression nodes are small and numerous
/// enough that we don't carry one on every leaf.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            start_line: line,
            end_line: line,
        }
    }
}

/// `[[name(arg, ...)]]` attribute, argument literals already evaluated to
/// constants.
pub type AttributeMap = HashMap<String, Vec<Literal>>;

/// A whole pattern-language program: top-level declarations in source
/// order, plus an optional `main` function.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub enum Item {
    TypeDecl(TypeDecl),
    Struct(StructDecl),
    Union(UnionDecl),
    Enum(EnumDecl),
    Bitfield(BitfieldDecl),
    Variable(VariableDecl),
    ArrayVariable(ArrayVariableDecl),
    PointerVariable(PointerVariableDecl),
    MultiVariable(MultiVariableDecl),
    Function(FunctionDefinition),
    /// A bare top-level statement, most commonly a function call such as
    /// `std::assert(...)`. The original language
    /// has no notion of a required top-level `main`; ordinary statements
    /// run in program order alongside declarations.
    Statement(Stmt),
}

// ============================================================================
//                                TYPE EXPRESSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinType {
    U8,
    U16,
    U24,
    U32,
    U48,
    U64,
    U96,
    U128,
    S8,
    S16,
    S24,
    S32,
    S48,
    S64,
    S96,
    S128,
    Float,
    Double,
    Bool,
    Char,
    Char16,
    Str,
    Padding,
    /// Inferred from an initializer; only valid for locals.
    Auto,
}

impl BuiltinType {
    /// Width in bits, or `None` for `Str`/`Padding`/`Auto` whose size is
    /// not fixed by the type alone.
    pub fn bit_width(self) -> Option<u32> {
        use BuiltinType::*;
        match self {
            U8 | S8 | Bool | Char => Some(8),
            U16 | S16 | Char16 => Some(16),
            U24 | S24 => Some(24),
            U32 | S32 | Float => Some(32),
            U48 | S48 => Some(48),
            U64 | S64 | Double => Some(64),
            U96 | S96 => Some(96),
            U128 | S128 => Some(128),
            Str | Padding | Auto => None,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BuiltinType::S8
                | BuiltinType::S16
                | BuiltinType::S24
                | BuiltinType::S32
                | BuiltinType::S48
                | BuiltinType::S64
                | BuiltinType::S96
                | BuiltinType::S128
        )
    }
}

/// A reference to a type: either a builtin, a named user type
/// (optionally instantiated with template arguments), a static/dynamic
/// array of some element type, or a pointer.
#[derive(Debug, Clone)]
pub enum TypeExpr {
    Builtin(BuiltinType),
    /// `Name<args...>` — `args` is empty for a non-templated type.
    Named {
        name: String,
        args: Vec<TemplateArg>,
    },
    Array {
        element: Box<TypeExpr>,
        size: Box<ArraySize>,
    },
    Pointer {
        pointee: Box<TypeExpr>,
        underlying: Box<TypeExpr>,
    },
}

#[derive(Debug, Clone)]
pub enum TemplateArg {
    Type(TypeExpr),
    Value(Expr),
}

#[derive(Debug, Clone)]
pub enum ArraySize {
    Static(Expr),
    /// `while (cond) { ... }`-sized array.
    WhileCondition(Expr),
}

/// A type expression with an optional `be`/`le` endian override.
#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub ty: TypeExpr,
    pub endian: Option<Endian>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

// ============================================================================
//                                  DECLARATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateParamKind {
    Type,
    Auto,
}

#[derive(Debug, Clone)]
pub struct TemplateParam {
    pub name: String,
    pub kind: TemplateParamKind,
}

/// `using Name<T, auto N> = ...;` A forward declaration has `target ==
/// None` until a later declaration with the same name completes it.
#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub name: String,
    pub template_params: Vec<TemplateParam>,
    pub target: Option<TypeExpr>,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub enum StructMember {
    Variable(VariableDecl),
    ArrayVariable(ArrayVariableDecl),
    PointerVariable(PointerVariableDecl),
    MultiVariable(MultiVariableDecl),
    /// `if`/`else` inside a struct or union body: only the taken branch's
    /// declarations are created.
    Conditional {
        cond: Expr,
        then_branch: Vec<StructMember>,
        else_branch: Vec<StructMember>,
    },
}

#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    pub template_params: Vec<TemplateParam>,
    pub members: Vec<StructMember>,
    pub attributes: AttributeMap,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct UnionDecl {
    pub name: String,
    pub template_params: Vec<TemplateParam>,
    pub members: Vec<StructMember>,
    pub attributes: AttributeMap,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub enum EnumValue {
    /// Previous entry's value + 1 (or 0 for the first entry).
    Auto,
    Single(Expr),
    /// `a...b` inclusive range.
    Range(Expr, Expr),
}

#[derive(Debug, Clone)]
pub struct EnumEntry {
    pub name: String,
    pub value: EnumValue,
}

#[derive(Debug, Clone)]
pub struct EnumDecl {
    pub name: String,
    pub underlying: TypeExpr,
    pub entries: Vec<EnumEntry>,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldFieldSign {
    Unsigned,
    Signed,
    Bool,
}

#[derive(Debug, Clone)]
pub enum BitfieldMember {
    Field {
        name: String,
        sign: BitfieldFieldSign,
        bit_size: Expr,
        enum_type: Option<String>,
    },
    Array {
        name: String,
        sign: BitfieldFieldSign,
        bit_size: Expr,
        count: Expr,
    },
    /// A nested bitfield container, itself carrying its own
    /// `first_bit_offset`/fields.
    Nested(BitfieldDecl),
    /// An array of nested bitfield containers (`Nested name[count];`),
    /// needed by 's `.f[0].nestedA`/`.f[1].nestedA`.
    NestedArray {
        name: String,
        element: BitfieldDecl,
        count: Expr,
    },
}

#[derive(Debug, Clone)]
pub struct BitfieldDecl {
    pub name: String,
    pub fields: Vec<BitfieldMember>,
    pub attributes: AttributeMap,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct Placement {
    pub offset: Expr,
    pub section: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InOut {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub ty: TypedExpr,
    pub placement: Option<Placement>,
    pub in_out: Option<InOut>,
    pub attributes: AttributeMap,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ArrayVariableDecl {
    pub name: String,
    pub element_ty: TypedExpr,
    pub size: ArraySize,
    pub placement: Option<Placement>,
    pub attributes: AttributeMap,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct PointerVariableDecl {
    pub name: String,
    pub pointee_ty: TypedExpr,
    pub underlying_ty: TypeExpr,
    pub placement: Option<Placement>,
    pub attributes: AttributeMap,
    pub loc: SourceLocation,
}

/// `T a, b, c;` sugar, desugared by the resolver into N `VariableDecl`s
/// sharing `ty`.
#[derive(Debug, Clone)]
pub struct MultiVariableDecl {
    pub names: Vec<String>,
    pub ty: TypedExpr,
    pub attributes: AttributeMap,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    pub name: String,
    pub params: Vec<Param>,
    /// `auto ...pack` trailing parameter pack name, if declared.
    pub pack: Option<String>,
    pub body: Vec<Stmt>,
    pub loc: SourceLocation,
}

// ============================================================================
//                                  STATEMENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum LValueTarget {
    Name(String),
    /// `$` on the left of an assignment rebinds the read cursor.
    CurrentOffset,
    Index { base: Box<LValueTarget>, index: Expr },
    Member { base: Box<LValueTarget>, name: String },
}

#[derive(Debug, Clone)]
pub enum MatchPattern {
    /// `_` — matches anything, marks the arm as the default.
    Any,
    Value(Expr),
    Range(Expr, Expr),
    Alternation(Vec<Expr>),
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub patterns: Vec<MatchPattern>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Expr),
    VariableDecl(VariableDecl),
    ArrayVariableDecl(ArrayVariableDecl),
    Assign {
        target: LValueTarget,
        value: Expr,
    },
    Conditional {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// Desugars to `{ init; while (cond) { body; post; } }` in a new scope
    /// at evaluation time; kept distinct here so the
    /// evaluator can give `for`-specific diagnostics.
    For {
        init: Box<Stmt>,
        cond: Expr,
        post: Box<Stmt>,
        body: Vec<Stmt>,
    },
    Match {
        scrutinees: Vec<Expr>,
        arms: Vec<MatchArm>,
    },
    TryCatch {
        try_body: Vec<Stmt>,
        catch_body: Vec<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Compound(Vec<Stmt>),
}

// ============================================================================
//                                 EXPRESSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// The root of an rvalue path: `this`, `parent`, a named
/// identifier, `$` (current offset), or `null`.
#[derive(Debug, Clone)]
pub enum RvalueRoot {
    This,
    Parent,
    Identifier(String),
    CurrentOffset,
    Null,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Rvalue(RvalueRoot),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        ty: BuiltinType,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Member {
        base: Box<Expr>,
        name: String,
    },
    /// `Enum::Variant` / `Namespace::Type`.
    ScopeResolution {
        base: String,
        member: String,
    },
    /// `sizeof(T)` / `addressof(x)`.
    SizeOf(TypeExpr),
    AddressOf(Box<Expr>),
}
