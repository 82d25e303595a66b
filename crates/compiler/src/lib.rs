//! Pattern Lang: the AST, the pattern tree, and the attribute engine that
//! maps one onto the other.
//!
//! This crate is pure data plus the small amount of logic that doesn't
//! need a live evaluator: attribute application, enum lookup, bit/byte
//! value extraction. Tree-walking evaluation of `ast::Program` into a
//! forest of `pattern::Pattern`s lives one layer up, in `pattern-runtime`,
//! which depends on this crate rather than the other way around.
//!
//! # Modules
//!
//! - `ast`: the declarative + expression IR a parser would produce
//! - `pattern`: the annotated pattern tree an evaluation run produces
//! - `attribute`: `[[name(args)]]` application onto a `Pattern`

pub mod ast;
pub mod attribute;
pub mod pattern;

pub use attribute::{AttributeEffects, AttributeHost};
pub use pattern::{
    BitfieldFieldSign, EnumEntry, FormatterFn, LeafKind, Pattern, PatternFlags, PatternHeader, PatternKind,
    PatternVisitor, PointerBaseFn, TransformFn,
};
