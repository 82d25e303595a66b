//! Pattern Core: literal values and section-addressed byte/bit I/O
//!
//! This crate provides the language-agnostic primitives shared by every
//! layer of the pattern language interpreter:
//!
//! - `literal`: the tagged [`Literal`] value every expression evaluates to
//! - `section`: named byte stores (`MAIN`, `HEAP`, `PATTERN_LOCAL`, user
//!   sections) and the bit-granular reader/writer built on top of them
//! - `error`: the shared error kinds and source-location type used by
//!   every crate above this one
//!
//! # Modules
//!
//! - `literal`: tagged value type, coercion and ordering rules
//! - `section`: section registry and addressing
//! - `io`: bit-accurate cursor-based reader/writer over sections
//! - `error`: `PatternError`, `SourceLocation`

pub mod error;
pub mod io;
pub mod literal;
pub mod section;

pub use error::{ErrorKind, PatternError, SourceLocation};
pub use io::{ByteIo, Endian, ReadCursor};
pub use literal::{Literal, PatternId, ValueType};
pub use section::{Section, SectionId, SectionTable, HEAP, MAIN, PATTERN_LOCAL};
