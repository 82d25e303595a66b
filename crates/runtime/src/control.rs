//! Control-flow signalling: loops and function bodies
//! unwind via an explicit signal consulted by their caller rather than by
//! throwing, reserving `Result<_, PatternError>` for actual
//! expression-level faults.

use pattern_core::Literal;

#[derive(Debug, Clone)]
pub enum ControlFlow {
    Break,
    Continue,
    Return(Option<Literal>),
}
