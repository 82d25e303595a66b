//! Pattern Runtime: the tree-walking evaluator and embedding façade for
//! the pattern language interpreter.
//!
//! - `config`: evaluator configuration, resource limits, builtin/formatter
//!   registration
//! - `control`: the `ControlFlow` signal used for loop/function exit
//! - `scope`: the scope stack and parameter-pack capture
//! - `log`: the console diagnostic log
//! - `frontend`: `Lexer`/`Parser` trait seams (lexing/parsing are out of
//!   scope for this crate; a host supplies its own)
//! - `evaluator`: the `Evaluator` struct itself
//! - `dispatch`: the free-function tree walk (`create_patterns`/
//!   `evaluate`/`execute`) over `pattern_lang::ast`
//! - `builtins`: a minimal `std::` surface sufficient to exercise the
//!   function-call ABI
//! - `runtime`: the `Runtime` embedding façade

pub mod builtins;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod evaluator;
pub mod frontend;
pub mod log;
pub mod runtime;
pub mod scope;

pub use config::{Arity, BuiltinCallback, BuiltinFunction, DangerousPolicy, EvaluatorConfig};
pub use control::ControlFlow;
pub use dispatch::{create_patterns, evaluate, execute};
pub use evaluator::{Evaluator, SteppingMode};
pub use frontend::{Lexer, Parser, Token};
pub use log::{ConsoleLog, LogLevel};
pub use runtime::{PragmaHandler, Runtime};
pub use scope::{ParameterPack, Scope};
