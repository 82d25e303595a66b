//! A minimal `std::` surface sufficient to exercise the function-call ABI
//! and the failing-assert scenario.
//!
//! The builtin function *library* itself is out of scope; a
//! host embedding this crate registers its own `std::` module the same
//! way it registers any other [`BuiltinFunction`]. `std::assert` is
//! bundled here only because the end-to-end scenario tests call it by
//! that exact qualified name.

use pattern_core::{Literal, PatternError};

use crate::config::{Arity, BuiltinFunction, EvaluatorConfig};
use crate::evaluator::Evaluator;
use crate::log::LogLevel;

fn std_assert(ev: &mut Evaluator, args: &[Literal]) -> Result<Option<Literal>, PatternError> {
    let condition = args[0].as_bool();
    let message = args[1].as_str().unwrap_or_default().to_string();
    if !condition {
        ev.log(LogLevel::Error, message.clone());
        return Err(PatternError::eval("E_ASSERT", message));
    }
    Ok(Some(Literal::Bool(true)))
}

fn std_print(ev: &mut Evaluator, args: &[Literal]) -> Result<Option<Literal>, PatternError> {
    let message = args.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(" ");
    ev.log(LogLevel::Info, message);
    Ok(Some(Literal::Bool(true)))
}

fn assert_builtin() -> Result<BuiltinFunction, String> {
    BuiltinFunction::new("std", "assert", Arity::Exactly(2), false, std::rc::Rc::new(std_assert))
}

fn print_builtin() -> Result<BuiltinFunction, String> {
    BuiltinFunction::new("std", "print", Arity::AtLeast(1), false, std::rc::Rc::new(std_print))
}

/// Install `std::assert` and `std::print` into a config. Symbol
/// validation can't fail for these fixed names; the `expect`s only guard
/// against a typo in this module, not host input.
pub fn with_minimal_std(config: EvaluatorConfig) -> EvaluatorConfig {
    config
        .with_function(assert_builtin().expect("std::assert is a valid symbol"))
        .with_function(print_builtin().expect("std::print is a valid symbol"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Evaluator;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn new_evaluator() -> Evaluator {
        Evaluator::new(with_minimal_std(EvaluatorConfig::new()), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn assert_true_returns_ok() {
        let mut ev = new_evaluator();
        let f = ev.lookup_function("std", "assert").cloned().unwrap();
        let result = (f.callback)(&mut ev, &[Literal::Bool(true), Literal::String("unused".into())]);
        assert!(result.is_ok());
    }

    #[test]
    fn assert_false_errors_and_logs_message() {
        let mut ev = new_evaluator();
        let f = ev.lookup_function("std", "assert").cloned().unwrap();
        let result = (f.callback)(&mut ev, &[Literal::Bool(false), Literal::String("Error".into())]);
        assert!(result.is_err());
        assert_eq!(ev.console_log.entries(), &[(LogLevel::Error, "Error".to_string())]);
    }

    #[test]
    fn lookup_function_requires_namespace_match() {
        let ev = new_evaluator();
        assert!(ev.lookup_function("", "assert").is_none());
    }
}
