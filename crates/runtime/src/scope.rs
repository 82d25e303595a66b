//! Scope stack and heap bookkeeping.

use pattern_lang::Pattern;
use pattern_core::Literal;
use std::collections::HashMap;

/// Trailing `auto ...args` capture.
#[derive(Debug, Clone, Default)]
pub struct ParameterPack {
    pub name: String,
    pub values: Vec<Literal>,
}

impl ParameterPack {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Literal> {
        self.values.get(index)
    }
}

/// One lexical scope. Locals are represented uniformly as `Pattern`s
/// placed on `HEAP`/`PATTERN_LOCAL`, so a primitive
/// local and a composite local share one lookup path.
#[derive(Default)]
pub struct Scope {
    pub parent: Option<pattern_core::PatternId>,
    pub patterns: Vec<Pattern>,
    pub locals: HashMap<String, Pattern>,
    pub parameter_pack: Option<ParameterPack>,
    pub heap_start_size: u64,
}

impl Scope {
    pub fn new(heap_start_size: u64) -> Self {
        Self {
            parent: None,
            patterns: Vec::new(),
            locals: HashMap::new(),
            parameter_pack: None,
            heap_start_size,
        }
    }

    /// `_` is the documented no-op sink: callers should
    /// skip registration entirely rather than calling this with `"_"`.
    pub fn declare_local(&mut self, name: String, pattern: Pattern) -> Result<(), pattern_core::PatternError> {
        if name == "_" {
            return Ok(());
        }
        if self.locals.contains_key(&name) {
            return Err(pattern_core::PatternError::validate(
                "E_REDECLARATION",
                format!("'{name}' is already declared in this scope"),
            ));
        }
        self.locals.insert(name, pattern);
        Ok(())
    }
}
