//! Evaluator configuration and the builtin-function registration surface.
//!
//! External code extends this interpreter with functions by name plus a
//! validated symbol and an arity descriptor, built through a small
//! builder.

use pattern_core::Literal;
use pattern_lang::{FormatterFn, PointerBaseFn, TransformFn};
use std::collections::HashMap;

use crate::evaluator::Evaluator;

/// How many positional arguments a builtin accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
    Any,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Between(min, max) => count >= min && count <= max,
            Arity::Any => true,
        }
    }
}

pub type BuiltinCallback = std::rc::Rc<dyn Fn(&mut Evaluator, &[Literal]) -> Result<Option<Literal>, pattern_core::PatternError>>;

/// A host-registered builtin function.
#[derive(Clone)]
pub struct BuiltinFunction {
    pub namespace: String,
    pub name: String,
    pub arity: Arity,
    pub dangerous: bool,
    pub callback: BuiltinCallback,
}

impl BuiltinFunction {
    /// Validate the qualified name: alphanumeric plus `_`/`.` only, since
    /// it's a string trusted straight into a dispatch table.
    fn validate_symbol(symbol: &str) -> Result<(), String> {
        if symbol.is_empty() {
            return Err("function name cannot be empty".to_string());
        }
        for c in symbol.chars() {
            if !c.is_alphanumeric() && c != '_' && c != '.' {
                return Err(format!(
                    "invalid character '{c}' in function name '{symbol}': only alphanumerics, '_' and '.' are allowed"
                ));
            }
        }
        Ok(())
    }

    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        arity: Arity,
        dangerous: bool,
        callback: BuiltinCallback,
    ) -> Result<Self, String> {
        let namespace = namespace.into();
        let name = name.into();
        Self::validate_symbol(&namespace)?;
        Self::validate_symbol(&name)?;
        Ok(Self { namespace, name, arity, dangerous, callback })
    }

    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}::{}", self.namespace, self.name)
        }
    }
}

/// Host decision for a builtin registered as `dangerous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DangerousPolicy {
    Allow,
    Deny,
    /// Consult `EvaluatorConfig::dangerous_gate` at call time.
    Ask,
}

/// Resource limits and policy knobs for one evaluation run. Constructed with a builder, mirroring `CompilerConfig`.
#[derive(Clone)]
pub struct EvaluatorConfig {
    pub max_evaluation_depth: u32,
    pub max_array_length: u64,
    pub max_pattern_count: u64,
    pub max_loop_iterations: u64,
    pub max_validation_errors: usize,
    pub allow_main_section_edits: bool,
    pub dangerous_policy: DangerousPolicy,
    pub dangerous_gate: Option<std::rc::Rc<dyn Fn(&str) -> bool>>,
    pub functions: HashMap<(String, String), BuiltinFunction>,
    /// `[[format]]`/`[[format_read]]`/`[[format_write]]` targets.
    pub formatters: HashMap<String, FormatterFn>,
    /// `[[transform]]` targets.
    pub transforms: HashMap<String, TransformFn>,
    /// `[[pointer_base]]` targets.
    pub pointer_bases: HashMap<String, PointerBaseFn>,
}

impl std::fmt::Debug for EvaluatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorConfig")
            .field("max_evaluation_depth", &self.max_evaluation_depth)
            .field("max_array_length", &self.max_array_length)
            .field("max_pattern_count", &self.max_pattern_count)
            .field("max_loop_iterations", &self.max_loop_iterations)
            .field("max_validation_errors", &self.max_validation_errors)
            .field("allow_main_section_edits", &self.allow_main_section_edits)
            .field("dangerous_policy", &self.dangerous_policy)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("formatters", &self.formatters.keys().collect::<Vec<_>>())
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .field("pointer_bases", &self.pointer_bases.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_evaluation_depth: 128,
            max_array_length: 1 << 20,
            max_pattern_count: 1 << 20,
            max_loop_iterations: 1 << 24,
            max_validation_errors: 100,
            allow_main_section_edits: false,
            dangerous_policy: DangerousPolicy::Ask,
            dangerous_gate: None,
            functions: HashMap::new(),
            formatters: HashMap::new(),
            transforms: HashMap::new(),
            pointer_bases: HashMap::new(),
        }
    }
}

impl EvaluatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pattern_count(mut self, n: u64) -> Self {
        self.max_pattern_count = n;
        self
    }

    pub fn with_max_evaluation_depth(mut self, n: u32) -> Self {
        self.max_evaluation_depth = n;
        self
    }

    pub fn with_max_array_length(mut self, n: u64) -> Self {
        self.max_array_length = n;
        self
    }

    pub fn with_max_loop_iterations(mut self, n: u64) -> Self {
        self.max_loop_iterations = n;
        self
    }

    pub fn with_allow_main_section_edits(mut self, allow: bool) -> Self {
        self.allow_main_section_edits = allow;
        self
    }

    pub fn with_dangerous_policy(mut self, policy: DangerousPolicy) -> Self {
        self.dangerous_policy = policy;
        self
    }

    pub fn with_dangerous_gate(mut self, gate: std::rc::Rc<dyn Fn(&str) -> bool>) -> Self {
        self.dangerous_gate = Some(gate);
        self
    }

    pub fn with_function(mut self, function: BuiltinFunction) -> Self {
        self.functions.insert((function.namespace.clone(), function.name.clone()), function);
        self
    }

    pub fn with_formatter(mut self, name: impl Into<String>, f: FormatterFn) -> Self {
        self.formatters.insert(name.into(), f);
        self
    }

    pub fn with_transform(mut self, name: impl Into<String>, f: TransformFn) -> Self {
        self.transforms.insert(name.into(), f);
        self
    }

    pub fn with_pointer_base(mut self, name: impl Into<String>, f: PointerBaseFn) -> Self {
        self.pointer_bases.insert(name.into(), f);
        self
    }
}
