//! Evaluator core: scope stack, heap, limits, abort and
//! debug state. The tree-walk itself (`create_patterns`/`evaluate`/
//! `execute`) lives in [`crate::dispatch`] as free functions over this
//! struct, walking [`pattern_lang::ast`] types from outside the AST
//! crate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pattern_core::io::ByteIo;
use pattern_core::{Literal, PatternError, PatternId};
use pattern_lang::Pattern;

use pattern_lang::ast::{BitfieldDecl, EnumDecl, FunctionDefinition, StructDecl, TypeDecl, UnionDecl};

use crate::config::{BuiltinFunction, DangerousPolicy, EvaluatorConfig};
use crate::control::ControlFlow;
use crate::log::{ConsoleLog, LogLevel};
use crate::scope::Scope;

/// Debugger stepping mode consulted from the same `updateRuntime` hook as
/// breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteppingMode {
    Continue,
    StepOver,
    StepInto,
}

/// Everything a running evaluation needs, scoped to one `execute_*` call.
/// Reset deterministically between runs
/// by replacing the struct via [`Evaluator::new`] rather than mutating it
/// back to a baseline.
pub struct Evaluator {
    pub io: ByteIo,
    pub scopes: Vec<Scope>,
    pub template_stack: Vec<Vec<Pattern>>,
    pub config: EvaluatorConfig,
    pub console_log: ConsoleLog,
    pattern_count: u64,
    depth: u32,
    pub control_flow: Option<ControlFlow>,
    pub abort: Arc<AtomicBool>,
    pub breakpoints: HashSet<u32>,
    pub stepping: SteppingMode,
    pub pause_next: bool,
    next_pattern_id: PatternId,
    pub out_vars: HashMap<String, Literal>,
    pub env_vars: HashMap<String, Literal>,
    pub in_vars: HashMap<String, Literal>,
    pub type_decls: HashMap<String, TypeDecl>,
    pub struct_decls: HashMap<String, StructDecl>,
    pub union_decls: HashMap<String, UnionDecl>,
    pub enum_decls: HashMap<String, EnumDecl>,
    pub bitfield_decls: HashMap<String, BitfieldDecl>,
    pub user_functions: HashMap<String, FunctionDefinition>,
    pub current_line: u32,
    pub on_breakpoint: Option<Box<dyn FnMut(u32)>>,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig, abort: Arc<AtomicBool>) -> Self {
        Self {
            io: ByteIo::new(),
            scopes: vec![Scope::new(0)],
            template_stack: Vec::new(),
            config,
            console_log: ConsoleLog::new(),
            pattern_count: 0,
            depth: 0,
            control_flow: None,
            abort,
            breakpoints: HashSet::new(),
            stepping: SteppingMode::Continue,
            pause_next: false,
            next_pattern_id: 1,
            out_vars: HashMap::new(),
            env_vars: HashMap::new(),
            in_vars: HashMap::new(),
            type_decls: HashMap::new(),
            struct_decls: HashMap::new(),
            union_decls: HashMap::new(),
            enum_decls: HashMap::new(),
            bitfield_decls: HashMap::new(),
            user_functions: HashMap::new(),
            current_line: 0,
            on_breakpoint: None,
        }
    }

    pub fn alloc_pattern_id(&mut self) -> PatternId {
        let id = self.next_pattern_id;
        self.next_pattern_id += 1;
        id
    }

    /// Count one more pattern against the configured limit.
    pub fn account_pattern_created(&mut self) -> Result<(), PatternError> {
        self.pattern_count += 1;
        if self.pattern_count > self.config.max_pattern_count {
            return Err(PatternError::eval(
                "E_PATTERN_LIMIT",
                format!("pattern count exceeded the configured limit of {}", self.config.max_pattern_count),
            ));
        }
        Ok(())
    }

    pub fn push_scope(&mut self) -> Result<(), PatternError> {
        self.depth += 1;
        if self.depth > self.config.max_evaluation_depth {
            return Err(PatternError::eval(
                "E_DEPTH_LIMIT",
                format!("evaluation depth exceeded the configured limit of {}", self.config.max_evaluation_depth),
            ));
        }
        let heap_start_size = self.io.sections().heap_len();
        self.scopes.push(Scope::new(heap_start_size));
        Ok(())
    }

    pub fn pop_scope(&mut self) -> Scope {
        self.depth = self.depth.saturating_sub(1);
        let scope = self.scopes.pop().expect("global scope is never popped");
        self.io.sections_mut().truncate_heap(scope.heap_start_size);
        scope
    }

    pub fn current_scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("at least the global scope is always present")
    }

    pub fn current_scope(&self) -> &Scope {
        self.scopes.last().expect("at least the global scope is always present")
    }

    /// Resolve a name against the scope stack, innermost first, falling
    /// back to out/in/env variable maps.
    pub fn resolve_local(&self, name: &str) -> Option<&Pattern> {
        self.scopes.iter().rev().find_map(|s| s.locals.get(name))
    }

    pub fn resolve_local_mut(&mut self, name: &str) -> Option<&mut Pattern> {
        self.scopes.iter_mut().rev().find_map(|s| s.locals.get_mut(name))
    }

    pub fn resolve_template_param(&self, name: &str) -> Option<&Pattern> {
        self.template_stack.last()?.iter().find(|p| p.header.var_name.as_deref() == Some(name))
    }

    /// The per-node entry hook: advances
    /// the "current line" bookkeeping, polls the abort flag, and fires
    /// the breakpoint callback if one is armed for this line.
    pub fn update_runtime(&mut self, line: u32) -> Result<(), PatternError> {
        self.current_line = line;
        if self.abort.load(Ordering::SeqCst) {
            return Err(PatternError::eval("E_ABORTED", "evaluation was aborted"));
        }
        if self.pause_next || self.breakpoints.contains(&line) {
            self.pause_next = self.stepping == SteppingMode::StepInto;
            if let Some(cb) = self.on_breakpoint.as_mut() {
                cb(line);
            }
        }
        Ok(())
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.console_log.push(level, message);
    }

    pub fn lookup_function(&self, namespace: &str, name: &str) -> Option<&BuiltinFunction> {
        self.config.functions.get(&(namespace.to_string(), name.to_string()))
    }

    /// Consult the dangerous-function permission gate. `Ask` defers to the configured gate closure, defaulting to
    /// deny if none is installed.
    pub fn permits_dangerous_call(&self, qualified_name: &str) -> bool {
        match self.config.dangerous_policy {
            DangerousPolicy::Allow => true,
            DangerousPolicy::Deny => false,
            DangerousPolicy::Ask => self.config.dangerous_gate.as_ref().is_some_and(|gate| gate(qualified_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn new_evaluator() -> Evaluator {
        Evaluator::new(EvaluatorConfig::new(), Arc::new(AtomicBool::new(false)))
    }

    /// A cooperative abort takes effect on the next per-statement check,
    /// not only at the top of a run.
    #[test]
    fn update_runtime_reports_aborted_once_flag_is_set() {
        let mut ev = new_evaluator();
        ev.update_runtime(1).unwrap();
        ev.abort.store(true, Ordering::SeqCst);
        let err = ev.update_runtime(2).unwrap_err();
        assert_eq!(err.code, "E_ABORTED");
    }

    /// The configured pattern-count cap: once exceeded, every further
    /// pattern creation fails rather than silently continuing.
    #[test]
    fn account_pattern_created_enforces_the_configured_limit() {
        let mut ev = Evaluator::new(EvaluatorConfig::new().with_max_pattern_count(2), Arc::new(AtomicBool::new(false)));
        ev.account_pattern_created().unwrap();
        ev.account_pattern_created().unwrap();
        let err = ev.account_pattern_created().unwrap_err();
        assert_eq!(err.code, "E_PATTERN_LIMIT");
    }

    #[test]
    fn push_scope_enforces_the_configured_depth_limit() {
        let mut ev = Evaluator::new(EvaluatorConfig::new().with_max_evaluation_depth(1), Arc::new(AtomicBool::new(false)));
        ev.push_scope().unwrap();
        let err = ev.push_scope().unwrap_err();
        assert_eq!(err.code, "E_DEPTH_LIMIT");
    }
}
