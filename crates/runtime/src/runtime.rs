//! The embedding façade: owns the data source, the
//! pluggable lexer/parser, and one evaluation's results. A host calls a
//! handful of free-standing entry points against a config object it
//! built with a small builder, rather than threading evaluator
//! internals through its own code.
//!
//! Lexing and parsing PL source text are out of scope for this crate;
//! [`Runtime`] takes trait objects for both so a host can plug in its
//! own, and exposes [`Runtime::execute_program`] to run an already-built
//! [`Program`] directly, which is how this crate's own test fixtures
//! exercise the evaluator.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use pattern_core::io::ByteIo;
use pattern_core::section::CallbackSection;
use pattern_core::{Literal, PatternError};
use pattern_lang::ast::Program;
use pattern_lang::Pattern;

use crate::config::{Arity, BuiltinFunction, EvaluatorConfig};
use crate::dispatch::create_patterns;
use crate::evaluator::Evaluator;
use crate::frontend::{Lexer, Parser};
use crate::log::LogLevel;

type ReaderFn = Arc<dyn Fn(u64, &mut [u8]) + Send + Sync>;
type WriterFn = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;
pub type PragmaHandler = Rc<dyn Fn(&mut Evaluator, &str) -> Result<(), PatternError>>;

/// The host-supplied data source,
/// recreated as a fresh [`CallbackSection`] for every run since a run
/// owns its own [`Evaluator`].
struct DataSource {
    base_address: u64,
    size: u64,
    reader: ReaderFn,
    writer: Option<WriterFn>,
}

/// One embedding of the interpreter. Configuration (data source, include
/// paths, pragmas, builtins) survives across runs; per-run results
/// (patterns, out variables, error, console log) are overwritten by the
/// next `execute_*` call.
pub struct Runtime {
    config: EvaluatorConfig,
    data_source: Option<DataSource>,
    include_paths: Vec<String>,
    pragmas: HashMap<String, PragmaHandler>,
    lexer: Option<Box<dyn Lexer>>,
    parser: Option<Box<dyn Parser>>,
    patterns: Vec<Pattern>,
    out_vars: HashMap<String, Literal>,
    error: Option<PatternError>,
    console_log: Vec<(LogLevel, String)>,
    /// The byte/bit store the last run's patterns were materialized
    /// against. `Pattern::value`/`formatted_value` take an `&ByteIo`
    /// rather than owning their data, so a caller reading
    /// `get_patterns()` reads through this.
    io: ByteIo,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            config: EvaluatorConfig::new(),
            data_source: None,
            include_paths: Vec::new(),
            pragmas: HashMap::new(),
            lexer: None,
            parser: None,
            patterns: Vec::new(),
            out_vars: HashMap::new(),
            error: None,
            console_log: Vec::new(),
            io: ByteIo::new(),
        }
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EvaluatorConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn with_lexer(mut self, lexer: Box<dyn Lexer>) -> Self {
        self.lexer = Some(lexer);
        self
    }

    pub fn with_parser(mut self, parser: Box<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Registers the host's byte-access callbacks and installs a
    /// synthetic MAIN section backed by them.
    pub fn set_data_source(
        &mut self,
        base_address: u64,
        size: u64,
        reader: impl Fn(u64, &mut [u8]) + Send + Sync + 'static,
        writer: Option<Arc<dyn Fn(u64, &[u8]) + Send + Sync>>,
    ) {
        self.data_source = Some(DataSource { base_address, size, reader: Arc::new(reader), writer });
    }

    pub fn set_include_paths(&mut self, paths: Vec<String>) {
        self.include_paths = paths;
    }

    pub fn include_paths(&self) -> &[String] {
        &self.include_paths
    }

    pub fn add_pragma(&mut self, name: impl Into<String>, handler: PragmaHandler) {
        self.pragmas.insert(name.into(), handler);
    }

    pub fn pragma_handlers(&self) -> &HashMap<String, PragmaHandler> {
        &self.pragmas
    }

    /// Register a host builtin under `ns::name`.
    pub fn add_function(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        arity: Arity,
        dangerous: bool,
        callback: crate::config::BuiltinCallback,
    ) -> Result<(), String> {
        let function = BuiltinFunction::new(namespace, name, arity, dangerous, callback)?;
        self.config = std::mem::take(&mut self.config).with_function(function);
        Ok(())
    }

    pub fn get_patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn get_out_variables(&self) -> &HashMap<String, Literal> {
        &self.out_vars
    }

    pub fn get_error(&self) -> Option<&PatternError> {
        self.error.as_ref()
    }

    pub fn get_console_log(&self) -> &[(LogLevel, String)] {
        &self.console_log
    }

    /// The byte store `get_patterns()`'s entries should be read against,
    /// e.g. `pattern.value(rt.io())`.
    pub fn io(&self) -> &ByteIo {
        &self.io
    }

    fn fresh_evaluator(&self, abort: Arc<AtomicBool>) -> Evaluator {
        let mut ev = Evaluator::new(self.config.clone(), abort);
        if let Some(ds) = &self.data_source {
            let reader = Arc::clone(&ds.reader);
            let writer = ds.writer.clone().map(|w| -> Box<dyn Fn(u64, &[u8]) + Send + Sync> { Box::new(move |off, buf| w(off, buf)) });
            ev.io.sections_mut().set_main(CallbackSection::new(ds.base_address, ds.size, move |off, buf| reader(off, buf), writer));
            ev.io.allow_main_section_edits = self.config.allow_main_section_edits;
        }
        ev
    }

    /// Drive a pre-built [`Program`] through declaration registration,
    /// top-level evaluation and (if present) `main`, mirroring the
    /// original evaluator's per-run reset by constructing a
    /// brand new [`Evaluator`] every call.
    pub fn execute_program(
        &mut self,
        program: &Program,
        env_vars: HashMap<String, Literal>,
        in_vars: HashMap<String, Literal>,
        check_result: bool,
    ) -> bool {
        let abort = Arc::new(AtomicBool::new(false));
        let mut ev = self.fresh_evaluator(abort);
        ev.env_vars = env_vars;
        ev.in_vars = in_vars;

        let result = self.run_program(&mut ev, program, check_result);
        self.patterns = std::mem::take(&mut ev.scopes[0].patterns);
        self.out_vars = std::mem::take(&mut ev.out_vars);
        self.console_log = ev.console_log.entries().to_vec();
        self.io = std::mem::replace(&mut ev.io, ByteIo::new());

        match result {
            Ok(ok) => {
                self.error = None;
                ok
            }
            Err(e) => {
                self.error = Some(e);
                false
            }
        }
    }

    fn run_program(&self, ev: &mut Evaluator, program: &Program, check_result: bool) -> Result<bool, PatternError> {
        for item in &program.items {
            let patterns = create_patterns(ev, item)?;
            ev.scopes[0].patterns.extend(patterns);
        }
        if let Some(main) = ev.user_functions.get("main").cloned() {
            if !main.params.is_empty() {
                return Err(PatternError::eval("E_MAIN_ARITY", "entry point function 'main' may not have any parameters"));
            }
            let result = crate::dispatch::evaluate_call(ev, "main", &[])?;
            if check_result {
                let code = result.as_i128().unwrap_or(0);
                return Ok(code == 0);
            }
        }
        Ok(true)
    }

    /// Lex, parse and evaluate a source string. Requires a
    /// lexer and parser to have been installed; this crate ships neither.
    pub fn execute_string(
        &mut self,
        source: &str,
        env_vars: HashMap<String, Literal>,
        in_vars: HashMap<String, Literal>,
        check_result: bool,
    ) -> bool {
        let program = match self.lex_and_parse(source, "<source>") {
            Ok(program) => program,
            Err(e) => {
                self.error = Some(e);
                self.patterns.clear();
                self.out_vars.clear();
                return false;
            }
        };
        self.execute_program(&program, env_vars, in_vars, check_result)
    }

    pub fn execute_file(&mut self, path: &Path, env_vars: HashMap<String, Literal>, in_vars: HashMap<String, Literal>) -> bool {
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                self.error = Some(PatternError::eval("E_IO", format!("failed to read '{}': {e}", path.display())));
                return false;
            }
        };
        self.execute_string(&source, env_vars, in_vars, true)
    }

    fn lex_and_parse(&self, source: &str, file: &str) -> Result<Program, PatternError> {
        let lexer = self
            .lexer
            .as_ref()
            .ok_or_else(|| PatternError::new(pattern_core::ErrorKind::Lex, "E_NO_LEXER", "no lexer configured"))?;
        let parser = self
            .parser
            .as_ref()
            .ok_or_else(|| PatternError::new(pattern_core::ErrorKind::Parse, "E_NO_PARSER", "no parser configured"))?;
        let tokens = lexer.lex(source, file)?;
        parser.parse(&tokens, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pattern_lang::ast::*;

    fn u32_read_program(offset: u64) -> Program {
        Program {
            items: vec![Item::Variable(VariableDecl {
                name: "x".into(),
                ty: TypedExpr { ty: TypeExpr::Builtin(BuiltinType::U32), endian: None },
                placement: Some(Placement { offset: Expr::Literal(Literal::U128(offset as u128)), section: None }),
                in_out: None,
                attributes: HashMap::new(),
                loc: SourceLocation::new(file_name(), 1),
            })],
        }
    }

    fn file_name() -> String {
        "<test>".into()
    }

    #[test]
    fn executes_program_without_main_and_reports_patterns() {
        let mut rt = Runtime::new();
        let bytes = vec![0x89u8, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        rt.set_data_source(0, bytes.len() as u64, move |off, buf| {
            let off = off as usize;
            for (i, b) in buf.iter_mut().enumerate() {
                *b = bytes.get(off + i).copied().unwrap_or(0);
            }
        }, None);
        let ok = rt.execute_program(&u32_read_program(0), HashMap::new(), HashMap::new(), true);
        assert!(ok, "{:?}", rt.get_error());
        assert_eq!(rt.get_patterns().len(), 1);
        let value = rt.get_patterns()[0].value(rt.io()).unwrap();
        assert_eq!(value.as_u128(), Some(0x474E5089));
    }

    #[test]
    fn failing_assert_reports_nonzero_and_logs_message() {
        let mut rt = Runtime::with_config(crate::builtins::with_minimal_std(EvaluatorConfig::new()));
        let program = Program {
            items: vec![Item::Statement(Stmt::Expr(Expr::Call {
                name: "std::assert".into(),
                args: vec![Expr::Literal(Literal::Bool(false)), Expr::Literal(Literal::String("Error".into()))],
            }))],
        };
        let ok = rt.execute_program(&program, HashMap::new(), HashMap::new(), true);
        assert!(!ok);
        assert_eq!(rt.get_error().map(|e| e.code), Some("E_ASSERT"));
        assert!(rt.get_console_log().iter().any(|(_, msg)| msg == "Error"));
    }

    #[test]
    fn no_lexer_configured_is_a_lex_error() {
        let mut rt = Runtime::new();
        let ok = rt.execute_string("u32 x @ 0x0;", HashMap::new(), HashMap::new(), false);
        assert!(!ok);
        assert_eq!(rt.get_error().map(|e| e.code), Some("E_NO_LEXER"));
    }
}
