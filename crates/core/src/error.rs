//! Shared error type for every phase of the interpreter.
//!
//! A plain hand-rolled enum with a `Display` impl and a blanket
//! `std::error::Error`, no `thiserror`. Every crate above this one wraps
//! its own failures in [`PatternError`] so the runtime façade can report
//! `LexError`/`ParseError`/`ValidateError`/`EvalError`/`FormatError`
//! uniformly.

use std::fmt;

/// Where in the source an error was raised.
///
/// A `(file, line, column)` triple, the shape every reported error names
/// as its origin.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// The five error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lex,
    Parse,
    Validate,
    Eval,
    Format,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Lex => "LexError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Validate => "ValidateError",
            ErrorKind::Eval => "EvalError",
            ErrorKind::Format => "FormatError",
        };
        write!(f, "{s}")
    }
}

/// A diagnostic carrying a code, message, optional hint and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    pub hint: Option<String>,
    pub location: Option<SourceLocation>,
}

impl PatternError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            hint: None,
            location: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn eval(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Eval, code, message)
    }

    pub fn validate(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validate, code, message)
    }

    pub fn format(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, code, message)
    }
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.kind, self.code, self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " ({loc})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " - {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PatternError {}
