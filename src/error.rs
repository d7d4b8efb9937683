// ABOUTME: Error classes, stable error codes, and parse-time diagnostics

use std::fmt;
use thiserror::Error;

/// The error classes of spec.md §7. All but `Security` are catchable by
/// `try` or by `{result, error} <== ...` destructuring; `Security` is not,
/// to preserve sandbox guarantees even inside a `try`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Syntax,
    Type,
    Value,
    State,
    Io,
    Network,
    Database,
    Security,
    Arity,
    Undef,
}

impl ErrorClass {
    pub fn catchable(self) -> bool {
        !matches!(self, ErrorClass::Security | ErrorClass::Syntax)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Syntax => "syntax",
            ErrorClass::Type => "type",
            ErrorClass::Value => "value",
            ErrorClass::State => "state",
            ErrorClass::Io => "io",
            ErrorClass::Network => "network",
            ErrorClass::Database => "database",
            ErrorClass::Security => "security",
            ErrorClass::Arity => "arity",
            ErrorClass::Undef => "undef",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A runtime error, the payload of `Value::Error`. Matches spec.md §3.3 /
/// §7: `{class, code, message, hints}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    pub hints: Vec<String>,
}

impl RuntimeError {
    pub fn new(class: ErrorClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError {
            class,
            code: code.into(),
            message: message.into(),
            hints: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    // ---- Stable-code constructors used throughout the evaluator ----

    pub fn undefined(name: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Undef,
            "UNDEF-0001",
            format!("undefined variable: {name}"),
        )
    }

    pub fn undefined_method(type_name: &str, method: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Undef,
            "UNDEF-0002",
            format!("{type_name} has no method `{method}`"),
        )
    }

    pub fn arity(function: &str, expected: impl Into<String>, got: usize) -> Self {
        RuntimeError::new(
            ErrorClass::Arity,
            "ARITY-0001",
            format!(
                "{function}: expected {} argument(s), got {got}",
                expected.into()
            ),
        )
    }

    pub fn type_mismatch(context: &str, expected: &str, actual: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Type,
            "TYPE-0001",
            format!("{context}: expected {expected}, got {actual}"),
        )
    }

    pub fn destructure_typed_dict(type_name: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Value,
            "DESTRUCT-0001",
            format!("cannot destructure a {type_name} value"),
        )
        .with_hint("Did you mean `import <path>`?".to_string())
    }

    pub fn destructure_missing_key(key: &str, type_name: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Value,
            "DESTRUCT-0002",
            format!("{type_name} has no field `{key}`"),
        )
    }

    pub fn bad_identifier(ident: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Value,
            "VAL-0003",
            format!("`{ident}` is not a valid identifier for SQL interpolation"),
        )
        .with_hint("identifiers must match ^[A-Za-z_][A-Za-z0-9_]{0,63}$".to_string())
    }

    pub fn security_denied(op: &str, target: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Security,
            "SEC-0001",
            format!("{op} denied for `{target}` by security policy"),
        )
    }

    pub fn io_not_found(path: &str) -> Self {
        RuntimeError::new(ErrorClass::Io, "IO-0003", format!("not found: {path}"))
    }

    pub fn io_failure(message: impl Into<String>) -> Self {
        RuntimeError::new(ErrorClass::Io, "IO-0001", message.into())
    }

    pub fn network_failure(message: impl Into<String>) -> Self {
        RuntimeError::new(ErrorClass::Network, "NET-0001", message.into())
    }

    pub fn database_failure(message: impl Into<String>) -> Self {
        RuntimeError::new(ErrorClass::Database, "DB-0001", message.into())
    }

    pub fn database_in_transaction() -> Self {
        RuntimeError::new(
            ErrorClass::Database,
            "DB-0002",
            "connection already has a transaction in progress",
        )
    }

    pub fn state_error(message: impl Into<String>) -> Self {
        RuntimeError::new(ErrorClass::State, "STATE-0001", message.into())
    }

    pub fn division_by_zero() -> Self {
        RuntimeError::new(ErrorClass::Value, "VAL-0001", "division by zero")
    }

    pub fn currency_mismatch(a: &str, b: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Value,
            "VAL-0002",
            format!("cannot combine money in {a} with money in {b}"),
        )
    }

    pub fn index_out_of_range(index: i64, len: usize) -> Self {
        RuntimeError::new(
            ErrorClass::Value,
            "VAL-0004",
            format!("index {index} out of range for array of length {len}"),
        )
    }

    pub fn value_decode_error(format: &str, message: impl Into<String>) -> Self {
        RuntimeError::new(
            ErrorClass::Value,
            "VAL-0005",
            format!("failed to decode {format}: {}", message.into()),
        )
    }

    pub fn not_callable(type_name: &str) -> Self {
        RuntimeError::new(
            ErrorClass::Type,
            "TYPE-0002",
            format!("value of type {type_name} is not callable"),
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.class, self.code, self.message)?;
        for hint in &self.hints {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}

/// Diagnostic position, attached to every token and AST node (spec.md §3.1/§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Lex/parse-time failures. These are `syntax`-class and never catchable
/// from inside a running program (spec.md §7): by the time a `try`
/// expression could run, the source has already failed to parse.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParsleyError {
    #[error("{pos}: unexpected character {ch:?}")]
    UnexpectedChar { ch: char, pos: Position },

    #[error("{pos}: unterminated {kind}")]
    Unterminated { kind: &'static str, pos: Position },

    #[error("{pos}: {message}")]
    UnexpectedToken { message: String, pos: Position },

    #[error("{pos}: {message}")]
    Malformed { message: String, pos: Position },
}

impl ParsleyError {
    pub fn pos(&self) -> Position {
        match self {
            ParsleyError::UnexpectedChar { pos, .. }
            | ParsleyError::Unterminated { pos, .. }
            | ParsleyError::UnexpectedToken { pos, .. }
            | ParsleyError::Malformed { pos, .. } => *pos,
        }
    }
}
