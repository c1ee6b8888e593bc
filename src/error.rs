// ABOUTME: Error types for the reader, the compiler, and native functions

use crate::value::Value;
use crate::vm::Fiber;
use std::rc::Rc;
use thiserror::Error;

// ===== Arity constant strings (eliminates allocations in error paths) =====
pub const ARITY_ONE: &str = "1";
pub const ARITY_TWO: &str = "2";
pub const ARITY_AT_LEAST_ONE: &str = "at least 1";

/// Misuse of the parser API, as opposed to a syntax error in the input.
/// Syntax errors are sticky state read back through `Parser::error`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserUsage {
    #[error("parser is dead, cannot consume")]
    Dead,

    #[error("parser has unchecked error, cannot consume")]
    UncheckedError,

    #[error("cannot insert value into parser")]
    CannotInsert,
}

/// A syntax error with the position the parser had reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at line {line}, column {column}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// A failed compilation: the first error wins, with the source position the
/// compiler's cursor had at the time. When a macro blew up, the fiber the
/// expansion engine handed back rides along for diagnostics.
#[derive(Error, Debug, Clone)]
#[error("{message} at line {line}, column {column}")]
pub struct CompileError {
    pub message: String,
    pub line: i32,
    pub column: i32,
    pub macro_fiber: Option<Rc<Fiber>>,
}

/// Errors raised by native functions when the macro engine runs them.
#[derive(Error, Debug, Clone)]
pub enum EvalError {
    /// Type mismatch with function name, expected type, actual type, and position
    #[error("{function}: expected {expected}, got {actual} at argument {position}")]
    TypeMismatch {
        function: String,
        expected: String,
        actual: String,
        position: usize,
    },

    /// Arity error with function name, expected count/range, and actual count
    #[error("{function}: expected {expected} argument{}, got {actual}", if *.expected == "1" { "" } else { "s" })]
    ArityError {
        function: String,
        expected: String,
        actual: usize,
    },

    /// Runtime error with function context
    #[error("{function}: {message}")]
    RuntimeError { function: String, message: String },

    #[error("value is not callable")]
    NotCallable,
}

impl EvalError {
    /// Create a type mismatch error with full context
    pub fn type_error(function: &str, expected: &str, actual: &Value, position: usize) -> Self {
        EvalError::TypeMismatch {
            function: function.to_string(),
            expected: expected.to_string(),
            actual: actual.type_name().to_string(),
            position,
        }
    }

    /// Create an arity error with expected and actual counts
    pub fn arity_error(function: &str, expected: impl Into<String>, actual: usize) -> Self {
        EvalError::ArityError {
            function: function.to_string(),
            expected: expected.into(),
            actual,
        }
    }

    /// Create a runtime error with function context
    pub fn runtime_error(function: &str, message: impl Into<String>) -> Self {
        EvalError::RuntimeError {
            function: function.to_string(),
            message: message.into(),
        }
    }
}
