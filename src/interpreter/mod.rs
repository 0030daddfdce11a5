//! Replayable interpreter for programmatic routines.
//!
//! Routine programs are written in a small script language and transformed
//! into an IR in which every call is an interception point. Evaluation always
//! starts from the top; calls whose results are cached are replayed, and the
//! first call without a result either runs (builtins, host-resolved calls) or
//! halts the pass with a [`PausedExecution`] signal.

/// Abstract syntax tree definitions for the script language.
pub mod ast;
/// Builder that transforms parsed programs into the interceptable IR.
pub mod builder;
/// Pure builtin functions.
pub mod builtins;
/// Function result cache and call identities.
pub mod cache;
/// Typed intermediate representation structures.
pub mod ir;
/// Parser for the script language.
pub mod parser;
/// Evaluator that runs programs against a cache and host.
pub mod runtime;
/// Versioned interpreter state snapshots.
pub mod snapshot;
/// Structured value handling for routine programs.
pub mod value;

pub use builder::{build_ir, compile, program_digest};
pub use cache::{CacheEntry, CacheKeying, CallKey, FunctionCache, key_for, key_for_site};
pub use ir::ProgramIr;
pub use parser::parse_program;
pub use runtime::{
    CallOutcome, CallRequest, EvalOptions, Evaluation, InterpreterHost, PausedExecution,
    RuntimeError, SuspensionKind, evaluate,
};
pub use snapshot::{CacheCorruptionError, InterpreterState, STATE_SCHEMA_VERSION};
pub use value::{CallArgs, Value};

use thiserror::Error;

/// Malformed program text. Fatal: never retried, never a suspension.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at line {line}, column {column}")]
pub struct ParseError {
    /// What went wrong.
    pub message: String,
    /// 1-based line of the offending token.
    pub line: usize,
    /// 1-based column of the offending token.
    pub column: usize,
}

impl ParseError {
    pub(crate) fn new(message: &str, line: usize, column: usize) -> Self {
        Self {
            message: message.to_string(),
            line,
            column,
        }
    }
}

/// Errors raised while evaluating a well-formed program.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// Read of a variable that was never assigned.
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// Operation applied to values of the wrong type.
    #[error("type error: {0}")]
    Type(String),

    /// Map has no such field.
    #[error("missing field '{0}'")]
    MissingField(String),

    /// List or string index outside its bounds.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index
        index: i64,
        /// Collection length
        len: usize,
    },

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Integer arithmetic overflowed.
    #[error("integer overflow")]
    Overflow,

    /// Builtin rejected its arguments.
    #[error("builtin '{name}' failed: {message}")]
    Builtin {
        /// Builtin name
        name: String,
        /// Error details
        message: String,
    },

    /// One pass made more intercepted calls than allowed.
    #[error("call budget of {0} calls per pass exceeded")]
    CallBudgetExceeded(usize),
}
