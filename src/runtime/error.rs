//! Error types for the Encore engine
//!
//! Domain errors use thiserror; interpreter-level errors convert into the
//! top-level [`EngineError`] at the dispatcher boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::interpreter::{CacheCorruptionError, EvalError, ParseError};

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Routine program text is malformed
    #[error("Parse error in routine '{routine}': {source}")]
    Parse {
        /// Designation of the routine whose program failed to parse
        routine: String,
        /// Parser diagnostic
        #[source]
        source: ParseError,
    },

    /// Designation is not registered (or is malformed)
    #[error("Unknown routine '{0}'")]
    UnknownRoutine(String),

    /// Persisted interpreter state cannot be used; the routine must restart
    #[error("Cannot resume routine '{routine}': {source}")]
    CacheCorruption {
        /// Designation of the routine whose state is unusable
        routine: String,
        /// What was wrong with the snapshot
        #[source]
        source: CacheCorruptionError,
    },

    /// Program evaluation failed
    #[error("Evaluation error in routine '{routine}': {source}")]
    Eval {
        /// Designation of the failing routine
        routine: String,
        /// Evaluation diagnostic
        #[source]
        source: EvalError,
    },

    /// Error raised by an action, the language model collaborator or a state machine
    #[error(transparent)]
    Action(anyhow::Error),

    /// Registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Template rendering failed
    #[error("Template error in routine '{routine}': {detail}")]
    Template {
        /// Designation of the instruction routine
        routine: String,
        /// Error details
        detail: String,
    },

    /// Nested routine calls exceeded the configured depth
    #[error("Routine nesting depth limit {0} exceeded")]
    NestingTooDeep(usize),

    /// Operation requires a frame but the session stack is empty
    #[error("Session '{0}' has no active routine frame")]
    EmptyStack(String),

    /// A result was supplied for a call the top frame is not waiting on
    #[error("No suspended interpreter state for frame {0}")]
    NotSuspended(String),

    /// Supplied result does not answer the call the top frame waits on
    #[error("Frame {frame} is not waiting on call '{key}'")]
    UnexpectedResult {
        /// Frame that received the result
        frame: String,
        /// Call identity that was supplied
        key: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Registry-specific errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Designation already registered
    #[error("Routine '{0}' is already registered")]
    Duplicate(String),

    /// Skill or routine name is not a valid designation part
    #[error("Invalid routine designation '{0}'")]
    InvalidDesignation(String),

    /// Manifest could not be read or parsed
    #[error("Invalid routine manifest {path}: {detail}")]
    Manifest {
        /// Manifest path
        path: PathBuf,
        /// Error details
        detail: String,
    },
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key is not a valid relative storage key
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Stored record could not be decoded
    #[error("Corrupted record '{key}': {detail}")]
    Corrupted {
        /// Storage key of the record
        key: String,
        /// Error details
        detail: String,
    },

    /// Config file error
    #[error("Config file error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Convenience result alias for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
