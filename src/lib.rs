//! Encore – a durable, resumable routine execution engine
//!
//! This crate runs multi-step routines for LLM-driven agents:
//! - Programmatic routines evaluated by a replaying interpreter that intercepts every call
//! - A function result cache so resumed programs never re-run completed effects
//! - Versioned interpreter snapshots that can be resumed in another process
//! - A persisted per-session routine call stack with nested invocation
//! - Instruction-template and explicit state-machine routine variants

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Replaying interpreter for programmatic routines
pub mod interpreter;
/// Registry, call stack, persistence and dispatcher
pub mod runtime;

// Re-export key types for convenience
pub use interpreter::{CallArgs, CallKey, PausedExecution, SuspensionKind, Value};
pub use runtime::dispatcher::{ActionHost, Dispatcher, RunOutcome};
pub use runtime::registry::RoutineRegistry;
pub use runtime::{Engine, EngineConfig};

/// Current version of the Encore engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
