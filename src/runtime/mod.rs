//! Engine orchestrator and public API
//!
//! This module provides the `Engine` struct that owns configuration and
//! storage, and builds [`Dispatcher`]s for embedding or controlling routines.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::interpreter::CacheKeying;

// Submodules
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod machine;
pub mod registry;
pub mod stack;
pub mod storage;
pub mod template;

/// Configuration for the Encore engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for engine storage (default: .encore/)
    pub root: PathBuf,

    /// How intercepted calls are identified across replays
    pub keying: CacheKeying,

    /// Maximum number of frames on one session's stack
    pub max_nesting_depth: usize,

    /// Upper bound on intercepted calls in one evaluation pass
    pub max_calls_per_pass: usize,

    /// Longest list the `range` builtin may produce
    pub max_range_len: usize,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".encore"),
            keying: CacheKeying::Content,
            max_nesting_depth: 16,
            max_calls_per_pass: 10_000,
            max_range_len: 100_000,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Most verbose tracing level this configuration asks for
    pub fn tracing_level(&self) -> tracing::Level {
        if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    fn validate(&self) -> error::Result<()> {
        if self.max_nesting_depth == 0 {
            return Err(EngineError::Config(
                "max_nesting_depth must be at least 1".to_string(),
            ));
        }
        if self.max_calls_per_pass == 0 {
            return Err(EngineError::Config(
                "max_calls_per_pass must be at least 1".to_string(),
            ));
        }
        if self.max_range_len == 0 {
            return Err(EngineError::Config(
                "max_range_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

use dispatcher::{ActionHost, Dispatcher};
use registry::RoutineRegistry;
use storage::FileStore;

/// File-backed engine
///
/// Owns the configuration and the store under `config.root`.
pub struct Engine {
    config: EngineConfig,
    store: FileStore,
}

impl Engine {
    /// Create an engine over an already initialized root
    pub fn new(config: EngineConfig) -> error::Result<Self> {
        config.validate()?;
        let store = FileStore::new(config.root.clone());
        Ok(Self { config, store })
    }

    /// Initialize storage directories and write the configuration
    pub fn init(config: EngineConfig) -> error::Result<Self> {
        config.validate()?;
        storage::init_storage(&config.root)?;
        storage::write_config(&config)?;
        tracing::info!(root = %config.root.display(), "initialized engine storage");
        Self::new(config)
    }

    /// Load an existing engine from storage
    pub fn load(root: PathBuf) -> error::Result<Self> {
        let config = storage::load_config(&root)?;
        Self::new(config)
    }

    /// Get the current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the store
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Build a dispatcher over this engine's store
    pub fn dispatcher<H: ActionHost>(
        &self,
        registry: RoutineRegistry,
        host: H,
    ) -> Dispatcher<FileStore, H> {
        Dispatcher::new(registry, self.store.clone(), host, self.config.clone())
    }
}

// Re-export commonly used types
pub use context::{EventSink, RecordingSink, RunContext, RunEvent, SessionId, TracingSink};
pub use dispatcher::{ActionOutcome, DeferringHost, RunOutcome};
pub use error::{EngineError, RegistryError, StoreError};
pub use machine::{FnMachine, StateMachine, Step};
pub use registry::{Designation, Routine, RoutineBody, RoutineKind, RoutineManifest};
pub use stack::{FrameId, RoutineFrame, RoutineStack};
pub use storage::{KvStore, MemoryStore};
