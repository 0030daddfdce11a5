//! Versioned interpreter state snapshots
//!
//! A snapshot bundles the function cache with the transformed program so a
//! suspended routine can be re-evaluated from the top in another process.
//!
//! Format: [4-byte magic `ENCR`] + [2-byte schema version (little-endian)] +
//! [preserves-packed state record]. The version is checked before the payload
//! is decoded so incompatible snapshots are rejected instead of misread.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cache::{CallKey, FunctionCache};
use super::ir::ProgramIr;
use super::runtime::PausedExecution;
use super::value::Value;

/// Leading bytes of every serialized interpreter state.
pub const STATE_MAGIC: &[u8; 4] = b"ENCR";

/// Schema version written by this build.
pub const STATE_SCHEMA_VERSION: u16 = 1;

const HEADER_LEN: usize = STATE_MAGIC.len() + 2;

/// Reasons a persisted interpreter state cannot be used to resume.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheCorruptionError {
    /// Fewer bytes than the header requires.
    #[error("snapshot truncated: {0} bytes")]
    Truncated(usize),

    /// Header does not start with the expected magic bytes.
    #[error("snapshot has an unrecognised header")]
    BadMagic,

    /// Snapshot written by an incompatible schema version.
    #[error("snapshot schema version {found} is not supported (expected {supported})")]
    UnsupportedVersion {
        /// Version found in the header
        found: u16,
        /// Version this build reads
        supported: u16,
    },

    /// Payload failed to decode.
    #[error("snapshot payload failed to decode: {0}")]
    Decode(String),

    /// State failed to encode.
    #[error("snapshot payload failed to encode: {0}")]
    Encode(String),

    /// Routine source changed since the snapshot was taken.
    #[error("routine program changed since snapshot (expected digest {expected}, found {found})")]
    ProgramChanged {
        /// Digest of the currently registered program
        expected: String,
        /// Digest recorded in the snapshot
        found: String,
    },
}

/// Resumable state of one programmatic routine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterState {
    /// Transformed program evaluated on every pass.
    pub program: ProgramIr,
    /// Results of calls resolved so far.
    pub cache: FunctionCache,
    /// Number of evaluation passes run against this state.
    pub passes: u64,
    /// Call the last pass halted on, if it did not return.
    pub pending: Option<PausedExecution>,
}

impl InterpreterState {
    /// Fresh state for a program with an empty cache.
    pub fn new(program: ProgramIr) -> Self {
        Self {
            program,
            cache: FunctionCache::new(),
            passes: 0,
            pending: None,
        }
    }

    /// Encode into the versioned wire format.
    pub fn serialize(&self) -> Result<Vec<u8>, CacheCorruptionError> {
        use preserves::PackedWriter;

        let mut payload = Vec::new();
        let mut writer = PackedWriter::new(&mut payload);
        preserves::serde::to_writer(&mut writer, self)
            .map_err(|e| CacheCorruptionError::Encode(e.to_string()))?;

        let mut result = Vec::with_capacity(HEADER_LEN + payload.len());
        result.extend_from_slice(STATE_MAGIC);
        result.extend_from_slice(&STATE_SCHEMA_VERSION.to_le_bytes());
        result.extend_from_slice(&payload);
        Ok(result)
    }

    /// Decode from the versioned wire format.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CacheCorruptionError> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheCorruptionError::Truncated(bytes.len()));
        }
        if &bytes[..STATE_MAGIC.len()] != STATE_MAGIC {
            return Err(CacheCorruptionError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != STATE_SCHEMA_VERSION {
            return Err(CacheCorruptionError::UnsupportedVersion {
                found: version,
                supported: STATE_SCHEMA_VERSION,
            });
        }
        preserves::serde::from_bytes(&bytes[HEADER_LEN..])
            .map_err(|e| CacheCorruptionError::Decode(e.to_string()))
    }

    /// Record the result of the pending call, if `key` names it.
    ///
    /// Returns false (and caches nothing) when the state is not waiting on `key`.
    pub fn resolve_pending(&mut self, key: &CallKey, value: Value) -> bool {
        match self.pending.take() {
            Some(paused) if &paused.cache_key == key => {
                self.cache.put(paused.cache_key, paused.name, paused.args, value);
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    /// Reject the snapshot if it was built from a different program revision.
    pub fn verify_program(&self, digest: &str) -> Result<(), CacheCorruptionError> {
        if self.program.digest == digest {
            Ok(())
        } else {
            Err(CacheCorruptionError::ProgramChanged {
                expected: digest.to_string(),
                found: self.program.digest.clone(),
            })
        }
    }
}
