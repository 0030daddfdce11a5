//! Persisted routine call stack
//!
//! Every session owns one LIFO of [`RoutineFrame`]s stored through a
//! [`KvStore`]. The index (`sessions/<sid>/stack.json`) lists frame ids
//! bottom to top; each frame lives in its own record so frame writes never
//! touch another frame. Push writes the frame before the index and pop
//! rewrites the index before deleting the frame, so a reader never sees an
//! index entry without its frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::context::SessionId;
use super::error::{EngineError, Result, StoreError};
use super::storage::KvStore;
use crate::interpreter::{CallArgs, CallKey, InterpreterState, Value};

/// Unique identifier of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(Uuid);

impl FrameId {
    /// Create a new random frame ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FrameId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One active routine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineFrame {
    /// Frame identifier
    pub id: FrameId,
    /// Designation of the invoked routine
    pub routine: String,
    /// Arguments of the invocation
    #[serde(default)]
    pub args: CallArgs,
    /// Private mutable state of this invocation
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
    /// Call in the parent frame's program that this frame answers
    #[serde(default)]
    pub parent_call: Option<CallKey>,
    /// When the frame was pushed
    pub created_at: DateTime<Utc>,
}

impl RoutineFrame {
    fn new(routine: &str, args: CallArgs, parent_call: Option<CallKey>) -> Self {
        Self {
            id: FrameId::new(),
            routine: routine.to_string(),
            args,
            state: BTreeMap::new(),
            parent_call,
            created_at: Utc::now(),
        }
    }
}

/// Stack of routine frames for one session.
pub struct RoutineStack<S> {
    store: S,
    session: SessionId,
}

impl<S: KvStore> RoutineStack<S> {
    /// Bind a stack to a session
    pub fn new(store: S, session: SessionId) -> Self {
        Self { store, session }
    }

    /// Session this stack belongs to
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Push a frame with empty state and no arguments
    pub fn push(&self, designation: &str) -> Result<FrameId> {
        self.push_invocation(designation, CallArgs::new(), None)
    }

    /// Push a frame for one invocation of `designation`
    pub fn push_invocation(
        &self,
        designation: &str,
        args: CallArgs,
        parent_call: Option<CallKey>,
    ) -> Result<FrameId> {
        let frame = RoutineFrame::new(designation, args, parent_call);
        let mut index = self.read_index()?;
        self.write_frame(&frame)?;
        index.push(frame.id);
        self.write_index(&index)?;

        tracing::debug!(
            session = %self.session,
            routine = designation,
            frame = %frame.id,
            depth = index.len(),
            "pushed frame"
        );
        Ok(frame.id)
    }

    /// Remove and return the top frame; `None` on an empty stack
    pub fn pop(&self) -> Result<Option<RoutineFrame>> {
        let mut index = self.read_index()?;
        let Some(id) = index.pop() else {
            return Ok(None);
        };
        let frame = self.read_frame(&id)?;
        self.write_index(&index)?;
        self.store.delete(&self.frame_key(&id))?;
        self.discard_interpreter_state(&id)?;

        tracing::debug!(
            session = %self.session,
            routine = %frame.routine,
            frame = %id,
            depth = index.len(),
            "popped frame"
        );
        Ok(Some(frame))
    }

    /// Top frame without removing it
    pub fn peek(&self) -> Result<Option<RoutineFrame>> {
        match self.read_index()?.last() {
            Some(id) => Ok(Some(self.read_frame(id)?)),
            None => Ok(None),
        }
    }

    /// Bottom (outermost) frame
    pub fn bottom(&self) -> Result<Option<RoutineFrame>> {
        match self.read_index()?.first() {
            Some(id) => Ok(Some(self.read_frame(id)?)),
            None => Ok(None),
        }
    }

    /// Number of frames
    pub fn depth(&self) -> Result<usize> {
        Ok(self.read_index()?.len())
    }

    /// Whether the stack has no frames
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read_index()?.is_empty())
    }

    /// All frames, bottom to top
    pub fn frames(&self) -> Result<Vec<RoutineFrame>> {
        self.read_index()?
            .iter()
            .map(|id| self.read_frame(id))
            .collect()
    }

    /// Whole state of the top frame; empty when there is no frame
    pub fn get_current_state(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.peek()?.map(|frame| frame.state).unwrap_or_default())
    }

    /// Replace the whole state of the top frame
    pub fn set_current_state(&self, state: BTreeMap<String, Value>) -> Result<()> {
        let mut frame = self.require_top()?;
        frame.state = state;
        self.write_frame(&frame)
    }

    /// One key of the top frame's state
    pub fn get_current_state_key(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .peek()?
            .and_then(|mut frame| frame.state.remove(key)))
    }

    /// Write one key of the top frame's state
    pub fn set_current_state_key(&self, key: &str, value: Value) -> Result<()> {
        let mut frame = self.require_top()?;
        frame.state.insert(key.to_string(), value);
        self.write_frame(&frame)
    }

    /// Remove every frame and interpreter state of the session
    pub fn clear(&self) -> Result<usize> {
        let index = self.read_index()?;
        self.write_index(&[])?;
        for id in &index {
            self.store.delete(&self.frame_key(id))?;
            self.discard_interpreter_state(id)?;
        }
        tracing::info!(session = %self.session, frames = index.len(), "cleared routine stack");
        Ok(index.len())
    }

    /// Persisted interpreter state of a frame, if it suspended before
    pub fn load_interpreter_state(&self, frame: &RoutineFrame) -> Result<Option<InterpreterState>> {
        let Some(bytes) = self.store.read(&self.interp_key(&frame.id))? else {
            return Ok(None);
        };
        InterpreterState::deserialize(&bytes)
            .map(Some)
            .map_err(|source| EngineError::CacheCorruption {
                routine: frame.routine.clone(),
                source,
            })
    }

    /// Persist the interpreter state of a frame
    pub fn save_interpreter_state(&self, frame: &FrameId, state: &InterpreterState) -> Result<()> {
        let bytes = state
            .serialize()
            .map_err(|source| EngineError::CacheCorruption {
                routine: state.program.name.clone(),
                source,
            })?;
        self.store.write(&self.interp_key(frame), &bytes)?;
        tracing::debug!(
            session = %self.session,
            frame = %frame,
            cached = state.cache.len(),
            "saved interpreter state"
        );
        Ok(())
    }

    /// Drop the interpreter state of a frame
    pub fn discard_interpreter_state(&self, frame: &FrameId) -> Result<()> {
        self.store.delete(&self.interp_key(frame))?;
        Ok(())
    }

    /// Rewrite a frame in place (state or arguments)
    pub(crate) fn update_frame(&self, frame: &RoutineFrame) -> Result<()> {
        if !self.read_index()?.contains(&frame.id) {
            return Err(EngineError::EmptyStack(self.session.to_string()));
        }
        self.write_frame(frame)
    }

    fn require_top(&self) -> Result<RoutineFrame> {
        self.peek()?
            .ok_or_else(|| EngineError::EmptyStack(self.session.to_string()))
    }

    fn index_key(&self) -> String {
        format!("sessions/{}/stack.json", self.session)
    }

    fn frame_key(&self, id: &FrameId) -> String {
        format!("sessions/{}/frames/{}.json", self.session, id)
    }

    fn interp_key(&self, id: &FrameId) -> String {
        format!("sessions/{}/interp/{}.bin", self.session, id)
    }

    fn read_index(&self) -> Result<Vec<FrameId>> {
        let key = self.index_key();
        match self.store.read(&key)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                StoreError::Corrupted {
                    key,
                    detail: err.to_string(),
                }
                .into()
            }),
            None => Ok(Vec::new()),
        }
    }

    fn write_index(&self, index: &[FrameId]) -> Result<()> {
        let bytes = serde_json::to_vec(index).map_err(StoreError::from)?;
        self.store.write(&self.index_key(), &bytes)?;
        Ok(())
    }

    fn read_frame(&self, id: &FrameId) -> Result<RoutineFrame> {
        let key = self.frame_key(id);
        let bytes = self.store.read(&key)?.ok_or_else(|| StoreError::Corrupted {
            key: key.clone(),
            detail: "frame listed in stack index is missing".to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            StoreError::Corrupted {
                key,
                detail: err.to_string(),
            }
            .into()
        })
    }

    fn write_frame(&self, frame: &RoutineFrame) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(frame).map_err(StoreError::from)?;
        self.store.write(&self.frame_key(&frame.id), &bytes)?;
        Ok(())
    }
}
