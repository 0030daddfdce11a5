//! Per-invocation run context and event sinks

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::registry::RoutineRegistry;
use super::stack::FrameId;
use crate::interpreter::{CallArgs, CallKey, SuspensionKind, Value};

/// Identifier of one conversation/session; each session owns one routine stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from a caller-chosen name
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random session ID
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable engine events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RunEvent {
    /// A routine invocation got its own frame.
    FramePushed {
        /// Routine designation
        routine: String,
        /// New frame
        frame: FrameId,
        /// Stack depth after the push
        depth: usize,
    },
    /// A frame finished and was removed.
    FramePopped {
        /// Routine designation
        routine: String,
        /// Removed frame
        frame: FrameId,
    },
    /// A call was answered from the cache.
    CacheHit {
        /// Callee name
        name: String,
        /// Call identity
        key: CallKey,
    },
    /// A call ran (builtin results are not reported) and its result was cached.
    CallExecuted {
        /// Callee name
        name: String,
        /// Call identity
        key: CallKey,
    },
    /// An instruction routine rendered its prompt.
    Prompt {
        /// Routine designation
        routine: String,
        /// Rendered text
        text: String,
    },
    /// A routine suspended.
    Suspended {
        /// Routine designation
        routine: String,
        /// Pending call name
        name: String,
        /// Pending call identity
        key: CallKey,
        /// What the routine waits for
        kind: SuspensionKind,
    },
    /// A routine returned a final value.
    Completed {
        /// Routine designation
        routine: String,
        /// Returned value
        value: Value,
    },
}

/// Destination for [`RunEvent`]s.
pub trait EventSink {
    /// Record one event for a session.
    fn emit(&self, session: &SessionId, event: &RunEvent);
}

/// Sink that writes events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, session: &SessionId, event: &RunEvent) {
        match event {
            RunEvent::CacheHit { name, key } => {
                tracing::trace!(session = %session, call = %name, key = %key, "cache hit")
            }
            RunEvent::Suspended {
                routine,
                name,
                kind,
                ..
            } => tracing::info!(session = %session, routine = %routine, call = %name, ?kind, "routine suspended"),
            RunEvent::Completed { routine, .. } => {
                tracing::info!(session = %session, routine = %routine, "routine completed")
            }
            other => tracing::debug!(session = %session, event = ?other, "routine event"),
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Drain the recorded events
    pub fn take(&self) -> Vec<RunEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, _session: &SessionId, event: &RunEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Context handed to hosts and state machines for one routine invocation.
///
/// Built fresh on every dispatch from the persisted frame and the registry;
/// never persisted itself.
pub struct RunContext<'a> {
    session: &'a SessionId,
    frame: FrameId,
    routine: &'a str,
    depth: usize,
    args: &'a CallArgs,
    registry: &'a RoutineRegistry,
    sink: &'a dyn EventSink,
    state: BTreeMap<String, Value>,
}

impl<'a> RunContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: &'a SessionId,
        frame: FrameId,
        routine: &'a str,
        depth: usize,
        args: &'a CallArgs,
        registry: &'a RoutineRegistry,
        sink: &'a dyn EventSink,
        state: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            session,
            frame,
            routine,
            depth,
            args,
            registry,
            sink,
            state,
        }
    }

    /// Session this invocation belongs to
    pub fn session(&self) -> &SessionId {
        self.session
    }

    /// Frame bound to this invocation
    pub fn frame(&self) -> &FrameId {
        &self.frame
    }

    /// Designation of the running routine
    pub fn routine(&self) -> &str {
        self.routine
    }

    /// Number of frames on the stack, this one included
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Arguments the routine was invoked with
    pub fn args(&self) -> &CallArgs {
        self.args
    }

    /// Registered skills available to this session
    pub fn skills(&self) -> Vec<&str> {
        self.registry.skills()
    }

    /// Whether a designation names a registered routine
    pub fn has_routine(&self, designation: &str) -> bool {
        self.registry.contains(designation)
    }

    /// Emit an event to the session sink
    pub fn emit(&self, event: RunEvent) {
        self.sink.emit(self.session, &event);
    }

    /// Read a key of this frame's state
    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Write a key of this frame's state; persisted when the dispatch returns
    pub fn set_state_value(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    /// Whole frame state
    pub fn state(&self) -> &BTreeMap<String, Value> {
        &self.state
    }

    pub(crate) fn into_state(self) -> BTreeMap<String, Value> {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_collects_events() {
        let sink = RecordingSink::new();
        let session = SessionId::new("s1");
        sink.emit(
            &session,
            &RunEvent::Completed {
                routine: "a.b".into(),
                value: Value::Integer(1),
            },
        );
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::random(), SessionId::random());
        assert_eq!(SessionId::new("abc").to_string(), "abc");
    }
}
