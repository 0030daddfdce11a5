//! Explicit state-machine routines
//!
//! A state machine is a pair of functions supplied by the embedding
//! application. `init` runs once when the routine is first dispatched; `step`
//! runs once per later turn with the output of the previous turn and the
//! caller's input for this turn. The dispatcher persists the previous output
//! in the frame state so turns survive process restarts.

use serde::{Deserialize, Serialize};

use super::context::RunContext;
use crate::interpreter::{CallArgs, Value};

/// Frame state key holding the output of the last turn.
pub const OUTPUT_KEY: &str = "__machine_output";
/// Frame state key holding the number of completed turns.
pub const TURN_KEY: &str = "__machine_turn";
/// Frame state key holding the input for the next turn.
pub const INPUT_KEY: &str = "__machine_input";

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Step {
    /// More turns follow; the value is passed to the next step.
    Continue(Value),
    /// Terminal; the value is the routine's result.
    Done(Value),
}

/// Init/step pair implementing a state-machine routine.
pub trait StateMachine: Send + Sync {
    /// Produce the initial output from the invocation arguments.
    fn init(&self, ctx: &mut RunContext<'_>, args: &CallArgs) -> anyhow::Result<Value>;

    /// Advance one turn.
    fn step(
        &self,
        ctx: &mut RunContext<'_>,
        previous: &Value,
        input: Option<&Value>,
    ) -> anyhow::Result<Step>;
}

/// State machine built from two closures.
pub struct FnMachine<I, S> {
    init: I,
    step: S,
}

impl<I, S> FnMachine<I, S>
where
    I: Fn(&CallArgs) -> anyhow::Result<Value> + Send + Sync,
    S: Fn(&Value, Option<&Value>) -> anyhow::Result<Step> + Send + Sync,
{
    /// Wrap an init closure and a step closure
    pub fn new(init: I, step: S) -> Self {
        Self { init, step }
    }
}

impl<I, S> StateMachine for FnMachine<I, S>
where
    I: Fn(&CallArgs) -> anyhow::Result<Value> + Send + Sync,
    S: Fn(&Value, Option<&Value>) -> anyhow::Result<Step> + Send + Sync,
{
    fn init(&self, _ctx: &mut RunContext<'_>, args: &CallArgs) -> anyhow::Result<Value> {
        (self.init)(args)
    }

    fn step(
        &self,
        _ctx: &mut RunContext<'_>,
        previous: &Value,
        input: Option<&Value>,
    ) -> anyhow::Result<Step> {
        (self.step)(previous, input)
    }
}
