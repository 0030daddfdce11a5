//! Routine dispatcher
//!
//! `run` resolves a designation, pushes a frame for the invocation and
//! executes the routine according to its variant. Programmatic routines go
//! through the replaying interpreter; every call it cannot answer from cache
//! or builtins is routed here: registered designations recurse into a nested
//! frame, `ask_user` suspends for the user, `llm` goes to the language model
//! collaborator and everything else is an action on the [`ActionHost`].
//!
//! State is persisted before any suspension is returned, so `resume` may run
//! in another process against the same store.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::EngineConfig;
use super::context::{EventSink, RunContext, RunEvent, SessionId, TracingSink};
use super::error::{EngineError, Result};
use super::machine::{INPUT_KEY, OUTPUT_KEY, StateMachine, Step, TURN_KEY};
use super::registry::{Routine, RoutineBody, RoutineRegistry};
use super::stack::{RoutineFrame, RoutineStack};
use super::storage::KvStore;
use super::template;
use crate::interpreter::{
    CallArgs, CallKey, CallOutcome, CallRequest, EvalOptions, Evaluation, InterpreterHost,
    InterpreterState, PausedExecution, RuntimeError, SuspensionKind, Value, compile, evaluate,
    key_for_site, program_digest,
};

/// Call name that asks the user a question; always suspends.
pub const ASK_USER: &str = "ask_user";
/// Call name that hands a prompt to the language model collaborator.
pub const LLM_CALL: &str = "llm";

/// Program run for instruction routines; `prompt` is the rendered template.
const PROMPT_PROGRAM: &str = "return llm(prompt)";

/// Answer from the host for one action or prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Result available now.
    Ready(Value),
    /// Result arrives later through [`Dispatcher::provide`].
    Deferred,
}

/// External effects reachable from routines.
pub trait ActionHost {
    /// Invoke an action. Errors propagate to the caller of `run` unmodified.
    fn invoke(
        &mut self,
        ctx: &RunContext<'_>,
        name: &str,
        args: &CallArgs,
    ) -> anyhow::Result<ActionOutcome>;

    /// Hand a rendered prompt to the language model.
    fn complete(&mut self, ctx: &RunContext<'_>, prompt: &str) -> anyhow::Result<ActionOutcome>;
}

/// Host that defers every action and prompt; results come through `provide`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferringHost;

impl ActionHost for DeferringHost {
    fn invoke(
        &mut self,
        _ctx: &RunContext<'_>,
        _name: &str,
        _args: &CallArgs,
    ) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::Deferred)
    }

    fn complete(&mut self, _ctx: &RunContext<'_>, _prompt: &str) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::Deferred)
    }
}

/// Result of driving a session.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The outermost routine returned.
    Completed(Value),
    /// A routine is waiting; all frames are persisted.
    Suspended(PausedExecution),
}

impl RunOutcome {
    /// Final value, if the run completed
    pub fn completed(&self) -> Option<&Value> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            RunOutcome::Suspended(_) => None,
        }
    }

    /// Suspension signal, if the run paused
    pub fn suspended(&self) -> Option<&PausedExecution> {
        match self {
            RunOutcome::Suspended(paused) => Some(paused),
            RunOutcome::Completed(_) => None,
        }
    }
}

/// Top-level entry point for running and resuming routines.
pub struct Dispatcher<S, H> {
    registry: RoutineRegistry,
    store: S,
    host: H,
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
}

impl<S: KvStore, H: ActionHost> Dispatcher<S, H> {
    /// Create a dispatcher over a registry, store and host
    pub fn new(registry: RoutineRegistry, store: S, host: H, config: EngineConfig) -> Self {
        Self {
            registry,
            store,
            host,
            config,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replace the event sink
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Registered routines
    pub fn registry(&self) -> &RoutineRegistry {
        &self.registry
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Action host
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Routine stack of a session
    pub fn stack(&self, session: &SessionId) -> RoutineStack<&S> {
        RoutineStack::new(&self.store, session.clone())
    }

    /// Run `designation` with `args` in a session.
    ///
    /// If the session's outermost frame is this same invocation, the run
    /// continues where it stopped instead of starting over.
    pub fn run(
        &mut self,
        session: &SessionId,
        designation: &str,
        args: CallArgs,
    ) -> Result<RunOutcome> {
        let _span = tracing::info_span!("run", session = %session, routine = designation).entered();
        let mut driver = self.driver(session);
        if let Some(bottom) = driver.stack.bottom()? {
            if bottom.routine == designation && bottom.args == args {
                tracing::debug!(frame = %bottom.id, "invocation already on stack, resuming");
                return driver.resume();
            }
        }
        driver.start(designation, args, None)
    }

    /// Continue the session's top frame
    pub fn resume(&mut self, session: &SessionId) -> Result<RunOutcome> {
        let _span = tracing::info_span!("resume", session = %session).entered();
        self.driver(session).resume()
    }

    /// Supply the result of the call the top frame is suspended on
    pub fn provide(&mut self, session: &SessionId, key: &CallKey, value: Value) -> Result<()> {
        let stack = self.stack(session);
        let frame = stack
            .peek()?
            .ok_or_else(|| EngineError::EmptyStack(session.to_string()))?;
        let mut state = stack
            .load_interpreter_state(&frame)?
            .ok_or_else(|| EngineError::NotSuspended(frame.id.to_string()))?;
        if !state.resolve_pending(key, value) {
            return Err(EngineError::UnexpectedResult {
                frame: frame.id.to_string(),
                key: key.to_string(),
            });
        }
        stack.save_interpreter_state(&frame.id, &state)?;
        tracing::info!(session = %session, frame = %frame.id, key = %key, "result provided");
        Ok(())
    }

    /// Supply the input for the next turn of a state-machine routine
    pub fn provide_input(&mut self, session: &SessionId, value: Value) -> Result<()> {
        let stack = self.stack(session);
        let frame = stack
            .peek()?
            .ok_or_else(|| EngineError::EmptyStack(session.to_string()))?;
        let is_machine = self
            .registry
            .resolve(&frame.routine)
            .is_some_and(|routine| matches!(routine.body, RoutineBody::StateMachine(_)));
        if !is_machine {
            return Err(EngineError::NotSuspended(frame.id.to_string()));
        }
        stack.set_current_state_key(INPUT_KEY, value)
    }

    /// Discard every frame of a session
    pub fn abort(&mut self, session: &SessionId) -> Result<usize> {
        let removed = self.stack(session).clear()?;
        tracing::warn!(session = %session, frames = removed, "session aborted");
        Ok(removed)
    }

    fn driver<'a>(&'a mut self, session: &'a SessionId) -> Driver<'a, S, H> {
        Driver {
            session,
            stack: RoutineStack::new(&self.store, session.clone()),
            registry: &self.registry,
            host: &mut self.host,
            config: &self.config,
            sink: &*self.sink,
        }
    }
}

/// Borrowed view of a dispatcher bound to one session.
struct Driver<'a, S, H> {
    session: &'a SessionId,
    stack: RoutineStack<&'a S>,
    registry: &'a RoutineRegistry,
    host: &'a mut H,
    config: &'a EngineConfig,
    sink: &'a dyn EventSink,
}

impl<'a, S: KvStore, H: ActionHost> Driver<'a, S, H> {
    fn emit(&self, event: RunEvent) {
        self.sink.emit(self.session, &event);
    }

    fn resolve(&self, designation: &str) -> Result<Arc<Routine>> {
        self.registry
            .resolve(designation)
            .ok_or_else(|| EngineError::UnknownRoutine(designation.to_string()))
    }

    /// Push a frame for a new invocation and execute it.
    fn start(
        &mut self,
        designation: &str,
        args: CallArgs,
        parent_call: Option<CallKey>,
    ) -> Result<RunOutcome> {
        let routine = self.resolve(designation)?;
        let depth = self.stack.depth()?;
        if depth >= self.config.max_nesting_depth {
            return Err(EngineError::NestingTooDeep(self.config.max_nesting_depth));
        }
        let id = self.stack.push_invocation(designation, args, parent_call)?;
        self.emit(RunEvent::FramePushed {
            routine: designation.to_string(),
            frame: id,
            depth: depth + 1,
        });
        let frame = self
            .stack
            .peek()?
            .ok_or_else(|| EngineError::EmptyStack(self.session.to_string()))?;
        self.execute(&routine, frame)
    }

    /// Drive the top frame until a frame suspends or the outermost completes.
    fn resume(&mut self) -> Result<RunOutcome> {
        loop {
            let frame = self
                .stack
                .peek()?
                .ok_or_else(|| EngineError::EmptyStack(self.session.to_string()))?;
            let routine = self.resolve(&frame.routine)?;
            let parent_call = frame.parent_call.clone();
            let (designation, args) = (frame.routine.clone(), frame.args.clone());

            match self.execute(&routine, frame)? {
                RunOutcome::Completed(value) => match parent_call {
                    Some(key) => self.deliver(key, designation, args, value)?,
                    None => return Ok(RunOutcome::Completed(value)),
                },
                suspended => return Ok(suspended),
            }
        }
    }

    /// Cache a finished nested routine's result in the frame that called it.
    fn deliver(&mut self, key: CallKey, designation: String, args: CallArgs, value: Value) -> Result<()> {
        let parent = self
            .stack
            .peek()?
            .ok_or_else(|| EngineError::EmptyStack(self.session.to_string()))?;
        let mut state = self
            .stack
            .load_interpreter_state(&parent)?
            .ok_or_else(|| EngineError::NotSuspended(parent.id.to_string()))?;
        state.cache.put(key, designation, args, value);
        state.pending = None;
        self.stack.save_interpreter_state(&parent.id, &state)
    }

    fn execute(&mut self, routine: &Routine, frame: RoutineFrame) -> Result<RunOutcome> {
        match &routine.body {
            RoutineBody::Program { source } => {
                let state = self.load_or_compile(&frame, source)?;
                let options = self.eval_options().with_args(&frame.args);
                self.run_program(frame, state, options)
            }
            RoutineBody::Instruction { template } => {
                let mut vars = frame.state.clone();
                vars.extend(frame.args.to_variables());
                let prompt = template::render(template, &vars).map_err(|err| {
                    EngineError::Template {
                        routine: frame.routine.clone(),
                        detail: err.to_string(),
                    }
                })?;
                let state = self.load_or_compile(&frame, PROMPT_PROGRAM)?;
                if state.passes == 0 {
                    self.emit(RunEvent::Prompt {
                        routine: frame.routine.clone(),
                        text: prompt.clone(),
                    });
                }
                let mut options = self.eval_options();
                options.inputs.insert("prompt".to_string(), Value::String(prompt));
                self.run_program(frame, state, options)
            }
            RoutineBody::StateMachine(machine) => self.step_machine(machine.as_ref(), frame),
        }
    }

    fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            keying: self.config.keying,
            max_calls_per_pass: self.config.max_calls_per_pass,
            max_range_len: self.config.max_range_len,
            inputs: BTreeMap::new(),
        }
    }

    fn load_or_compile(&self, frame: &RoutineFrame, source: &str) -> Result<InterpreterState> {
        match self.stack.load_interpreter_state(frame)? {
            Some(state) => {
                state
                    .verify_program(&program_digest(source))
                    .map_err(|source| EngineError::CacheCorruption {
                        routine: frame.routine.clone(),
                        source,
                    })?;
                Ok(state)
            }
            None => compile(&frame.routine, source)
                .map(InterpreterState::new)
                .map_err(|source| EngineError::Parse {
                    routine: frame.routine.clone(),
                    source,
                }),
        }
    }

    fn run_program(
        &mut self,
        frame: RoutineFrame,
        mut state: InterpreterState,
        options: EvalOptions,
    ) -> Result<RunOutcome> {
        let depth = self.stack.depth()?;
        let mut host = ProgramHost {
            driver: self,
            frame: &frame,
            depth,
            nested: None,
        };
        let result = evaluate(&mut state, &mut host, &options);
        let nested = host.nested.take();

        match result {
            Ok(Evaluation::Returned(value)) => self.finish(&frame, value),
            Ok(Evaluation::Paused(paused)) => {
                self.stack.save_interpreter_state(&frame.id, &state)?;
                if let Some(inner) = nested {
                    return Ok(RunOutcome::Suspended(inner));
                }
                self.emit(RunEvent::Suspended {
                    routine: frame.routine.clone(),
                    name: paused.name.clone(),
                    key: paused.cache_key.clone(),
                    kind: paused.kind,
                });
                Ok(RunOutcome::Suspended(paused))
            }
            Err(err) => {
                // keep results gathered before the failure
                self.stack.save_interpreter_state(&frame.id, &state)?;
                Err(match err {
                    RuntimeError::Host(err) => err,
                    RuntimeError::Eval(source) => EngineError::Eval {
                        routine: frame.routine.clone(),
                        source,
                    },
                })
            }
        }
    }

    fn step_machine(&mut self, machine: &dyn StateMachine, frame: RoutineFrame) -> Result<RunOutcome> {
        let depth = self.stack.depth()?;
        let mut ctx = RunContext::new(
            self.session,
            frame.id,
            &frame.routine,
            depth,
            &frame.args,
            self.registry,
            self.sink,
            frame.state.clone(),
        );

        let turn = ctx.state_value(TURN_KEY).and_then(Value::as_integer);
        let (step, next_turn) = match turn {
            None => {
                let output = machine.init(&mut ctx, &frame.args).map_err(EngineError::Action)?;
                (Step::Continue(output), 0)
            }
            Some(turn) => {
                let previous = ctx.state_value(OUTPUT_KEY).cloned().unwrap_or_default();
                let input = ctx.state_value(INPUT_KEY).cloned();
                let step = machine
                    .step(&mut ctx, &previous, input.as_ref())
                    .map_err(EngineError::Action)?;
                (step, turn + 1)
            }
        };
        let mut state = ctx.into_state();

        match step {
            Step::Done(value) => self.finish(&frame, value),
            Step::Continue(output) => {
                state.remove(INPUT_KEY);
                state.insert(OUTPUT_KEY.to_string(), output.clone());
                state.insert(TURN_KEY.to_string(), Value::Integer(next_turn));
                let frame = RoutineFrame { state, ..frame };
                self.stack.update_frame(&frame)?;

                let paused = PausedExecution {
                    routine: frame.routine.clone(),
                    name: frame.routine.clone(),
                    args: CallArgs::positional([output]),
                    cache_key: key_for_site(&frame.routine, 0, usize::try_from(next_turn).unwrap_or_default()),
                    kind: SuspensionKind::Step,
                };
                self.emit(RunEvent::Suspended {
                    routine: frame.routine.clone(),
                    name: paused.name.clone(),
                    key: paused.cache_key.clone(),
                    kind: paused.kind,
                });
                Ok(RunOutcome::Suspended(paused))
            }
        }
    }

    /// Pop a finished frame and report its value.
    fn finish(&mut self, frame: &RoutineFrame, value: Value) -> Result<RunOutcome> {
        match self.stack.pop()? {
            Some(popped) if popped.id == frame.id => {}
            _ => {
                return Err(EngineError::EmptyStack(self.session.to_string()));
            }
        }
        self.emit(RunEvent::FramePopped {
            routine: frame.routine.clone(),
            frame: frame.id,
        });
        self.emit(RunEvent::Completed {
            routine: frame.routine.clone(),
            value: value.clone(),
        });
        Ok(RunOutcome::Completed(value))
    }
}

/// Interpreter host for one programmatic frame.
struct ProgramHost<'d, 'a, S, H> {
    driver: &'d mut Driver<'a, S, H>,
    frame: &'d RoutineFrame,
    depth: usize,
    nested: Option<PausedExecution>,
}

impl<'d, 'a, S: KvStore, H: ActionHost> ProgramHost<'d, 'a, S, H> {
    fn call_routine(&mut self, request: &CallRequest<'_>) -> Result<CallOutcome> {
        let outcome = self.driver.start(
            request.name,
            request.args.clone(),
            Some(request.key.clone()),
        )?;
        match outcome {
            RunOutcome::Completed(value) => Ok(CallOutcome::Ready(value)),
            RunOutcome::Suspended(inner) => {
                let kind = inner.kind;
                self.nested = Some(inner);
                Ok(CallOutcome::Suspend(kind))
            }
        }
    }
}

impl<'d, 'a, S: KvStore, H: ActionHost> InterpreterHost for ProgramHost<'d, 'a, S, H> {
    type Error = EngineError;

    fn call(&mut self, request: &CallRequest<'_>) -> Result<CallOutcome> {
        if request.name == ASK_USER {
            return Ok(CallOutcome::Suspend(SuspensionKind::UserInput));
        }
        if self.driver.registry.contains(request.name) {
            return self.call_routine(request);
        }

        let frame: &RoutineFrame = self.frame;
        let ctx = RunContext::new(
            self.driver.session,
            frame.id,
            &frame.routine,
            self.depth,
            &frame.args,
            self.driver.registry,
            self.driver.sink,
            frame.state.clone(),
        );
        let (outcome, deferred_kind) = if request.name == LLM_CALL {
            let prompt = request
                .args
                .positional
                .first()
                .map(Value::to_string)
                .unwrap_or_default();
            (self.driver.host.complete(&ctx, &prompt), SuspensionKind::Prompt)
        } else {
            (
                self.driver.host.invoke(&ctx, request.name, request.args),
                SuspensionKind::Action,
            )
        };

        match outcome.map_err(EngineError::Action)? {
            ActionOutcome::Ready(value) => {
                self.driver.emit(RunEvent::CallExecuted {
                    name: request.name.to_string(),
                    key: request.key.clone(),
                });
                Ok(CallOutcome::Ready(value))
            }
            ActionOutcome::Deferred => Ok(CallOutcome::Suspend(deferred_kind)),
        }
    }

    fn on_cache_hit(&mut self, request: &CallRequest<'_>) {
        self.driver.emit(RunEvent::CacheHit {
            name: request.name.to_string(),
            key: request.key.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::key_for;
    use crate::runtime::context::RecordingSink;
    use crate::runtime::storage::MemoryStore;

    /// Host that answers actions from a table and records every invocation.
    #[derive(Default)]
    struct TableHost {
        answers: BTreeMap<String, Value>,
        invoked: Vec<(String, CallArgs)>,
        prompts: Vec<String>,
        reply: Option<String>,
    }

    impl ActionHost for TableHost {
        fn invoke(
            &mut self,
            _ctx: &RunContext<'_>,
            name: &str,
            args: &CallArgs,
        ) -> anyhow::Result<ActionOutcome> {
            self.invoked.push((name.to_string(), args.clone()));
            if name == "explode" {
                anyhow::bail!("action exploded");
            }
            Ok(match self.answers.get(name) {
                Some(value) => ActionOutcome::Ready(value.clone()),
                None => ActionOutcome::Deferred,
            })
        }

        fn complete(&mut self, _ctx: &RunContext<'_>, prompt: &str) -> anyhow::Result<ActionOutcome> {
            self.prompts.push(prompt.to_string());
            Ok(match &self.reply {
                Some(reply) => ActionOutcome::Ready(Value::from(reply.as_str())),
                None => ActionOutcome::Deferred,
            })
        }
    }

    fn dispatcher(routines: Vec<Routine>) -> Dispatcher<MemoryStore, TableHost> {
        let mut registry = RoutineRegistry::new();
        for routine in routines {
            registry.register(routine).unwrap();
        }
        Dispatcher::new(registry, MemoryStore::new(), TableHost::default(), EngineConfig::default())
    }

    fn session() -> SessionId {
        SessionId::new("test")
    }

    #[test]
    fn builtin_program_completes() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("demo.echo", "x = echo(\"hi\"); return x").unwrap(),
        ]);
        let outcome = dispatcher.run(&session(), "demo.echo", CallArgs::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Value::from("hi")));
        assert!(dispatcher.stack(&session()).is_empty().unwrap());
        assert_eq!(dispatcher.store().keys(), vec!["sessions/test/stack.json".to_string()]);
    }

    #[test]
    fn action_suspends_and_resumes_with_provided_result() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("demo.lookup", "x = lookup(1, 2); return x").unwrap(),
        ]);
        let sid = session();
        let outcome = dispatcher.run(&sid, "demo.lookup", CallArgs::new()).unwrap();
        let paused = outcome.suspended().cloned().unwrap();
        assert_eq!(paused.name, "lookup");
        assert_eq!(paused.args, CallArgs::positional([Value::Integer(1), Value::Integer(2)]));
        assert_eq!(paused.kind, SuspensionKind::Action);
        assert_eq!(dispatcher.stack(&sid).depth().unwrap(), 1);

        dispatcher.provide(&sid, &paused.cache_key, Value::Integer(3)).unwrap();
        let outcome = dispatcher.resume(&sid).unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Value::Integer(3)));
        assert_eq!(dispatcher.host().invoked.len(), 1);
        assert!(dispatcher.stack(&sid).is_empty().unwrap());
    }

    #[test]
    fn run_on_same_invocation_resumes() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("demo.lookup", "return lookup(arg0)").unwrap(),
        ]);
        let sid = session();
        let args = CallArgs::positional([Value::Integer(7)]);
        let paused = dispatcher.run(&sid, "demo.lookup", args.clone()).unwrap();
        let key = paused.suspended().unwrap().cache_key.clone();
        dispatcher.provide(&sid, &key, Value::from("found")).unwrap();

        let outcome = dispatcher.run(&sid, "demo.lookup", args).unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Value::from("found")));
    }

    #[test]
    fn ask_user_never_reaches_the_host() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("demo.ask", "name = ask_user(\"name?\")\nreturn \"hi \" + name").unwrap(),
        ]);
        let sid = session();
        let outcome = dispatcher.run(&sid, "demo.ask", CallArgs::new()).unwrap();
        let paused = outcome.suspended().unwrap().clone();
        assert_eq!(paused.kind, SuspensionKind::UserInput);
        assert_eq!(paused.cache_key, key_for(ASK_USER, &CallArgs::positional([Value::from("name?")])));
        assert!(dispatcher.host().invoked.is_empty());

        dispatcher.provide(&sid, &paused.cache_key, Value::from("Ada")).unwrap();
        assert_eq!(
            dispatcher.resume(&sid).unwrap(),
            RunOutcome::Completed(Value::from("hi Ada"))
        );
    }

    #[test]
    fn nested_routine_suspends_and_delivers_to_parent() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("demo.outer", "a = demo.inner(2)\nreturn a * 10").unwrap(),
            Routine::program("demo.inner", "v = ask_user(\"value?\")\nreturn v + arg0").unwrap(),
        ]);
        let sink = Arc::new(RecordingSink::new());
        let mut dispatcher = dispatcher.with_sink(sink.clone());
        let sid = session();

        let outcome = dispatcher.run(&sid, "demo.outer", CallArgs::new()).unwrap();
        let paused = outcome.suspended().unwrap().clone();
        assert_eq!(paused.routine, "demo.inner");
        assert_eq!(paused.kind, SuspensionKind::UserInput);

        let frames = dispatcher.stack(&sid).frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].routine, "demo.outer");
        assert_eq!(frames[1].routine, "demo.inner");
        assert!(frames[1].parent_call.is_some());

        dispatcher.provide(&sid, &paused.cache_key, Value::Integer(1)).unwrap();
        let outcome = dispatcher.resume(&sid).unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Value::Integer(30)));
        assert!(dispatcher.stack(&sid).is_empty().unwrap());

        let popped = sink
            .events()
            .into_iter()
            .filter(|event| matches!(event, RunEvent::FramePopped { .. }))
            .count();
        assert_eq!(popped, 2);
    }

    #[test]
    fn nested_routine_completing_inline() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("math.outer", "return math.double(math.double(arg0))").unwrap(),
            Routine::program("math.double", "return arg0 * 2").unwrap(),
        ]);
        let outcome = dispatcher
            .run(&session(), "math.outer", CallArgs::positional([Value::Integer(3)]))
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Value::Integer(12)));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("loop.forever", "return loop.forever(arg0 + 1)").unwrap(),
        ]);
        let err = dispatcher
            .run(&session(), "loop.forever", CallArgs::positional([Value::Integer(0)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::NestingTooDeep(16)));
    }

    #[test]
    fn unknown_routine_is_reported() {
        let mut dispatcher = dispatcher(vec![]);
        assert!(matches!(
            dispatcher.run(&session(), "no.such", CallArgs::new()),
            Err(EngineError::UnknownRoutine(name)) if name == "no.such"
        ));
        assert!(dispatcher.stack(&session()).is_empty().unwrap());
    }

    #[test]
    fn parse_errors_are_fatal() {
        let mut dispatcher = dispatcher(vec![Routine::program("bad.syntax", "x = (1").unwrap()]);
        assert!(matches!(
            dispatcher.run(&session(), "bad.syntax", CallArgs::new()),
            Err(EngineError::Parse { .. })
        ));
    }

    #[test]
    fn action_errors_propagate_unmodified() {
        let mut dispatcher = dispatcher(vec![
            Routine::program("demo.boom", "a = echo(1)\nreturn explode(a)").unwrap(),
        ]);
        let err = dispatcher.run(&session(), "demo.boom", CallArgs::new()).unwrap_err();
        match err {
            EngineError::Action(inner) => assert_eq!(inner.to_string(), "action exploded"),
            other => panic!("unexpected error: {other}"),
        }
        // frame stays for the caller to abort
        assert_eq!(dispatcher.abort(&session()).unwrap(), 1);
    }

    #[test]
    fn provide_rejects_unrelated_keys() {
        let mut dispatcher = dispatcher(vec![Routine::program("demo.wait", "return wait()").unwrap()]);
        let sid = session();
        dispatcher.run(&sid, "demo.wait", CallArgs::new()).unwrap();
        assert!(matches!(
            dispatcher.provide(&sid, &CallKey::new("call_nope"), Value::Null),
            Err(EngineError::UnexpectedResult { .. })
        ));
    }

    #[test]
    fn instruction_routine_renders_prompt() {
        let mut dispatcher = dispatcher(vec![
            Routine::instruction("chat.greet", "Greet {{ name }} warmly").unwrap(),
        ]);
        let sid = session();
        let args = CallArgs::new().with_keyword("name", "Ada");
        let outcome = dispatcher.run(&sid, "chat.greet", args).unwrap();
        let paused = outcome.suspended().unwrap().clone();
        assert_eq!(paused.kind, SuspensionKind::Prompt);
        assert_eq!(paused.name, LLM_CALL);
        assert_eq!(paused.args, CallArgs::positional([Value::from("Greet Ada warmly")]));
        assert_eq!(dispatcher.host().prompts, vec!["Greet Ada warmly".to_string()]);

        dispatcher.provide(&sid, &paused.cache_key, Value::from("Hello Ada!")).unwrap();
        assert_eq!(
            dispatcher.resume(&sid).unwrap(),
            RunOutcome::Completed(Value::from("Hello Ada!"))
        );
    }

    #[test]
    fn instruction_template_errors() {
        let mut dispatcher = dispatcher(vec![Routine::instruction("chat.greet", "Hi {{ who }}").unwrap()]);
        assert!(matches!(
            dispatcher.run(&session(), "chat.greet", CallArgs::new()),
            Err(EngineError::Template { .. })
        ));
    }

    #[test]
    fn abort_clears_the_session() {
        let mut dispatcher = dispatcher(vec![Routine::program("demo.wait", "return wait()").unwrap()]);
        let sid = session();
        dispatcher.run(&sid, "demo.wait", CallArgs::new()).unwrap();
        assert_eq!(dispatcher.abort(&sid).unwrap(), 1);
        assert!(matches!(dispatcher.resume(&sid), Err(EngineError::EmptyStack(_))));
    }
}
