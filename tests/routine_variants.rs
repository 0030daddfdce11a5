//! Integration tests for instruction and state-machine routines

use std::sync::Arc;

use encore::interpreter::{CallArgs, SuspensionKind, Value};
use encore::runtime::dispatcher::{ActionHost, ActionOutcome, DeferringHost, RunOutcome};
use encore::runtime::machine::{StateMachine, Step, TURN_KEY};
use encore::runtime::registry::{Routine, RoutineRegistry};
use encore::runtime::{
    Engine, EngineConfig, EngineError, FnMachine, RecordingSink, RunContext, RunEvent, SessionId,
};
use tempfile::TempDir;

/// Counts up from the first argument until it reaches the `limit` keyword;
/// caller input, when given, is added on each turn.
struct Counter;

impl StateMachine for Counter {
    fn init(&self, ctx: &mut RunContext<'_>, args: &CallArgs) -> anyhow::Result<Value> {
        let limit = args
            .keyword
            .get("limit")
            .and_then(Value::as_integer)
            .ok_or_else(|| anyhow::anyhow!("limit is required"))?;
        ctx.set_state_value("limit", Value::Integer(limit));
        Ok(args.positional.first().cloned().unwrap_or(Value::Integer(0)))
    }

    fn step(
        &self,
        ctx: &mut RunContext<'_>,
        previous: &Value,
        input: Option<&Value>,
    ) -> anyhow::Result<Step> {
        let limit = ctx
            .state_value("limit")
            .and_then(Value::as_integer)
            .unwrap_or(0);
        let increment = input.and_then(Value::as_integer).unwrap_or(1);
        let next = previous.as_integer().unwrap_or(0) + increment;
        Ok(if next >= limit {
            Step::Done(Value::Integer(next))
        } else {
            Step::Continue(Value::Integer(next))
        })
    }
}

/// Language model stand-in that replies with the prompt upper-cased.
struct ShoutingModel;

impl ActionHost for ShoutingModel {
    fn invoke(
        &mut self,
        _ctx: &RunContext<'_>,
        _name: &str,
        _args: &CallArgs,
    ) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::Deferred)
    }

    fn complete(&mut self, _ctx: &RunContext<'_>, prompt: &str) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::Ready(Value::from(prompt.to_uppercase())))
    }
}

fn engine(temp: &TempDir) -> Engine {
    Engine::init(EngineConfig {
        root: temp.path().to_path_buf(),
        ..EngineConfig::default()
    })
    .unwrap()
}

#[test]
fn test_state_machine_advances_one_turn_per_run() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let mut registry = RoutineRegistry::new();
    registry
        .register(Routine::state_machine("count.up", Counter).unwrap())
        .unwrap();
    let mut dispatcher = engine.dispatcher(registry, DeferringHost);
    let session = SessionId::new("counter");
    let args = CallArgs::positional([Value::Integer(0)]).with_keyword("limit", 4);

    let first = dispatcher.run(&session, "count.up", args.clone()).unwrap();
    let paused = first.suspended().cloned().unwrap();
    assert_eq!(paused.kind, SuspensionKind::Step);
    assert_eq!(paused.args, CallArgs::positional([Value::Integer(0)]));

    let second = dispatcher.run(&session, "count.up", args.clone()).unwrap();
    assert_eq!(
        second.suspended().unwrap().args,
        CallArgs::positional([Value::Integer(1)])
    );
    assert_ne!(second.suspended().unwrap().cache_key, paused.cache_key);
    assert_eq!(
        dispatcher.stack(&session).get_current_state_key(TURN_KEY).unwrap(),
        Some(Value::Integer(1))
    );

    dispatcher.provide_input(&session, Value::Integer(2)).unwrap();
    let third = dispatcher.resume(&session).unwrap();
    assert_eq!(
        third.suspended().unwrap().args,
        CallArgs::positional([Value::Integer(3)])
    );

    let last = dispatcher.resume(&session).unwrap();
    assert_eq!(last, RunOutcome::Completed(Value::Integer(4)));
    assert!(dispatcher.stack(&session).is_empty().unwrap());
}

#[test]
fn test_state_machine_errors_propagate() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let mut registry = RoutineRegistry::new();
    registry
        .register(Routine::state_machine("count.up", Counter).unwrap())
        .unwrap();
    let mut dispatcher = engine.dispatcher(registry, DeferringHost);

    let err = dispatcher
        .run(&SessionId::new("bad"), "count.up", CallArgs::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::Action(_)));
    assert_eq!(err.to_string(), "limit is required");
}

#[test]
fn test_program_calls_state_machine_routine() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let mut registry = RoutineRegistry::new();
    registry
        .register(
            Routine::state_machine(
                "flow.two_turns",
                FnMachine::new(
                    |_args: &CallArgs| Ok(Value::Integer(0)),
                    |previous: &Value, _input: Option<&Value>| {
                        Ok(Step::Done(Value::Integer(previous.as_integer().unwrap_or(0) + 5)))
                    },
                ),
            )
            .unwrap(),
        )
        .unwrap();
    registry
        .register(Routine::program("flow.main", "n = flow.two_turns()\nreturn n * 2").unwrap())
        .unwrap();
    let mut dispatcher = engine.dispatcher(registry, DeferringHost);
    let session = SessionId::new("flow");

    let paused = dispatcher.run(&session, "flow.main", CallArgs::new()).unwrap();
    assert_eq!(paused.suspended().unwrap().kind, SuspensionKind::Step);
    assert_eq!(paused.suspended().unwrap().routine, "flow.two_turns");
    assert_eq!(dispatcher.stack(&session).depth().unwrap(), 2);

    assert_eq!(
        dispatcher.resume(&session).unwrap(),
        RunOutcome::Completed(Value::Integer(10))
    );
}

#[test]
fn test_instruction_routine_uses_language_model() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let mut registry = RoutineRegistry::new();
    registry
        .register(Routine::instruction("chat.summarize", "summarize {{ arg0 }} for {{ audience }}").unwrap())
        .unwrap();
    let sink = Arc::new(RecordingSink::new());
    let mut dispatcher = engine
        .dispatcher(registry, ShoutingModel)
        .with_sink(sink.clone());

    let args = CallArgs::positional([Value::from("the report")]).with_keyword("audience", "execs");
    let outcome = dispatcher
        .run(&SessionId::new("chat"), "chat.summarize", args)
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed(Value::from("SUMMARIZE THE REPORT FOR EXECS"))
    );
    assert!(sink.events().iter().any(|event| matches!(
        event,
        RunEvent::Prompt { text, .. } if text == "summarize the report for execs"
    )));
}
