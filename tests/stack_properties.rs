//! Routine call stack behaviour and snapshot properties
//!
//! Scenario checks use the file-backed store; property tests use the
//! in-memory store so many cases stay cheap.

use std::collections::BTreeMap;

use encore::interpreter::{CallArgs, InterpreterState, Value, compile, key_for};
use encore::runtime::storage::{FileStore, MemoryStore};
use encore::runtime::{RoutineStack, SessionId};
use proptest::prelude::*;
use tempfile::TempDir;

#[test]
fn test_push_peek_pop_on_file_store() {
    let temp = TempDir::new().unwrap();
    let stack = RoutineStack::new(FileStore::new(temp.path().to_path_buf()), SessionId::new("s"));

    stack.push("skill.A").unwrap();
    stack.push("skill.B").unwrap();
    assert_eq!(stack.peek().unwrap().unwrap().routine, "skill.B");
    assert_eq!(stack.pop().unwrap().unwrap().routine, "skill.B");
    assert_eq!(stack.pop().unwrap().unwrap().routine, "skill.A");
    assert!(stack.pop().unwrap().is_none());
}

#[test]
fn test_state_key_does_not_leak_into_next_frame() {
    let temp = TempDir::new().unwrap();
    let stack = RoutineStack::new(FileStore::new(temp.path().to_path_buf()), SessionId::new("s"));

    stack.push("skill.A").unwrap();
    stack.set_current_state_key("count", Value::from("1")).unwrap();
    assert_eq!(
        stack.get_current_state_key("count").unwrap(),
        Some(Value::from("1"))
    );

    stack.pop().unwrap();
    stack.push("skill.A").unwrap();
    assert_eq!(stack.get_current_state_key("count").unwrap(), None);
}

#[test]
fn test_stack_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    {
        let stack = RoutineStack::new(FileStore::new(root.clone()), SessionId::new("s"));
        stack
            .push_invocation("skill.A", CallArgs::positional([Value::Integer(1)]), None)
            .unwrap();
        stack.set_current_state_key("k", Value::Boolean(true)).unwrap();
    }

    let stack = RoutineStack::new(FileStore::new(root), SessionId::new("s"));
    let frame = stack.peek().unwrap().unwrap();
    assert_eq!(frame.args, CallArgs::positional([Value::Integer(1)]));
    assert_eq!(frame.state.get("k"), Some(&Value::Boolean(true)));
}

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Boolean),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9..1.0e9f64).prop_map(Value::Float),
        "[a-z ]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

fn args_strategy() -> impl Strategy<Value = CallArgs> {
    (
        prop::collection::vec(value_strategy(), 0..3),
        prop::collection::btree_map("[a-z]{1,6}", value_strategy(), 0..3),
    )
        .prop_map(|(positional, keyword)| CallArgs {
            positional,
            keyword,
        })
}

proptest! {
    #[test]
    fn prop_snapshot_round_trip(
        calls in prop::collection::vec(("[a-z_]{1,8}", args_strategy(), value_strategy()), 0..6),
        passes in 0u64..1000,
    ) {
        let program = compile("prop.routine", "a = fetch(arg0)\nreturn ask_user(a)").unwrap();
        let mut state = InterpreterState::new(program);
        state.passes = passes;
        for (name, args, value) in calls {
            state.cache.put(key_for(&name, &args), name, args, value);
        }

        let bytes = state.serialize().unwrap();
        prop_assert_eq!(InterpreterState::deserialize(&bytes).unwrap(), state);
    }

    #[test]
    fn prop_stack_balance(count in 1usize..24) {
        let stack = RoutineStack::new(MemoryStore::new(), SessionId::new("prop"));
        let mut ids = Vec::new();
        for index in 0..count {
            ids.push(stack.push(&format!("skill.r{index}")).unwrap());
        }

        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), count);

        for expected in ids.iter().rev() {
            let frame = stack.pop().unwrap().unwrap();
            prop_assert_eq!(&frame.id, expected);
        }
        prop_assert!(stack.pop().unwrap().is_none());
        prop_assert_eq!(stack.depth().unwrap(), 0);
    }

    #[test]
    fn prop_frame_isolation(values in prop::collection::vec(any::<i64>(), 1..8)) {
        let stack = RoutineStack::new(MemoryStore::new(), SessionId::new("iso"));
        stack.push("skill.base").unwrap();
        let mut base = BTreeMap::new();
        base.insert("value".to_string(), Value::Integer(-1));
        stack.set_current_state(base.clone()).unwrap();

        for value in values {
            stack.push("skill.top").unwrap();
            stack.set_current_state_key("value", Value::Integer(value)).unwrap();
            stack.pop().unwrap();
            prop_assert_eq!(stack.get_current_state().unwrap(), base.clone());
        }
    }
}
