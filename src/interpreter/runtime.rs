use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::ast::{BinaryOp, UnaryOp};
use super::builtins::call_builtin;
use super::cache::{CacheKeying, CallKey};
use super::ir::{CallSite, Expr, Stmt};
use super::snapshot::InterpreterState;
use super::value::{CallArgs, Value};
use super::EvalError;

/// Why a program stopped before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuspensionKind {
    /// Waiting on an external action's result.
    Action,
    /// Waiting on the user's answer to `ask_user`.
    UserInput,
    /// Waiting on the language model to answer a rendered instruction.
    Prompt,
    /// A state-machine routine finished one step.
    Step,
}

/// Control signal returned when evaluation reaches a call without a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedExecution {
    /// Designation of the routine that suspended.
    pub routine: String,
    /// Name of the call awaiting a result.
    pub name: String,
    /// Arguments of the call awaiting a result.
    pub args: CallArgs,
    /// Identity under which the result must be supplied.
    pub cache_key: CallKey,
    /// What the suspension is waiting for.
    pub kind: SuspensionKind,
}

/// Final outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The program reached `return` (or its end) with a value.
    Returned(Value),
    /// The program halted at an uncached call.
    Paused(PausedExecution),
}

/// A call the interpreter could not answer from its cache.
#[derive(Debug, Clone, Copy)]
pub struct CallRequest<'a> {
    /// Callee name.
    pub name: &'a str,
    /// Evaluated arguments.
    pub args: &'a CallArgs,
    /// Identity of the call.
    pub key: &'a CallKey,
    /// Call-site index within the program.
    pub site: usize,
}

/// Host answer to a [`CallRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Result is available now; it is cached and evaluation continues.
    Ready(Value),
    /// Result is not available; evaluation halts.
    Suspend(SuspensionKind),
}

/// Host trait implemented by runtimes that execute routine programs.
pub trait InterpreterHost {
    /// Error type surfaced by host operations.
    type Error;

    /// Resolve a call that missed the cache and is not a builtin.
    fn call(&mut self, request: &CallRequest<'_>) -> Result<CallOutcome, Self::Error>;

    /// Observe a call answered from the cache.
    fn on_cache_hit(&mut self, _request: &CallRequest<'_>) {}
}

/// Errors surfaced while executing a program.
#[derive(Debug, Error)]
pub enum RuntimeError<E> {
    /// Host-level error bubbled up from a call.
    #[error("host call failed: {0}")]
    Host(E),
    /// Program failed to evaluate.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Knobs for one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// How call identities are derived.
    pub keying: CacheKeying,
    /// Upper bound on intercepted calls in one pass.
    pub max_calls_per_pass: usize,
    /// Longest list the `range` builtin may produce.
    pub max_range_len: usize,
    /// Variables bound before the first statement runs.
    pub inputs: BTreeMap<String, Value>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            keying: CacheKeying::Content,
            max_calls_per_pass: 10_000,
            max_range_len: 100_000,
            inputs: BTreeMap::new(),
        }
    }
}

impl EvalOptions {
    /// Bind a routine's call arguments as program inputs.
    ///
    /// Positional values are visible as `arg0`, `arg1`, … and as the list
    /// `args`; keyword values by name and as the map `kwargs`.
    pub fn with_args(mut self, args: &CallArgs) -> Self {
        self.inputs.extend(args.to_variables());
        self.inputs
            .insert("args".to_string(), Value::List(args.positional.clone()));
        self.inputs
            .insert("kwargs".to_string(), Value::Map(args.keyword.clone()));
        self
    }
}

enum Interrupt<E> {
    Paused(PausedExecution),
    Failed(RuntimeError<E>),
}

impl<E> From<EvalError> for Interrupt<E> {
    fn from(err: EvalError) -> Self {
        Interrupt::Failed(RuntimeError::Eval(err))
    }
}

type Step<T, E> = Result<T, Interrupt<E>>;

/// Run the state's program from the top, replaying cached calls.
///
/// Evaluation is strictly left-to-right and depth-first, so every pass visits
/// calls in the same order and stops at the first call without a result.
pub fn evaluate<H: InterpreterHost>(
    state: &mut InterpreterState,
    host: &mut H,
    options: &EvalOptions,
) -> Result<Evaluation, RuntimeError<H::Error>> {
    state.passes += 1;
    let program = state.program.clone();
    let mut interpreter = Interpreter {
        state,
        host,
        options,
        routine: program.name.clone(),
        vars: options.inputs.clone().into_iter().collect(),
        calls: 0,
        occurrences: HashMap::new(),
    };

    let outcome = interpreter.exec_block(&program.body);
    state.pending = None;
    match outcome {
        Ok(Some(value)) => Ok(Evaluation::Returned(value)),
        Ok(None) => Ok(Evaluation::Returned(Value::Null)),
        Err(Interrupt::Paused(paused)) => {
            state.pending = Some(paused.clone());
            Ok(Evaluation::Paused(paused))
        }
        Err(Interrupt::Failed(err)) => Err(err),
    }
}

struct Interpreter<'a, H> {
    state: &'a mut InterpreterState,
    host: &'a mut H,
    options: &'a EvalOptions,
    routine: String,
    vars: HashMap<String, Value>,
    calls: usize,
    occurrences: HashMap<usize, usize>,
}

impl<'a, H: InterpreterHost> Interpreter<'a, H> {
    /// Execute statements; `Some` carries a returned value.
    fn exec_block(&mut self, stmts: &[Stmt]) -> Step<Option<Value>, H::Error> {
        for stmt in stmts {
            if let Some(value) = self.exec(stmt)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn exec(&mut self, stmt: &Stmt) -> Step<Option<Value>, H::Error> {
        match stmt {
            Stmt::Assign { name, value } => {
                let value = self.eval(value)?;
                self.vars.insert(name.clone(), value);
                Ok(None)
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(None)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Some(value))
            }
            Stmt::If { arms, otherwise } => {
                for arm in arms {
                    if self.eval(&arm.condition)?.truthy() {
                        return self.exec_block(&arm.body);
                    }
                }
                match otherwise {
                    Some(body) => self.exec_block(body),
                    None => Ok(None),
                }
            }
            Stmt::For { var, iter, body } => {
                let items = match self.eval(iter)? {
                    Value::List(items) => items,
                    Value::Map(entries) => entries.into_keys().map(Value::String).collect(),
                    Value::String(text) => text
                        .chars()
                        .map(|ch| Value::String(ch.to_string()))
                        .collect(),
                    other => {
                        return Err(EvalError::Type(format!(
                            "cannot iterate over {}",
                            other.type_name()
                        ))
                        .into());
                    }
                };
                for item in items {
                    self.vars.insert(var.clone(), item);
                    if let Some(value) = self.exec_block(body)? {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Step<Value, H::Error> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Load(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedVariable(name.clone()).into()),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::List(values))
            }
            Expr::Map(entries) => {
                let mut map = BTreeMap::new();
                for entry in entries {
                    let value = self.eval(&entry.value)?;
                    map.insert(entry.name.clone(), value);
                }
                Ok(Value::Map(map))
            }
            Expr::Field { target, field } => {
                let target = self.eval(target)?;
                Ok(field_of(&target, field)?)
            }
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                Ok(index_of(&target, &index)?)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(apply_unary(*op, value)?)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                // short-circuit keeps calls on the right side unevaluated
                match op {
                    BinaryOp::And if !lhs.truthy() => return Ok(lhs),
                    BinaryOp::Or if lhs.truthy() => return Ok(lhs),
                    BinaryOp::And | BinaryOp::Or => return self.eval(rhs),
                    _ => {}
                }
                let rhs = self.eval(rhs)?;
                Ok(apply_binary(*op, lhs, rhs)?)
            }
            Expr::Call(call) => self.intercept(call),
        }
    }

    /// Evaluate an intercepted call: arguments, identity, cache, then builtin or host.
    fn intercept(&mut self, call: &CallSite) -> Step<Value, H::Error> {
        let mut args = CallArgs::new();
        for arg in &call.args {
            let value = self.eval(arg)?;
            args.positional.push(value);
        }
        for kwarg in &call.kwargs {
            let value = self.eval(&kwarg.value)?;
            args.keyword.insert(kwarg.name.clone(), value);
        }

        self.calls += 1;
        if self.calls > self.options.max_calls_per_pass {
            return Err(EvalError::CallBudgetExceeded(self.options.max_calls_per_pass).into());
        }
        let occurrence = {
            let seen = self.occurrences.entry(call.site).or_insert(0);
            let current = *seen;
            *seen += 1;
            current
        };

        let key = self
            .options
            .keying
            .key(&call.name, &args, call.site, occurrence);
        let request = CallRequest {
            name: &call.name,
            args: &args,
            key: &key,
            site: call.site,
        };

        if let Some(value) = self.state.cache.get(&key) {
            let value = value.clone();
            self.host.on_cache_hit(&request);
            return Ok(value);
        }

        let value = match call_builtin(&call.name, &args, self.options) {
            Some(result) => result?,
            None => match self
                .host
                .call(&request)
                .map_err(|err| Interrupt::Failed(RuntimeError::Host(err)))?
            {
                CallOutcome::Ready(value) => value,
                CallOutcome::Suspend(kind) => {
                    return Err(Interrupt::Paused(PausedExecution {
                        routine: self.routine.clone(),
                        name: call.name.clone(),
                        args,
                        cache_key: key,
                        kind,
                    }));
                }
            },
        };

        self.state
            .cache
            .put(key, call.name.clone(), args, value.clone());
        Ok(value)
    }
}

fn field_of(target: &Value, field: &str) -> Result<Value, EvalError> {
    match target {
        Value::Map(entries) => entries
            .get(field)
            .cloned()
            .ok_or_else(|| EvalError::MissingField(field.to_string())),
        other => Err(EvalError::Type(format!(
            "cannot read field '{}' of {}",
            field,
            other.type_name()
        ))),
    }
}

fn index_of(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::List(items), Value::Integer(idx)) => {
            let resolved = resolve_index(*idx, items.len())?;
            Ok(items[resolved].clone())
        }
        (Value::String(text), Value::Integer(idx)) => {
            let chars: Vec<char> = text.chars().collect();
            let resolved = resolve_index(*idx, chars.len())?;
            Ok(Value::String(chars[resolved].to_string()))
        }
        (Value::Map(entries), Value::String(key)) => entries
            .get(key)
            .cloned()
            .ok_or_else(|| EvalError::MissingField(key.clone())),
        (target, index) => Err(EvalError::Type(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn resolve_index(idx: i64, len: usize) -> Result<usize, EvalError> {
    let resolved = if idx < 0 { len as i64 + idx } else { idx };
    if resolved < 0 || resolved >= len as i64 {
        return Err(EvalError::IndexOutOfRange { index: idx, len });
    }
    Ok(resolved as usize)
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value, EvalError> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Boolean(!value.truthy())),
        (UnaryOp::Neg, Value::Integer(num)) => num
            .checked_neg()
            .map(Value::Integer)
            .ok_or(EvalError::Overflow),
        (UnaryOp::Neg, Value::Float(num)) => Ok(Value::Float(-num)),
        (UnaryOp::Neg, other) => Err(EvalError::Type(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Boolean(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => return Ok(Value::Boolean(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs).ok_or_else(|| {
                EvalError::Type(format!(
                    "cannot compare {} with {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))
            })?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Boolean(result));
        }
        _ => {}
    }

    match (op, lhs, rhs) {
        (BinaryOp::Add, Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (BinaryOp::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (op, Value::Integer(a), Value::Integer(b)) => integer_op(op, a, b),
        (op, Value::Integer(a), Value::Float(b)) => float_op(op, a as f64, b),
        (op, Value::Float(a), Value::Integer(b)) => float_op(op, a, b as f64),
        (op, Value::Float(a), Value::Float(b)) => float_op(op, a, b),
        (op, lhs, rhs) => Err(EvalError::Type(format!(
            "unsupported operands for {:?}: {} and {}",
            op,
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn integer_op(op: BinaryOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(EvalError::DivisionByZero),
        // integer division truncates toward zero
        BinaryOp::Div => a.checked_div(b),
        BinaryOp::Rem => a.checked_rem(b),
        _ => unreachable!("comparison and logical operators are handled by apply_binary"),
    };
    result.map(Value::Integer).ok_or(EvalError::Overflow)
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => unreachable!("comparison and logical operators are handled by apply_binary"),
    };
    Ok(Value::Float(result))
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
            (*a as f64) == *b
        }
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
