use serde::{Deserialize, Serialize};

use super::ast::{BinaryOp, UnaryOp};
use super::value::Value;

/// Transformed program ready for replayable evaluation.
///
/// Every call expression of the source has been rewritten into an
/// [`Expr::Call`] node carrying a stable [`CallSite`] index, so the evaluator
/// can intercept it and consult the function cache before anything runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramIr {
    /// Program identifier.
    pub name: String,
    /// Blake3 digest of the source text the program was built from.
    pub digest: String,
    /// Top-level statements.
    pub body: Vec<Stmt>,
    /// Number of intercepted call sites in the program.
    pub call_sites: usize,
}

/// Statements of the transformed program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Bind a variable.
    Assign {
        /// Variable name.
        name: String,
        /// Value expression.
        value: Expr,
    },
    /// Evaluate an expression and discard the result.
    Expr(Expr),
    /// Finish the program with a value (`null` when omitted).
    Return(Option<Expr>),
    /// Conditional chain.
    If {
        /// Arms tested in order.
        arms: Vec<BranchArm>,
        /// Fallback body executed when no arm matches.
        otherwise: Option<Vec<Stmt>>,
    },
    /// Iterate over a list, map keys or string characters.
    For {
        /// Loop variable.
        var: String,
        /// Iterable expression.
        iter: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
}

/// One arm of a conditional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchArm {
    /// Condition evaluated for this arm.
    pub condition: Expr,
    /// Body executed when the condition is truthy.
    pub body: Vec<Stmt>,
}

/// Expressions of the transformed program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Literal value.
    Literal(Value),
    /// Variable read.
    Load(String),
    /// List constructor.
    List(Vec<Expr>),
    /// Map constructor.
    Map(Vec<Keyword>),
    /// Field access on a map.
    Field {
        /// Map expression.
        target: Box<Expr>,
        /// Field name.
        field: String,
    },
    /// Index access on a list, map or string.
    Index {
        /// Collection expression.
        target: Box<Expr>,
        /// Index expression.
        index: Box<Expr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand, evaluated first.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Intercepted call.
    Call(CallSite),
}

/// Named expression used for map entries and keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    /// Entry or argument name.
    pub name: String,
    /// Value expression.
    pub value: Expr,
}

/// A call expression rewritten for interception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    /// Source-order index; inner calls are numbered before the call containing them.
    pub site: usize,
    /// Callee name (builtin, action, or `skill.routine` designation).
    pub name: String,
    /// Positional argument expressions.
    pub args: Vec<Expr>,
    /// Keyword argument expressions.
    pub kwargs: Vec<Keyword>,
}
