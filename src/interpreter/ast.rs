use serde::{Deserialize, Serialize};

use super::value::Value;

/// Binary operators of the routine script language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `and` (short-circuit)
    And,
    /// `or` (short-circuit)
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Logical `not`.
    Not,
}

/// Expression nodes produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value.
    Literal(Value),
    /// Variable reference.
    Name(String),
    /// List literal.
    List(Vec<Expr>),
    /// Map literal with string keys.
    Map(Vec<(String, Expr)>),
    /// Field access `target.field`.
    Field(Box<Expr>, String),
    /// Index access `target[index]`.
    Index(Box<Expr>, Box<Expr>),
    /// Unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Call of a named function, builtin, routine or action.
    Call {
        /// Callee name; dotted for routine designations.
        name: String,
        /// Positional argument expressions.
        args: Vec<Expr>,
        /// Keyword argument expressions in source order.
        kwargs: Vec<(String, Expr)>,
    },
}

/// Statement nodes produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `name = expr`
    Assign(String, Expr),
    /// Bare expression evaluated for its effects.
    Expr(Expr),
    /// `return [expr]`
    Return(Option<Expr>),
    /// `if`/`elif`/`else` chain.
    If {
        /// Condition and body pairs, tested in order.
        arms: Vec<(Expr, Vec<Stmt>)>,
        /// Body executed when no arm matches.
        otherwise: Option<Vec<Stmt>>,
    },
    /// `for name in expr { … }`
    For {
        /// Loop variable.
        var: String,
        /// Iterable expression (list, map keys, or string characters).
        iter: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
}

/// Parsed program container.
#[derive(Debug, Clone)]
pub struct Program {
    /// Program identifier, usually the routine designation.
    pub name: String,
    /// Parsed top-level statements.
    pub body: Vec<Stmt>,
    /// Original source text, retained for hashing and error reporting.
    pub source: String,
}

impl Program {
    /// Construct a new program with the provided name/source.
    pub fn new(name: impl Into<String>, source: impl Into<String>, body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            body,
        }
    }
}
