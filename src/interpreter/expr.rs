//! Expression evaluation against a session's value tree
//!
//! Nodes depend only on the [`Expression`] trait; [`Expr`] is the built-in
//! implementation used by hand-built process trees and tests.

use std::cmp::Ordering;
use std::fmt::Debug;

use super::fault::Fault;
use super::path::VariablePath;
use super::value::{Scalar, Value};

/// Anything that can compute a value from the current session state.
pub trait Expression: Send + Sync + Debug {
    /// Evaluate against the session value tree.
    fn evaluate(&self, state: &Value) -> Result<Value, Fault>;
}

/// Binary operators supported by [`Expr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Addition, or concatenation when either side is a string
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division (integer division for two integers)
    Div,
    /// Equality
    Eq,
    /// Inequality
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Logical and over truthiness
    And,
    /// Logical or over truthiness
    Or,
}

/// Built-in expression language.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Constant value
    Const(Value),
    /// Subtree at a path (undefined when missing)
    Path(VariablePath),
    /// Vector length at a path (`#path`)
    Len(VariablePath),
    /// Whether a path is defined
    Defined(VariablePath),
    /// Logical negation
    Not(Box<Expr>),
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Constant expression.
    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Const(value.into())
    }

    /// Path read.
    pub fn path(path: impl Into<VariablePath>) -> Self {
        Expr::Path(path.into())
    }

    /// `#path`.
    pub fn len(path: impl Into<VariablePath>) -> Self {
        Expr::Len(path.into())
    }

    /// `is_defined(path)`.
    pub fn defined(path: impl Into<VariablePath>) -> Self {
        Expr::Defined(path.into())
    }

    /// `!expr`.
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// Binary operation.
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

impl Expression for Expr {
    fn evaluate(&self, state: &Value) -> Result<Value, Fault> {
        match self {
            Expr::Const(value) => Ok(value.clone()),
            Expr::Path(path) => Ok(path.value_of(state)),
            Expr::Len(path) => Ok(Value::from(path.vector_len(state) as i64)),
            Expr::Defined(path) => Ok(Value::from(
                path.get(state).is_some_and(Value::is_defined),
            )),
            Expr::Not(inner) => Ok(Value::from(!inner.evaluate(state)?.is_truthy())),
            Expr::Binary { op, lhs, rhs } => {
                let left = lhs.evaluate(state)?;
                // Short-circuit the logical operators.
                match op {
                    BinaryOp::And if !left.is_truthy() => return Ok(Value::from(false)),
                    BinaryOp::Or if left.is_truthy() => return Ok(Value::from(true)),
                    _ => {}
                }
                let right = rhs.evaluate(state)?;
                apply(*op, left.content(), right.content()).map(Value::from)
            }
        }
    }
}

impl Expression for Value {
    fn evaluate(&self, _state: &Value) -> Result<Value, Fault> {
        Ok(self.clone())
    }
}

fn apply(op: BinaryOp, left: &Scalar, right: &Scalar) -> Result<Scalar, Fault> {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, left, right),
        BinaryOp::Eq => Ok(Scalar::Bool(compare(left, right) == Some(Ordering::Equal))),
        BinaryOp::Ne => Ok(Scalar::Bool(compare(left, right) != Some(Ordering::Equal))),
        BinaryOp::Lt => Ok(Scalar::Bool(compare(left, right) == Some(Ordering::Less))),
        BinaryOp::Le => Ok(Scalar::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Gt => Ok(Scalar::Bool(compare(left, right) == Some(Ordering::Greater))),
        BinaryOp::Ge => Ok(Scalar::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOp::And | BinaryOp::Or => {
            let truthy = |s: &Scalar| Value::from(s.clone()).is_truthy();
            Ok(Scalar::Bool(if op == BinaryOp::And {
                truthy(left) && truthy(right)
            } else {
                truthy(left) || truthy(right)
            }))
        }
    }
}

fn add(left: &Scalar, right: &Scalar) -> Result<Scalar, Fault> {
    match (left, right) {
        (Scalar::Void, other) | (other, Scalar::Void) => Ok(other.clone()),
        (Scalar::Str(_), _) | (_, Scalar::Str(_)) => {
            Ok(Scalar::Str(format!("{}{}", left, right)))
        }
        _ => arithmetic(BinaryOp::Add, left, right),
    }
}

fn arithmetic(op: BinaryOp, left: &Scalar, right: &Scalar) -> Result<Scalar, Fault> {
    let zero = Scalar::Int(0);
    let left = if *left == Scalar::Void { &zero } else { left };
    let right = if *right == Scalar::Void { &zero } else { right };

    if let (Scalar::Int(a), Scalar::Int(b)) = (left, right) {
        let result = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Div if *b == 0 => return Err(Fault::arithmetic("division by zero")),
            BinaryOp::Div => a.checked_div(*b),
            _ => None,
        };
        return result
            .map(Scalar::Int)
            .ok_or_else(|| Fault::arithmetic(format!("integer overflow in {:?}", op)));
    }

    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(Fault::type_mismatch(format!(
            "{:?} needs numeric operands, got {:?} and {:?}",
            op, left, right
        )));
    };
    match op {
        BinaryOp::Add => Ok(Scalar::Double(a + b)),
        BinaryOp::Sub => Ok(Scalar::Double(a - b)),
        BinaryOp::Mul => Ok(Scalar::Double(a * b)),
        BinaryOp::Div if b == 0.0 => Err(Fault::arithmetic("division by zero")),
        BinaryOp::Div => Ok(Scalar::Double(a / b)),
        _ => Err(Fault::type_mismatch(format!("{:?} is not arithmetic", op))),
    }
}

fn compare(left: &Scalar, right: &Scalar) -> Option<Ordering> {
    match (left, right) {
        (Scalar::Void, Scalar::Void) => Some(Ordering::Equal),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
        (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
}
