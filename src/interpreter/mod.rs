//! Language-level building blocks
//!
//! Value trees, variable paths, the expression and type-checking seams, and
//! the process-node tree. The step semantics of every node live in
//! `exec` (control flow) and `comm` (communication); both drive an
//! [`ExecutionContext`](crate::runtime::context::ExecutionContext).

pub mod expr;
pub mod fault;
pub mod node;
pub mod path;
pub mod types;
pub mod value;

pub(crate) mod comm;
pub(crate) mod exec;

pub use expr::{BinaryOp, Expr, Expression};
pub use fault::Fault;
pub use node::{ChoiceBranch, ExprRef, HandlerBinding, Node, Outbound, Receive, Reply};
pub use path::{PathError, VariablePath};
pub use types::{BasicType, FieldType, OperationKind, OperationSpec, TypeCheck, TypeMismatch};
pub use value::{Scalar, Value};
