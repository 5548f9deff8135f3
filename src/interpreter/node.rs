//! Process-node tree
//!
//! A [`Node`] is an immutable description of one control or communication
//! step. Trees are shared by every session through `Arc<Node>`; all
//! per-session progress lives in the continuations of an execution context,
//! so starting a session never copies the tree.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::expr::Expression;
use super::path::VariablePath;
use super::types::OperationSpec;

/// Shared expression handle stored in nodes.
pub type ExprRef = Arc<dyn Expression>;

/// Inbound communication guard (one-way or request-response).
#[derive(Debug, Clone)]
pub struct Receive {
    /// Declared operation
    pub operation: Arc<OperationSpec>,
    /// Where the request payload is stored
    pub input: Option<VariablePath>,
    /// Reply part, present for request-response
    pub reply: Option<Reply>,
}

/// Body and response expression of a request-response input.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Runs between receipt and reply
    pub body: Arc<Node>,
    /// Computes the response payload
    pub output: Option<ExprRef>,
}

/// One branch of a choice: an input guard and the process that follows it.
#[derive(Debug, Clone)]
pub struct ChoiceBranch {
    /// Input that selects the branch
    pub guard: Receive,
    /// Continuation after the guard
    pub body: Arc<Node>,
}

impl ChoiceBranch {
    /// Build a branch.
    pub fn new(guard: Receive, body: Arc<Node>) -> Self {
        Self { guard, body }
    }
}

/// Outbound communication through an output port.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Output port id, resolved against the service definition
    pub port: String,
    /// Declared operation
    pub operation: Arc<OperationSpec>,
    /// Request payload
    pub output: Option<ExprRef>,
    /// Where the response is stored (solicit-response only)
    pub input: Option<VariablePath>,
    /// Process run after the response (solicit-response only)
    pub install: Option<Arc<Node>>,
}

/// Handler bound by an [`Node::Install`].
#[derive(Debug, Clone)]
pub struct HandlerBinding {
    /// Fault name, or `None` for the enclosing scope's compensation
    pub fault: Option<String>,
    /// Handler body
    pub handler: Arc<Node>,
}

impl HandlerBinding {
    /// Handler for a named fault.
    pub fn fault(name: impl Into<String>, handler: Arc<Node>) -> Self {
        Self {
            fault: Some(name.into()),
            handler,
        }
    }

    /// Compensation of the enclosing scope.
    pub fn compensation(handler: Arc<Node>) -> Self {
        Self {
            fault: None,
            handler,
        }
    }
}

/// Process node variants.
pub enum Node {
    /// Does nothing
    Null,
    /// Terminates the whole session
    Exit,
    /// Runs children in order
    Sequence(Vec<Arc<Node>>),
    /// Runs children concurrently and joins
    Parallel(Vec<Arc<Node>>),
    /// Conditional
    If {
        /// Condition
        condition: ExprRef,
        /// Taken when the condition is truthy
        then: Arc<Node>,
        /// Taken otherwise
        otherwise: Option<Arc<Node>>,
    },
    /// Pre-tested loop
    While {
        /// Re-evaluated before every iteration
        condition: ExprRef,
        /// Loop body
        body: Arc<Node>,
    },
    /// Counted loop
    For {
        /// Runs once before the first check
        init: Arc<Node>,
        /// Re-evaluated before every iteration
        condition: ExprRef,
        /// Runs after every iteration
        post: Arc<Node>,
        /// Loop body
        body: Arc<Node>,
    },
    /// Iterates the elements of a vector, copying each into `item`
    ForEachArray {
        /// Vector to iterate
        target: VariablePath,
        /// Receives a copy of the current element
        item: VariablePath,
        /// Loop body
        body: Arc<Node>,
    },
    /// Iterates the child names of a node
    ForEachField {
        /// Node whose children are iterated
        target: VariablePath,
        /// Receives the current child name
        key: VariablePath,
        /// Loop body
        body: Arc<Node>,
    },
    /// Assigns scalar content
    Assign {
        /// Destination
        target: VariablePath,
        /// Source
        expression: ExprRef,
    },
    /// Copies a whole subtree
    DeepCopy {
        /// Destination
        target: VariablePath,
        /// Source
        expression: ExprRef,
    },
    /// Adds one
    Increment(VariablePath),
    /// Subtracts one
    Decrement(VariablePath),
    /// Removes a variable
    Undef(VariablePath),
    /// Named fault-handling scope
    Scope {
        /// Scope id, used by handlers, compensation and fault data
        id: String,
        /// Scope body
        body: Arc<Node>,
    },
    /// Binds handlers in the current scope
    Install(Vec<HandlerBinding>),
    /// Placeholder for the handler being replaced by an install
    CurrentHandler,
    /// Raises a fault
    Throw {
        /// Fault name
        fault: String,
        /// Fault value
        expression: Option<ExprRef>,
    },
    /// Runs the compensation of a completed child scope
    Compensate(String),
    /// Runs the body while holding a process-wide lock
    Synchronized {
        /// Lock id
        id: String,
        /// Protected body
        body: Arc<Node>,
    },
    /// Non-deterministic choice among inputs
    Choice(Vec<ChoiceBranch>),
    /// Repeats `provide` branches until an `until` branch fires
    ProvideUntil {
        /// Looping branches
        provide: Vec<ChoiceBranch>,
        /// Terminating branches
        until: Vec<ChoiceBranch>,
    },
    /// Inbound one-way input
    OneWay(Receive),
    /// Inbound request-response input
    RequestResponse(Receive),
    /// Outbound one-way send
    Notification(Outbound),
    /// Outbound request with a response
    SolicitResponse(Outbound),
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Null => f.write_str("Null"),
            Node::Exit => f.write_str("Exit"),
            Node::Sequence(children) => f.debug_tuple("Sequence").field(&children.len()).finish(),
            Node::Parallel(children) => f.debug_tuple("Parallel").field(&children.len()).finish(),
            Node::If { .. } => f.write_str("If"),
            Node::While { .. } => f.write_str("While"),
            Node::For { .. } => f.write_str("For"),
            Node::ForEachArray { target, .. } => write!(f, "ForEachArray({})", target),
            Node::ForEachField { target, .. } => write!(f, "ForEachField({})", target),
            Node::Assign { target, .. } => write!(f, "Assign({})", target),
            Node::DeepCopy { target, .. } => write!(f, "DeepCopy({})", target),
            Node::Increment(path) => write!(f, "Increment({})", path),
            Node::Decrement(path) => write!(f, "Decrement({})", path),
            Node::Undef(path) => write!(f, "Undef({})", path),
            Node::Scope { id, .. } => write!(f, "Scope({})", id),
            Node::Install(bindings) => f.debug_tuple("Install").field(&bindings.len()).finish(),
            Node::CurrentHandler => f.write_str("CurrentHandler"),
            Node::Throw { fault, .. } => write!(f, "Throw({})", fault),
            Node::Compensate(id) => write!(f, "Compensate({})", id),
            Node::Synchronized { id, .. } => write!(f, "Synchronized({})", id),
            Node::Choice(branches) => f.debug_tuple("Choice").field(&branches.len()).finish(),
            Node::ProvideUntil { provide, until } => {
                write!(f, "ProvideUntil({}, {})", provide.len(), until.len())
            }
            Node::OneWay(receive) => write!(f, "OneWay({})", receive.operation.name()),
            Node::RequestResponse(receive) => {
                write!(f, "RequestResponse({})", receive.operation.name())
            }
            Node::Notification(out) => {
                write!(f, "Notification({}@{})", out.operation.name(), out.port)
            }
            Node::SolicitResponse(out) => {
                write!(f, "SolicitResponse({}@{})", out.operation.name(), out.port)
            }
        }
    }
}

fn expr(expression: impl Expression + 'static) -> ExprRef {
    Arc::new(expression)
}

impl Node {
    /// `nullProcess`.
    pub fn null() -> Arc<Node> {
        Arc::new(Node::Null)
    }

    /// `exit`.
    pub fn exit() -> Arc<Node> {
        Arc::new(Node::Exit)
    }

    /// `a ; b ; c`.
    pub fn sequence(children: Vec<Arc<Node>>) -> Arc<Node> {
        Arc::new(Node::Sequence(children))
    }

    /// `a | b | c`.
    pub fn parallel(children: Vec<Arc<Node>>) -> Arc<Node> {
        Arc::new(Node::Parallel(children))
    }

    /// `if (cond) then else otherwise`.
    pub fn if_then(
        condition: impl Expression + 'static,
        then: Arc<Node>,
        otherwise: Option<Arc<Node>>,
    ) -> Arc<Node> {
        Arc::new(Node::If {
            condition: expr(condition),
            then,
            otherwise,
        })
    }

    /// `while (cond) body`.
    pub fn while_loop(condition: impl Expression + 'static, body: Arc<Node>) -> Arc<Node> {
        Arc::new(Node::While {
            condition: expr(condition),
            body,
        })
    }

    /// `for (init, cond, post) body`.
    pub fn for_loop(
        init: Arc<Node>,
        condition: impl Expression + 'static,
        post: Arc<Node>,
        body: Arc<Node>,
    ) -> Arc<Node> {
        Arc::new(Node::For {
            init,
            condition: expr(condition),
            post,
            body,
        })
    }

    /// `for (item in target) body`.
    pub fn for_each_array(
        target: impl Into<VariablePath>,
        item: impl Into<VariablePath>,
        body: Arc<Node>,
    ) -> Arc<Node> {
        Arc::new(Node::ForEachArray {
            target: target.into(),
            item: item.into(),
            body,
        })
    }

    /// `foreach (key : target) body`.
    pub fn for_each_field(
        target: impl Into<VariablePath>,
        key: impl Into<VariablePath>,
        body: Arc<Node>,
    ) -> Arc<Node> {
        Arc::new(Node::ForEachField {
            target: target.into(),
            key: key.into(),
            body,
        })
    }

    /// `target = expression`.
    pub fn assign(target: impl Into<VariablePath>, expression: impl Expression + 'static) -> Arc<Node> {
        Arc::new(Node::Assign {
            target: target.into(),
            expression: expr(expression),
        })
    }

    /// `target << expression`.
    pub fn deep_copy(
        target: impl Into<VariablePath>,
        expression: impl Expression + 'static,
    ) -> Arc<Node> {
        Arc::new(Node::DeepCopy {
            target: target.into(),
            expression: expr(expression),
        })
    }

    /// `target++`.
    pub fn increment(target: impl Into<VariablePath>) -> Arc<Node> {
        Arc::new(Node::Increment(target.into()))
    }

    /// `target--`.
    pub fn decrement(target: impl Into<VariablePath>) -> Arc<Node> {
        Arc::new(Node::Decrement(target.into()))
    }

    /// `undef(target)`.
    pub fn undef(target: impl Into<VariablePath>) -> Arc<Node> {
        Arc::new(Node::Undef(target.into()))
    }

    /// `scope(id) { body }`.
    pub fn scope(id: impl Into<String>, body: Arc<Node>) -> Arc<Node> {
        Arc::new(Node::Scope {
            id: id.into(),
            body,
        })
    }

    /// `install(...)`.
    pub fn install(bindings: Vec<HandlerBinding>) -> Arc<Node> {
        Arc::new(Node::Install(bindings))
    }

    /// `cH`.
    pub fn current_handler() -> Arc<Node> {
        Arc::new(Node::CurrentHandler)
    }

    /// `throw(fault, value)`.
    pub fn throw(fault: impl Into<String>, expression: Option<ExprRef>) -> Arc<Node> {
        Arc::new(Node::Throw {
            fault: fault.into(),
            expression,
        })
    }

    /// `comp(scope)`.
    pub fn compensate(scope: impl Into<String>) -> Arc<Node> {
        Arc::new(Node::Compensate(scope.into()))
    }

    /// `synchronized(id) { body }`.
    pub fn synchronized(id: impl Into<String>, body: Arc<Node>) -> Arc<Node> {
        Arc::new(Node::Synchronized {
            id: id.into(),
            body,
        })
    }

    /// `[guard] { body } ...`.
    pub fn choice(branches: Vec<ChoiceBranch>) -> Arc<Node> {
        Arc::new(Node::Choice(branches))
    }

    /// `provide [..] until [..]`.
    pub fn provide_until(provide: Vec<ChoiceBranch>, until: Vec<ChoiceBranch>) -> Arc<Node> {
        Arc::new(Node::ProvideUntil { provide, until })
    }

    /// `op(input)`.
    pub fn one_way(operation: Arc<OperationSpec>, input: Option<VariablePath>) -> Arc<Node> {
        Arc::new(Node::OneWay(Receive::one_way(operation, input)))
    }

    /// `op(input)(output) { body }`.
    pub fn request_response(
        operation: Arc<OperationSpec>,
        input: Option<VariablePath>,
        output: Option<ExprRef>,
        body: Arc<Node>,
    ) -> Arc<Node> {
        Arc::new(Node::RequestResponse(Receive::request_response(
            operation, input, output, body,
        )))
    }

    /// `op@port(output)`.
    pub fn notification(
        port: impl Into<String>,
        operation: Arc<OperationSpec>,
        output: Option<ExprRef>,
    ) -> Arc<Node> {
        Arc::new(Node::Notification(Outbound {
            port: port.into(),
            operation,
            output,
            input: None,
            install: None,
        }))
    }

    /// `op@port(output)(input) [install]`.
    pub fn solicit_response(
        port: impl Into<String>,
        operation: Arc<OperationSpec>,
        output: Option<ExprRef>,
        input: Option<VariablePath>,
        install: Option<Arc<Node>>,
    ) -> Arc<Node> {
        Arc::new(Node::SolicitResponse(Outbound {
            port: port.into(),
            operation,
            output,
            input,
            install,
        }))
    }

    /// Whether a kill may discard this node before it runs.
    pub fn is_killable(&self) -> bool {
        match self {
            Node::Install(_) => false,
            Node::Sequence(children) | Node::Parallel(children) => {
                children.iter().all(|child| child.is_killable())
            }
            Node::Scope { body, .. } | Node::Synchronized { body, .. } => body.is_killable(),
            _ => true,
        }
    }

    /// Replace every `cH` outside nested installs with `current`.
    ///
    /// Subtrees without a `cH` are shared with the original tree; the result
    /// is `self` itself when nothing changes.
    pub fn bind_current_handler(self: &Arc<Self>, current: Option<&Arc<Node>>) -> Arc<Node> {
        rebind(self, current).unwrap_or_else(|| Arc::clone(self))
    }

    /// Inputs the node may block on before doing anything else.
    pub fn initial_operations(&self) -> Vec<Arc<OperationSpec>> {
        match self {
            Node::OneWay(receive) | Node::RequestResponse(receive) => {
                vec![Arc::clone(&receive.operation)]
            }
            Node::Choice(branches) => branch_operations(branches),
            Node::ProvideUntil { provide, until } => {
                let mut ops = branch_operations(provide);
                ops.extend(branch_operations(until));
                ops
            }
            Node::Sequence(children) => children
                .first()
                .map(|child| child.initial_operations())
                .unwrap_or_default(),
            Node::Parallel(children) => children
                .iter()
                .flat_map(|child| child.initial_operations())
                .collect(),
            Node::Scope { body, .. } | Node::Synchronized { body, .. } => body.initial_operations(),
            _ => Vec::new(),
        }
    }

    /// Every inbound operation declared anywhere in the tree, deduplicated by name.
    pub fn input_operations(&self) -> Vec<Arc<OperationSpec>> {
        let mut seen = HashSet::new();
        let mut ops = Vec::new();
        self.visit_inputs(&mut |op| {
            if seen.insert(op.name().to_string()) {
                ops.push(Arc::clone(op));
            }
        });
        ops
    }

    fn visit_inputs(&self, visit: &mut dyn FnMut(&Arc<OperationSpec>)) {
        match self {
            Node::OneWay(receive) | Node::RequestResponse(receive) => visit_receive(receive, visit),
            Node::Choice(branches) => {
                for branch in branches {
                    visit_receive(&branch.guard, visit);
                    branch.body.visit_inputs(visit);
                }
            }
            Node::ProvideUntil { provide, until } => {
                for branch in provide.iter().chain(until) {
                    visit_receive(&branch.guard, visit);
                    branch.body.visit_inputs(visit);
                }
            }
            _ => {
                for child in self.children() {
                    child.visit_inputs(visit);
                }
            }
        }
    }

    /// Direct child processes of control-flow nodes.
    fn children(&self) -> Vec<&Arc<Node>> {
        match self {
            Node::Sequence(children) | Node::Parallel(children) => children.iter().collect(),
            Node::If {
                then, otherwise, ..
            } => std::iter::once(then).chain(otherwise.iter()).collect(),
            Node::While { body, .. }
            | Node::ForEachArray { body, .. }
            | Node::ForEachField { body, .. }
            | Node::Scope { body, .. }
            | Node::Synchronized { body, .. } => vec![body],
            Node::For {
                init, post, body, ..
            } => vec![init, post, body],
            Node::Install(bindings) => bindings.iter().map(|binding| &binding.handler).collect(),
            Node::SolicitResponse(out) => out.install.iter().collect(),
            _ => Vec::new(),
        }
    }
}

fn visit_receive(receive: &Receive, visit: &mut dyn FnMut(&Arc<OperationSpec>)) {
    visit(&receive.operation);
    if let Some(reply) = &receive.reply {
        reply.body.visit_inputs(visit);
    }
}

fn branch_operations(branches: &[ChoiceBranch]) -> Vec<Arc<OperationSpec>> {
    branches
        .iter()
        .map(|branch| Arc::clone(&branch.guard.operation))
        .collect()
}

impl Receive {
    /// Guard for a one-way input.
    pub fn one_way(operation: Arc<OperationSpec>, input: Option<VariablePath>) -> Self {
        Self {
            operation,
            input,
            reply: None,
        }
    }

    /// Guard for a request-response input.
    pub fn request_response(
        operation: Arc<OperationSpec>,
        input: Option<VariablePath>,
        output: Option<ExprRef>,
        body: Arc<Node>,
    ) -> Self {
        Self {
            operation,
            input,
            reply: Some(Reply { body, output }),
        }
    }

    fn rebind(&self, current: Option<&Arc<Node>>) -> Option<Receive> {
        let reply = self.reply.as_ref()?;
        let body = rebind(&reply.body, current)?;
        Some(Receive {
            operation: Arc::clone(&self.operation),
            input: self.input.clone(),
            reply: Some(Reply {
                body,
                output: reply.output.clone(),
            }),
        })
    }
}

fn rebind_all(children: &[Arc<Node>], current: Option<&Arc<Node>>) -> Option<Vec<Arc<Node>>> {
    let rebound: Vec<Option<Arc<Node>>> = children.iter().map(|child| rebind(child, current)).collect();
    if rebound.iter().all(Option::is_none) {
        return None;
    }
    Some(
        rebound
            .into_iter()
            .zip(children)
            .map(|(new, old)| new.unwrap_or_else(|| Arc::clone(old)))
            .collect(),
    )
}

fn rebind_branches(branches: &[ChoiceBranch], current: Option<&Arc<Node>>) -> Option<Vec<ChoiceBranch>> {
    let rebound: Vec<(Option<Receive>, Option<Arc<Node>>)> = branches
        .iter()
        .map(|branch| (branch.guard.rebind(current), rebind(&branch.body, current)))
        .collect();
    if rebound.iter().all(|(guard, body)| guard.is_none() && body.is_none()) {
        return None;
    }
    Some(
        rebound
            .into_iter()
            .zip(branches)
            .map(|((guard, body), old)| ChoiceBranch {
                guard: guard.unwrap_or_else(|| old.guard.clone()),
                body: body.unwrap_or_else(|| Arc::clone(&old.body)),
            })
            .collect(),
    )
}

fn keep(node: &Arc<Node>, rebound: Option<Arc<Node>>) -> Arc<Node> {
    rebound.unwrap_or_else(|| Arc::clone(node))
}

/// `None` when the subtree contains no `cH` to replace.
fn rebind(node: &Arc<Node>, current: Option<&Arc<Node>>) -> Option<Arc<Node>> {
    let replaced = match node.as_ref() {
        Node::CurrentHandler => current.map_or_else(Node::null, Arc::clone),
        Node::Sequence(children) => Node::sequence(rebind_all(children, current)?),
        Node::Parallel(children) => Node::parallel(rebind_all(children, current)?),
        Node::If {
            condition,
            then,
            otherwise,
        } => {
            let new_then = rebind(then, current);
            let new_otherwise = otherwise.as_ref().and_then(|branch| rebind(branch, current));
            if new_then.is_none() && new_otherwise.is_none() {
                return None;
            }
            Arc::new(Node::If {
                condition: Arc::clone(condition),
                then: keep(then, new_then),
                otherwise: match (otherwise, new_otherwise) {
                    (_, Some(branch)) => Some(branch),
                    (old, None) => old.clone(),
                },
            })
        }
        Node::While { condition, body } => Arc::new(Node::While {
            condition: Arc::clone(condition),
            body: rebind(body, current)?,
        }),
        Node::For {
            init,
            condition,
            post,
            body,
        } => {
            let rebound = rebind_all(&[Arc::clone(init), Arc::clone(post), Arc::clone(body)], current)?;
            let [init, post, body]: [Arc<Node>; 3] = rebound.try_into().ok()?;
            Arc::new(Node::For {
                init,
                condition: Arc::clone(condition),
                post,
                body,
            })
        }
        Node::ForEachArray { target, item, body } => Arc::new(Node::ForEachArray {
            target: target.clone(),
            item: item.clone(),
            body: rebind(body, current)?,
        }),
        Node::ForEachField { target, key, body } => Arc::new(Node::ForEachField {
            target: target.clone(),
            key: key.clone(),
            body: rebind(body, current)?,
        }),
        Node::Scope { id, body } => Node::scope(id.clone(), rebind(body, current)?),
        Node::Synchronized { id, body } => Node::synchronized(id.clone(), rebind(body, current)?),
        Node::Choice(branches) => Node::choice(rebind_branches(branches, current)?),
        Node::ProvideUntil { provide, until } => {
            let new_provide = rebind_branches(provide, current);
            let new_until = rebind_branches(until, current);
            if new_provide.is_none() && new_until.is_none() {
                return None;
            }
            Node::provide_until(
                new_provide.unwrap_or_else(|| provide.clone()),
                new_until.unwrap_or_else(|| until.clone()),
            )
        }
        Node::RequestResponse(receive) => Arc::new(Node::RequestResponse(receive.rebind(current)?)),
        // A nested install resolves its own cH when it runs.
        _ => return None,
    };
    Some(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::expr::Expr;

    #[test]
    fn test_killability() {
        let install = Node::install(vec![]);
        assert!(!install.is_killable());
        assert!(Node::sequence(vec![Node::null(), Node::null()]).is_killable());
        assert!(!Node::sequence(vec![Node::null(), install.clone()]).is_killable());
        assert!(!Node::scope("s", install.clone()).is_killable());
        assert!(Node::while_loop(Expr::value(true), install).is_killable());
    }

    #[test]
    fn test_bind_current_handler_shares_untouched_trees() {
        let tree = Node::sequence(vec![Node::increment("x"), Node::null()]);
        let bound = tree.bind_current_handler(Some(&Node::exit()));
        assert!(Arc::ptr_eq(&tree, &bound));
    }

    #[test]
    fn test_bind_current_handler_replaces_placeholder() {
        let previous = Node::increment("previous");
        let untouched = Node::increment("x");
        let tree = Node::sequence(vec![Arc::clone(&untouched), Node::current_handler()]);

        let bound = tree.bind_current_handler(Some(&previous));
        let Node::Sequence(children) = bound.as_ref() else {
            panic!("expected sequence");
        };
        assert!(Arc::ptr_eq(&children[0], &untouched));
        assert!(Arc::ptr_eq(&children[1], &previous));

        let unbound = tree.bind_current_handler(None);
        let Node::Sequence(children) = unbound.as_ref() else {
            panic!("expected sequence");
        };
        assert!(matches!(children[1].as_ref(), Node::Null));
    }

    #[test]
    fn test_nested_install_keeps_its_placeholder() {
        let nested = Node::install(vec![HandlerBinding::compensation(Node::current_handler())]);
        let bound = nested.bind_current_handler(Some(&Node::exit()));
        assert!(Arc::ptr_eq(&nested, &bound));
    }

    #[test]
    fn test_initial_and_input_operations() {
        let start = Arc::new(OperationSpec::one_way("start"));
        let other = Arc::new(OperationSpec::one_way("other"));
        let main = Node::sequence(vec![
            Node::choice(vec![ChoiceBranch::new(
                Receive::one_way(Arc::clone(&start), None),
                Node::one_way(Arc::clone(&other), None),
            )]),
            Node::one_way(Arc::clone(&start), None),
        ]);

        let initial: Vec<String> = main.initial_operations().iter().map(|op| op.name().to_string()).collect();
        assert_eq!(initial, vec!["start"]);

        let all: Vec<String> = main.input_operations().iter().map(|op| op.name().to_string()).collect();
        assert_eq!(all, vec!["start", "other"]);
    }
}
