//! Service definitions
//!
//! A [`ServiceDefinition`] is what the engine runs: the behaviour tree, the
//! operations it accepts, the output ports it talks to, how sessions are
//! created, and how inbound messages correlate with running sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::transport::OutputPort;
use crate::interpreter::{Node, OperationSpec, Value, VariablePath};

/// How sessions are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// One session started with the engine; it receives every message
    Single,
    /// One session per starter message, one at a time
    Sequential,
    /// One session per starter message, all concurrent
    #[default]
    Concurrent,
}

/// Routes messages by comparing a session variable with a payload field.
#[derive(Debug, Clone)]
pub struct CorrelationSet {
    /// Path in the session tree holding the key
    pub variable: VariablePath,
    /// Per operation, path in the payload holding the key
    pub aliases: HashMap<String, VariablePath>,
}

impl CorrelationSet {
    /// Correlation on `variable` with no aliases yet.
    pub fn new(variable: impl Into<VariablePath>) -> Self {
        Self {
            variable: variable.into(),
            aliases: HashMap::new(),
        }
    }

    /// Read the key of messages for `operation` at `payload_path`.
    pub fn alias(mut self, operation: impl Into<String>, payload_path: impl Into<VariablePath>) -> Self {
        self.aliases.insert(operation.into(), payload_path.into());
        self
    }

    /// Whether the session state carries the key found in `payload`.
    pub(crate) fn matches(&self, operation: &str, payload: &Value, state: &Value) -> bool {
        let Some(alias) = self.aliases.get(operation) else {
            return false;
        };
        match (alias.get(payload), self.variable.get(state)) {
            (Some(key), Some(current)) => key.is_defined() && key.content() == current.content(),
            _ => false,
        }
    }
}

/// Everything the engine needs to run a service.
pub struct ServiceDefinition {
    name: String,
    mode: ExecutionMode,
    init: Option<Arc<Node>>,
    main: Arc<Node>,
    operations: HashMap<String, Arc<OperationSpec>>,
    starters: Vec<String>,
    output_ports: HashMap<String, Arc<dyn OutputPort>>,
    correlation: Vec<CorrelationSet>,
}

impl ServiceDefinition {
    /// Start building a service running `main`.
    pub fn builder(name: impl Into<String>, main: Arc<Node>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            mode: ExecutionMode::default(),
            init: None,
            main,
            extra_operations: Vec::new(),
            output_ports: HashMap::new(),
            correlation: Vec::new(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Init behaviour, run once before any session.
    pub fn init(&self) -> Option<&Arc<Node>> {
        self.init.as_ref()
    }

    /// Main behaviour.
    pub fn main(&self) -> &Arc<Node> {
        &self.main
    }

    /// Declared input operation.
    pub fn operation(&self, name: &str) -> Option<&Arc<OperationSpec>> {
        self.operations.get(name)
    }

    /// Whether a message for `operation` may start a session.
    pub fn is_starter(&self, operation: &str) -> bool {
        self.starters.iter().any(|op| op == operation)
    }

    /// Output port by id.
    pub fn output_port(&self, id: &str) -> Option<&Arc<dyn OutputPort>> {
        self.output_ports.get(id)
    }

    /// Correlation set governing `operation`, if any.
    pub fn correlation_for(&self, operation: &str) -> Option<&CorrelationSet> {
        self.correlation
            .iter()
            .find(|set| set.aliases.contains_key(operation))
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut operations: Vec<&String> = self.operations.keys().collect();
        operations.sort();
        let mut ports: Vec<&String> = self.output_ports.keys().collect();
        ports.sort();
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("operations", &operations)
            .field("starters", &self.starters)
            .field("output_ports", &ports)
            .finish()
    }
}

/// Builder for [`ServiceDefinition`].
pub struct ServiceBuilder {
    name: String,
    mode: ExecutionMode,
    init: Option<Arc<Node>>,
    main: Arc<Node>,
    extra_operations: Vec<Arc<OperationSpec>>,
    output_ports: HashMap<String, Arc<dyn OutputPort>>,
    correlation: Vec<CorrelationSet>,
}

impl ServiceBuilder {
    /// Set the execution mode.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the init behaviour.
    pub fn init(mut self, init: Arc<Node>) -> Self {
        self.init = Some(init);
        self
    }

    /// Declare an operation not reachable from the behaviour trees.
    pub fn operation(mut self, operation: Arc<OperationSpec>) -> Self {
        self.extra_operations.push(operation);
        self
    }

    /// Register an output port under its id.
    pub fn output_port(mut self, port: impl OutputPort + 'static) -> Self {
        self.output_ports.insert(port.id().to_string(), Arc::new(port));
        self
    }

    /// Register a shared output port under its id.
    pub fn shared_output_port(mut self, port: Arc<dyn OutputPort>) -> Self {
        self.output_ports.insert(port.id().to_string(), port);
        self
    }

    /// Add a correlation set.
    pub fn correlation(mut self, set: CorrelationSet) -> Self {
        self.correlation.push(set);
        self
    }

    /// Finish; input operations are collected from the behaviour trees.
    pub fn build(self) -> ServiceDefinition {
        let mut operations = HashMap::new();
        let collected = self
            .init
            .iter()
            .flat_map(|init| init.input_operations())
            .chain(self.main.input_operations())
            .chain(self.extra_operations);
        for op in collected {
            operations.entry(op.name().to_string()).or_insert(op);
        }
        let starters = self
            .main
            .initial_operations()
            .iter()
            .map(|op| op.name().to_string())
            .collect();

        ServiceDefinition {
            name: self.name,
            mode: self.mode,
            init: self.init,
            main: self.main,
            operations,
            starters,
            output_ports: self.output_ports,
            correlation: self.correlation,
        }
    }
}
