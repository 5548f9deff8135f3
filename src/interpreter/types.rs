//! Type checking seam and declared operation signatures

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fault::Fault;
use super::value::{Scalar, Value};

/// A value failed a declared type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("type mismatch at '{path}': {detail}")]
pub struct TypeMismatch {
    /// Path inside the checked value
    pub path: String,
    /// What did not match
    pub detail: String,
}

impl TypeMismatch {
    fn at(path: &str, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<TypeMismatch> for Fault {
    fn from(mismatch: TypeMismatch) -> Self {
        Fault::type_mismatch(mismatch.to_string())
    }
}

/// Validates message shapes.
pub trait TypeCheck: Send + Sync + Debug {
    /// Return an error describing the first mismatch, if any.
    fn check(&self, value: &Value) -> Result<(), TypeMismatch>;
}

/// Cardinality and type of a named child in a [`BasicType::Tree`].
#[derive(Debug, Clone)]
pub struct FieldType {
    /// Minimum number of occurrences
    pub min: usize,
    /// Maximum number of occurrences (`None` for unbounded)
    pub max: Option<usize>,
    /// Type of each occurrence
    pub ty: BasicType,
}

impl FieldType {
    /// Exactly one occurrence.
    pub fn one(ty: BasicType) -> Self {
        Self { min: 1, max: Some(1), ty }
    }

    /// Zero or one occurrence.
    pub fn optional(ty: BasicType) -> Self {
        Self { min: 0, max: Some(1), ty }
    }

    /// Any number of occurrences.
    pub fn many(ty: BasicType) -> Self {
        Self { min: 0, max: None, ty }
    }
}

/// Small structural type language.
#[derive(Debug, Clone)]
pub enum BasicType {
    /// Anything, including children
    Any,
    /// No content, no children
    Void,
    /// Boolean content, no children
    Bool,
    /// Integer content, no children
    Int,
    /// Floating-point content (integers accepted), no children
    Double,
    /// String content, no children
    String,
    /// Content type plus typed children
    Tree {
        /// Type of the node's own content
        content: Box<BasicType>,
        /// Declared children
        fields: BTreeMap<String, FieldType>,
        /// Whether undeclared children are allowed
        open: bool,
    },
}

impl BasicType {
    /// Closed tree with the given content type and fields.
    pub fn tree(content: BasicType, fields: impl IntoIterator<Item = (&'static str, FieldType)>) -> Self {
        BasicType::Tree {
            content: Box::new(content),
            fields: fields
                .into_iter()
                .map(|(name, field)| (name.to_string(), field))
                .collect(),
            open: false,
        }
    }

    /// Same tree type, allowing undeclared children.
    pub fn open(self) -> Self {
        match self {
            BasicType::Tree { content, fields, .. } => BasicType::Tree {
                content,
                fields,
                open: true,
            },
            other => other,
        }
    }

    fn check_content(&self, content: &Scalar, path: &str) -> Result<(), TypeMismatch> {
        let ok = match (self, content) {
            (BasicType::Any, _) => true,
            (BasicType::Void, Scalar::Void) => true,
            (BasicType::Bool, Scalar::Bool(_)) => true,
            (BasicType::Int, Scalar::Int(_)) => true,
            (BasicType::Double, Scalar::Double(_) | Scalar::Int(_)) => true,
            (BasicType::String, Scalar::Str(_)) => true,
            (BasicType::Tree { content: inner, .. }, _) => {
                return inner.check_content(content, path);
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(TypeMismatch::at(path, format!("expected {}, found {:?}", self.name(), content)))
        }
    }

    fn check_at(&self, value: &Value, path: &str) -> Result<(), TypeMismatch> {
        self.check_content(value.content(), path)?;
        match self {
            BasicType::Any => Ok(()),
            BasicType::Tree { fields, open, .. } => {
                for (name, field) in fields {
                    let items = value.child(name).map_or(&[][..], |items| items.as_slice());
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{}.{}", path, name)
                    };
                    if items.len() < field.min || field.max.is_some_and(|max| items.len() > max) {
                        return Err(TypeMismatch::at(
                            &child_path,
                            format!("cardinality {} outside [{}, {:?}]", items.len(), field.min, field.max),
                        ));
                    }
                    for item in items {
                        field.ty.check_at(item, &child_path)?;
                    }
                }
                if !open {
                    if let Some(extra) = value.children().keys().find(|name| !fields.contains_key(*name)) {
                        return Err(TypeMismatch::at(path, format!("undeclared child '{}'", extra)));
                    }
                }
                Ok(())
            }
            _ if !value.children().is_empty() => {
                Err(TypeMismatch::at(path, format!("{} takes no children", self.name())))
            }
            _ => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            BasicType::Any => "any",
            BasicType::Void => "void",
            BasicType::Bool => "bool",
            BasicType::Int => "int",
            BasicType::Double => "double",
            BasicType::String => "string",
            BasicType::Tree { .. } => "tree",
        }
    }
}

impl TypeCheck for BasicType {
    fn check(&self, value: &Value) -> Result<(), TypeMismatch> {
        self.check_at(value, "")
    }
}

/// Whether an operation expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Fire and forget
    OneWay,
    /// Request followed by a response or a fault
    RequestResponse,
}

/// Declared signature of an operation.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    name: String,
    kind: OperationKind,
    request: Option<Arc<dyn TypeCheck>>,
    response: Option<Arc<dyn TypeCheck>>,
    faults: HashMap<String, Option<Arc<dyn TypeCheck>>>,
}

impl OperationSpec {
    /// One-way operation with untyped payload.
    pub fn one_way(name: impl Into<String>) -> Self {
        Self::with_kind(name, OperationKind::OneWay)
    }

    /// Request-response operation with untyped payloads.
    pub fn request_response(name: impl Into<String>) -> Self {
        Self::with_kind(name, OperationKind::RequestResponse)
    }

    fn with_kind(name: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            request: None,
            response: None,
            faults: HashMap::new(),
        }
    }

    /// Declare the request type.
    pub fn with_request(mut self, ty: impl TypeCheck + 'static) -> Self {
        self.request = Some(Arc::new(ty));
        self
    }

    /// Declare the response type.
    pub fn with_response(mut self, ty: impl TypeCheck + 'static) -> Self {
        self.response = Some(Arc::new(ty));
        self
    }

    /// Declare a fault whose value is not checked.
    pub fn with_fault(mut self, name: impl Into<String>) -> Self {
        self.faults.insert(name.into(), None);
        self
    }

    /// Declare a fault with a typed value.
    pub fn with_typed_fault(mut self, name: impl Into<String>, ty: impl TypeCheck + 'static) -> Self {
        self.faults.insert(name.into(), Some(Arc::new(ty)));
        self
    }

    /// Operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Check an inbound or outbound request payload.
    pub fn check_request(&self, value: &Value) -> Result<(), TypeMismatch> {
        self.request.as_ref().map_or(Ok(()), |ty| ty.check(value))
    }

    /// Check a response payload.
    pub fn check_response(&self, value: &Value) -> Result<(), TypeMismatch> {
        self.response.as_ref().map_or(Ok(()), |ty| ty.check(value))
    }

    /// Whether a fault of this name is declared.
    pub fn declares_fault(&self, name: &str) -> bool {
        self.faults.contains_key(name)
    }

    /// Check that a fault is declared and its value matches.
    pub fn check_fault(&self, fault: &Fault) -> Result<(), TypeMismatch> {
        match self.faults.get(&fault.name) {
            None => Err(TypeMismatch::at("", format!("undeclared fault '{}'", fault.name))),
            Some(None) => Ok(()),
            Some(Some(ty)) => ty.check(&fault.value),
        }
    }
}
