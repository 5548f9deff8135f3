//! Hierarchical session values

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scalar content stored at a node of a value tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Scalar {
    /// No content.
    #[default]
    Void,
    /// Boolean content.
    Bool(bool),
    /// Signed integer content.
    Int(i64),
    /// Floating-point content.
    Double(f64),
    /// UTF-8 string content.
    Str(String),
}

impl Scalar {
    /// True for integer and floating-point content.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Double(_))
    }

    /// Numeric view of the content, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(num) => Some(*num as f64),
            Scalar::Double(num) => Some(*num),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Void => Ok(()),
            Scalar::Bool(flag) => write!(f, "{}", flag),
            Scalar::Int(num) => write!(f, "{}", num),
            Scalar::Double(num) => write!(f, "{}", num),
            Scalar::Str(text) => f.write_str(text),
        }
    }
}

/// Hierarchical value: scalar content plus named vectors of child values.
///
/// Every session owns one of these as its variable store. Nodes never touch
/// it directly; reads and writes go through [`VariablePath`](super::VariablePath).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Value {
    content: Scalar,
    children: BTreeMap<String, Vec<Value>>,
}

impl Value {
    /// Create an undefined value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scalar content of this node.
    pub fn content(&self) -> &Scalar {
        &self.content
    }

    /// Replace the scalar content, keeping children.
    pub fn set_content(&mut self, content: Scalar) {
        self.content = content;
    }

    /// All child vectors, ordered by name.
    pub fn children(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.children
    }

    /// Child vector for `name`, if present.
    pub fn child(&self, name: &str) -> Option<&Vec<Value>> {
        self.children.get(name)
    }

    /// First element of the child vector for `name`.
    pub fn first_child(&self, name: &str) -> Option<&Value> {
        self.children.get(name).and_then(|items| items.first())
    }

    /// Mutable child vector for `name`, created empty when missing.
    pub fn child_vec_mut(&mut self, name: &str) -> &mut Vec<Value> {
        self.children.entry(name.to_string()).or_default()
    }

    /// Mutable child vector for `name` without creating it.
    pub fn existing_child_vec_mut(&mut self, name: &str) -> Option<&mut Vec<Value>> {
        self.children.get_mut(name)
    }

    /// Remove the whole child vector for `name`.
    pub fn remove_child(&mut self, name: &str) -> Option<Vec<Value>> {
        self.children.remove(name)
    }

    /// Builder-style append of a child element.
    pub fn with_child(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.child_vec_mut(name).push(value.into());
        self
    }

    /// A value is defined when it has content or at least one child.
    pub fn is_defined(&self) -> bool {
        self.content != Scalar::Void || !self.children.is_empty()
    }

    /// Truthiness used by loop and branch conditions.
    pub fn is_truthy(&self) -> bool {
        match &self.content {
            Scalar::Void => false,
            Scalar::Bool(flag) => *flag,
            Scalar::Int(num) => *num != 0,
            Scalar::Double(num) => *num != 0.0,
            Scalar::Str(text) => !text.is_empty(),
        }
    }

    /// Integer content, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self.content {
            Scalar::Int(num) => Some(num),
            _ => None,
        }
    }

    /// Floating-point content, widening integers.
    pub fn as_double(&self) -> Option<f64> {
        self.content.as_f64()
    }

    /// Boolean content, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self.content {
            Scalar::Bool(flag) => Some(flag),
            _ => None,
        }
    }

    /// String content, if any.
    pub fn as_str(&self) -> Option<&str> {
        match &self.content {
            Scalar::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Render the content as text (empty for void).
    pub fn str_value(&self) -> String {
        self.content.to_string()
    }

    /// Copy content and every child vector of `source` into `self`.
    ///
    /// Children of `self` that `source` does not mention are kept.
    pub fn deep_copy_from(&mut self, source: &Value) {
        self.content = source.content.clone();
        for (name, items) in &source.children {
            self.children.insert(name.clone(), items.clone());
        }
    }
}

impl From<Scalar> for Value {
    fn from(content: Scalar) -> Self {
        Self {
            content,
            children: BTreeMap::new(),
        }
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Scalar::Bool(flag).into()
    }
}

impl From<i64> for Value {
    fn from(num: i64) -> Self {
        Scalar::Int(num).into()
    }
}

impl From<i32> for Value {
    fn from(num: i32) -> Self {
        Scalar::Int(num as i64).into()
    }
}

impl From<f64> for Value {
    fn from(num: f64) -> Self {
        Scalar::Double(num).into()
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Scalar::Str(text.to_string()).into()
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Scalar::Str(text).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defined_and_truthy() {
        assert!(!Value::new().is_defined());
        assert!(Value::new().with_child("a", 1).is_defined());
        assert!(Value::from(3).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from(false).is_truthy());
    }

    #[test]
    fn test_deep_copy_keeps_unrelated_children() {
        let mut target = Value::from(1).with_child("keep", "k").with_child("x", 1);
        let source = Value::from("s").with_child("x", 2).with_child("x", 3);
        target.deep_copy_from(&source);

        assert_eq!(target.as_str(), Some("s"));
        assert_eq!(target.child("x").map(|v| v.len()), Some(2));
        assert_eq!(target.first_child("keep").and_then(|v| v.as_str()), Some("k"));
    }

    #[test]
    fn test_double_widening() {
        assert_eq!(Value::from(4).as_double(), Some(4.0));
        assert_eq!(Value::from("4").as_double(), None);
    }
}
