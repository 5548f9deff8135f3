//! Variable paths addressing nodes of a value tree
//!
//! A path such as `order.items[2].price` is a list of `(name, index)`
//! segments. Reads never create nodes; writes create every missing node and
//! pad child vectors up to the requested index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::value::{Scalar, Value};

/// One step of a [`VariablePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    /// Child name.
    pub name: String,
    /// Index into the child vector.
    pub index: usize,
}

/// Error produced when parsing a malformed path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid variable path '{path}': {detail}")]
pub struct PathError {
    /// The rejected input
    pub path: String,
    /// What was wrong with it
    pub detail: String,
}

/// Address of a node inside a value tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VariablePath {
    segments: Vec<PathSegment>,
}

impl VariablePath {
    /// The empty path, addressing the tree root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse `a.b[1].c`, rejecting malformed indices and empty names.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let error = |detail: &str| PathError {
            path: text.to_string(),
            detail: detail.to_string(),
        };

        let mut segments = Vec::new();
        if text.is_empty() {
            return Ok(Self { segments });
        }

        for part in text.split('.') {
            let (name, index) = match part.find('[') {
                Some(open) => {
                    let close = part
                        .strip_suffix(']')
                        .ok_or_else(|| error("unterminated index"))?;
                    let index = close[open + 1..]
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| error("index is not a non-negative integer"))?;
                    (&part[..open], index)
                }
                None => (part, 0),
            };
            if name.is_empty() {
                return Err(error("empty segment name"));
            }
            segments.push(PathSegment {
                name: name.to_string(),
                index,
            });
        }

        Ok(Self { segments })
    }

    /// Segments of the path.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// True for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Extend the path with `name[0]`.
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment {
            name: name.to_string(),
            index: 0,
        });
        Self { segments }
    }

    /// Same path with the last index replaced.
    pub fn at(&self, index: usize) -> Self {
        let mut path = self.clone();
        if let Some(last) = path.segments.last_mut() {
            last.index = index;
        }
        path
    }

    /// Read the node at this path.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = current.child(&segment.name)?.get(segment.index)?;
        }
        Some(current)
    }

    /// Clone of the node at this path, or an undefined value.
    pub fn value_of(&self, root: &Value) -> Value {
        self.get(root).cloned().unwrap_or_default()
    }

    fn get_mut<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
        let mut current = root;
        for segment in &self.segments {
            current = current
                .existing_child_vec_mut(&segment.name)?
                .get_mut(segment.index)?;
        }
        Some(current)
    }

    /// Mutable node at this path, creating missing nodes.
    pub fn get_or_create<'a>(&self, root: &'a mut Value) -> &'a mut Value {
        let mut current = root;
        for segment in &self.segments {
            let items = current.child_vec_mut(&segment.name);
            if items.len() <= segment.index {
                items.resize_with(segment.index + 1, Value::default);
            }
            current = &mut items[segment.index];
        }
        current
    }

    /// Assign scalar content at this path, keeping the node's children.
    pub fn assign(&self, root: &mut Value, content: Scalar) {
        self.get_or_create(root).set_content(content);
    }

    /// Deep-copy `source` into the node at this path.
    pub fn deep_copy(&self, root: &mut Value, source: &Value) {
        self.get_or_create(root).deep_copy_from(source);
    }

    /// Replace the whole subtree at this path.
    pub fn replace(&self, root: &mut Value, value: Value) {
        *self.get_or_create(root) = value;
    }

    /// Undefine the path: drop the named child vector from its parent.
    ///
    /// Removing the root path clears the whole tree.
    pub fn remove(&self, root: &mut Value) {
        let Some((last, parents)) = self.segments.split_last() else {
            *root = Value::default();
            return;
        };
        let parent = Self {
            segments: parents.to_vec(),
        };
        if let Some(node) = parent.get_mut(root) {
            node.remove_child(&last.name);
        }
    }

    /// Length of the vector named by the last segment (`#path`).
    pub fn vector_len(&self, root: &Value) -> usize {
        let Some((last, parents)) = self.segments.split_last() else {
            return usize::from(root.is_defined());
        };
        let parent = Self {
            segments: parents.to_vec(),
        };
        parent
            .get(root)
            .and_then(|node| node.child(&last.name))
            .map_or(0, |items| items.len())
    }

    /// Sorted names of the children of the node at this path.
    pub fn child_names(&self, root: &Value) -> Vec<String> {
        self.get(root)
            .map(|node| node.children().keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl FromStr for VariablePath {
    type Err = PathError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text)
    }
}

/// Lenient conversion used by node builders: a malformed index reads as 0.
impl From<&str> for VariablePath {
    fn from(text: &str) -> Self {
        Self::parse(text).unwrap_or_else(|_| {
            let segments = text
                .split('.')
                .filter(|part| !part.is_empty())
                .map(|part| {
                    let name = part.split('[').next().unwrap_or(part);
                    PathSegment {
                        name: name.to_string(),
                        index: 0,
                    }
                })
                .collect();
            Self { segments }
        })
    }
}

impl fmt::Display for VariablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            if position > 0 {
                f.write_str(".")?;
            }
            f.write_str(&segment.name)?;
            if segment.index > 0 {
                write!(f, "[{}]", segment.index)?;
            }
        }
        Ok(())
    }
}
