//! Preserves encoding of value trees.
//!
//! A value becomes `<v content [<c "name" [child ...]> ...]>`; void content
//! is the symbol `void`. Messages crossing a channel are marshalled through
//! this codec so sessions never share a tree with their peers.

use preserves::IOValue;
use std::convert::TryFrom;
use thiserror::Error;

use crate::interpreter::{Scalar, Value};

const VALUE_LABEL: &str = "v";
const CHILD_LABEL: &str = "c";
const VOID_SYMBOL: &str = "void";

/// The input is not an encoded value tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode value tree: {0}")]
pub struct DecodeError(String);

/// Lightweight view over a preserves record.
pub struct RecordView<'a> {
    value: &'a IOValue,
}

impl<'a> RecordView<'a> {
    /// Return the number of fields in the record.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether the record label matches an expected symbol.
    pub fn has_label(&self, expected: &str) -> bool {
        self.value
            .label()
            .as_symbol()
            .map(|sym| sym.as_ref() == expected)
            == Some(true)
    }

    /// Access a field by index.
    pub fn field(&self, index: usize) -> IOValue {
        IOValue::from(self.value.index(index))
    }

    /// Interpret the field at `index` as a UTF-8 string.
    pub fn field_string(&self, index: usize) -> Option<String> {
        self.field(index).as_string().map(|s| s.to_string())
    }
}

/// Return the record view if the label matches the expected symbol.
pub fn record_with_label<'a>(value: &'a IOValue, expected: &str) -> Option<RecordView<'a>> {
    if !value.is_record() {
        return None;
    }
    let view = RecordView { value };
    if view.has_label(expected) {
        Some(view)
    } else {
        None
    }
}

fn encode_scalar(content: &Scalar) -> IOValue {
    match content {
        Scalar::Void => IOValue::symbol(VOID_SYMBOL),
        Scalar::Bool(flag) => IOValue::new(*flag),
        Scalar::Int(num) => IOValue::new(*num),
        Scalar::Double(num) => IOValue::new(*num),
        Scalar::Str(text) => IOValue::new(text.clone()),
    }
}

fn decode_scalar(value: &IOValue) -> Result<Scalar, DecodeError> {
    if let Some(sym) = value.as_symbol() {
        if sym.as_ref() == VOID_SYMBOL {
            return Ok(Scalar::Void);
        }
        return Err(DecodeError(format!("unexpected symbol '{}'", sym.as_ref())));
    }
    if let Some(text) = value.as_string() {
        return Ok(Scalar::Str(text.to_string()));
    }
    if let Some(flag) = value.as_boolean() {
        return Ok(Scalar::Bool(flag));
    }
    if let Some(int) = value.as_signed_integer() {
        return i64::try_from(int.as_ref())
            .map(Scalar::Int)
            .map_err(|_| DecodeError("integer out of range".into()));
    }
    if let Some(num) = value.as_double() {
        return Ok(Scalar::Double(num));
    }
    Err(DecodeError("unsupported scalar".into()))
}

/// Encode a value tree.
pub fn encode(value: &Value) -> IOValue {
    let children: Vec<IOValue> = value
        .children()
        .iter()
        .map(|(name, items)| {
            let encoded: Vec<IOValue> = items.iter().map(encode).collect();
            IOValue::record(
                IOValue::symbol(CHILD_LABEL),
                vec![IOValue::new(name.clone()), IOValue::new(encoded)],
            )
        })
        .collect();
    IOValue::record(
        IOValue::symbol(VALUE_LABEL),
        vec![encode_scalar(value.content()), IOValue::new(children)],
    )
}

/// Decode a value tree produced by [`encode`].
pub fn decode(value: &IOValue) -> Result<Value, DecodeError> {
    let record = record_with_label(value, VALUE_LABEL)
        .filter(|view| view.len() == 2)
        .ok_or_else(|| DecodeError("expected <v content children>".into()))?;

    let mut decoded = Value::from(decode_scalar(&record.field(0))?);
    let children = record.field(1);
    if !children.is_sequence() {
        return Err(DecodeError("children must be a sequence".into()));
    }
    for entry in children.iter() {
        let entry = IOValue::from(entry);
        let child = record_with_label(&entry, CHILD_LABEL)
            .filter(|view| view.len() == 2)
            .ok_or_else(|| DecodeError("expected <c name items>".into()))?;
        let name = child
            .field_string(0)
            .ok_or_else(|| DecodeError("child name must be a string".into()))?;
        let items = child.field(1);
        if !items.is_sequence() {
            return Err(DecodeError(format!("items of '{}' must be a sequence", name)));
        }
        let slot = decoded.child_vec_mut(&name);
        for item in items.iter() {
            slot.push(decode(&IOValue::from(item))?);
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_tree_survives_encoding() {
        let value = Value::from("order")
            .with_child("id", 7)
            .with_child("price", 23.5)
            .with_child("paid", false)
            .with_child("lines", Value::new().with_child("sku", "a"))
            .with_child("lines", Value::new().with_child("sku", "b"));

        let decoded = decode(&encode(&value)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_void_content_uses_symbol() {
        let encoded = encode(&Value::new());
        let record = record_with_label(&encoded, "v").unwrap();
        assert_eq!(
            record.field(0).as_symbol().map(|sym| sym.as_ref().to_string()),
            Some("void".to_string())
        );
    }

    #[test]
    fn test_rejects_foreign_records() {
        let foreign = IOValue::record(IOValue::symbol("other"), vec![IOValue::new(1i64)]);
        assert!(decode(&foreign).is_err());
        assert!(decode(&IOValue::new("plain".to_string())).is_err());
    }
}
