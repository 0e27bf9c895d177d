//! Types module: the interpreter's value model.
//!
//! This module provides the Value tagged union, its XPath 1.0 conversions and the relational
//! comparison matrix used by relation and branch opcodes.

use crate::message::Document;
use crate::sequence::NodeSequence;
use crate::{Result, WirequeryError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Boolean,
    Double,
    String,
    Sequence,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Boolean => "boolean",
            ValueType::Double => "number",
            ValueType::String => "string",
            ValueType::Sequence => "node-set",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelationOp {
    pub fn is_equality(self) -> bool {
        matches!(self, RelationOp::Eq | RelationOp::Ne)
    }

    /// The operator to use when the operands are swapped.
    pub fn flip(self) -> RelationOp {
        match self {
            RelationOp::Lt => RelationOp::Gt,
            RelationOp::Le => RelationOp::Ge,
            RelationOp::Gt => RelationOp::Lt,
            RelationOp::Ge => RelationOp::Le,
            other => other,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            RelationOp::Eq => "=",
            RelationOp::Ne => "!=",
            RelationOp::Lt => "<",
            RelationOp::Le => "<=",
            RelationOp::Gt => ">",
            RelationOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Plus,
    Minus,
    Multiply,
    Div,
    Mod,
}

impl ArithmeticOp {
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            ArithmeticOp::Plus => left + right,
            ArithmeticOp::Minus => left - right,
            ArithmeticOp::Multiply => left * right,
            ArithmeticOp::Div => left / right,
            ArithmeticOp::Mod => left % right,
        }
    }
}

/// One operand on the value stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    String(String),
    Sequence(NodeSequence),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Sequence(_) => ValueType::Sequence,
        }
    }

    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Double(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Sequence(seq) => !seq.is_empty(),
        }
    }

    pub fn to_double(&self, doc: &Document) -> f64 {
        match self {
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Double(n) => *n,
            Value::String(s) => string_to_number(s),
            Value::Sequence(seq) => match seq.first_in_document_order() {
                Some(node) => string_to_number(&doc.string_value(node)),
                None => f64::NAN,
            },
        }
    }

    pub fn to_xpath_string(&self, doc: &Document) -> String {
        match self {
            Value::Boolean(b) => b.to_string(),
            Value::Double(n) => number_to_string(*n),
            Value::String(s) => s.clone(),
            Value::Sequence(seq) => seq.first_in_document_order().map(|n| doc.string_value(n)).unwrap_or_default(),
        }
    }

    pub fn as_sequence(&self) -> Result<&NodeSequence> {
        match self {
            Value::Sequence(seq) => Ok(seq),
            other => Err(WirequeryError::TypeMismatch(format!("expected a node-set, found a {}", other.value_type()))),
        }
    }

    pub fn as_sequence_mut(&mut self) -> Result<&mut NodeSequence> {
        match self {
            Value::Sequence(seq) => Ok(seq),
            other => Err(WirequeryError::TypeMismatch(format!("expected a node-set, found a {}", other.value_type()))),
        }
    }

    /// XPath `self = literal` for a string literal, without materializing the literal as a value.
    pub fn equals_str(&self, literal: &str, doc: &Document) -> bool {
        match self {
            Value::Boolean(b) => *b == !literal.is_empty(),
            Value::Double(n) => *n == string_to_number(literal),
            Value::String(s) => s == literal,
            Value::Sequence(seq) => seq.distinct_nodes().any(|node| doc.string_value(node) == literal),
        }
    }

    /// XPath `self = literal` for a number literal.
    pub fn equals_number(&self, literal: f64, doc: &Document) -> bool {
        match self {
            Value::Boolean(b) => *b == (literal != 0.0 && !literal.is_nan()),
            Value::Double(n) => *n == literal,
            Value::String(s) => string_to_number(s) == literal,
            Value::Sequence(seq) => {
                seq.distinct_nodes().any(|node| string_to_number(&doc.string_value(node)) == literal)
            }
        }
    }

    /// Relational comparison over the 4x4 operand type matrix.
    ///
    /// Two node-sets compare true when some pair of their nodes does: by string-value for `=`
    /// and `!=`, by numeric string-value for the orderings.
    pub fn compare(&self, op: RelationOp, other: &Value, doc: &Document) -> bool {
        match (self, other) {
            (Value::Sequence(left), Value::Sequence(right)) => {
                let right_values: Vec<String> = right.distinct_nodes().map(|n| doc.string_value(n)).collect();
                if op.is_equality() {
                    left.distinct_nodes().any(|n| {
                        let l = doc.string_value(n);
                        right_values.iter().any(|r| compare_strings(op, &l, r))
                    })
                } else {
                    let right_numbers: Vec<f64> = right_values.iter().map(|r| string_to_number(r)).collect();
                    left.distinct_nodes().any(|n| {
                        let l = string_to_number(&doc.string_value(n));
                        right_numbers.iter().any(|&r| compare_numbers(op, l, r))
                    })
                }
            }
            (Value::Sequence(seq), scalar) => compare_sequence(seq, op, scalar, doc),
            (scalar, Value::Sequence(seq)) => compare_sequence(seq, op.flip(), scalar, doc),
            (left, right) => compare_scalars(left, op, right),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

fn compare_sequence(seq: &NodeSequence, op: RelationOp, scalar: &Value, doc: &Document) -> bool {
    match scalar {
        Value::Boolean(b) => compare_booleans(op, !seq.is_empty(), *b),
        Value::Double(n) => seq
            .distinct_nodes()
            .any(|node| compare_numbers(op, string_to_number(&doc.string_value(node)), *n)),
        Value::String(s) => {
            if op.is_equality() {
                seq.distinct_nodes().any(|node| compare_strings(op, &doc.string_value(node), s))
            } else {
                let rhs = string_to_number(s);
                seq.distinct_nodes()
                    .any(|node| compare_numbers(op, string_to_number(&doc.string_value(node)), rhs))
            }
        }
        Value::Sequence(_) => false,
    }
}

fn compare_scalars(left: &Value, op: RelationOp, right: &Value) -> bool {
    if op.is_equality() {
        match (left, right) {
            (Value::Boolean(_), _) | (_, Value::Boolean(_)) => {
                compare_booleans(op, left.to_boolean(), right.to_boolean())
            }
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                compare_numbers(op, scalar_number(left), scalar_number(right))
            }
            (Value::String(l), Value::String(r)) => compare_strings(op, l, r),
            _ => false,
        }
    } else {
        compare_numbers(op, scalar_number(left), scalar_number(right))
    }
}

fn scalar_number(value: &Value) -> f64 {
    match value {
        Value::Boolean(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Double(n) => *n,
        Value::String(s) => string_to_number(s),
        Value::Sequence(_) => f64::NAN,
    }
}

fn compare_booleans(op: RelationOp, left: bool, right: bool) -> bool {
    match op {
        RelationOp::Eq => left == right,
        RelationOp::Ne => left != right,
        _ => compare_numbers(op, left as u8 as f64, right as u8 as f64),
    }
}

fn compare_numbers(op: RelationOp, left: f64, right: f64) -> bool {
    match op {
        RelationOp::Eq => left == right,
        RelationOp::Ne => left != right,
        RelationOp::Lt => left < right,
        RelationOp::Le => left <= right,
        RelationOp::Gt => left > right,
        RelationOp::Ge => left >= right,
    }
}

fn compare_strings(op: RelationOp, left: &str, right: &str) -> bool {
    match op {
        RelationOp::Eq => left == right,
        RelationOp::Ne => left != right,
        _ => compare_numbers(op, string_to_number(left), string_to_number(right)),
    }
}

/// XPath `number()` applied to a string: optional whitespace, optional minus, digits with an
/// optional fraction. Anything else is NaN.
pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\r' | '\n'));
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let mut seen_digit = false;
    let mut seen_dot = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return f64::NAN,
        }
    }
    if !seen_digit {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// XPath `string()` applied to a number.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e17 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Canonical hash key for a number literal; folds -0 into 0.
pub fn number_key(n: f64) -> u64 {
    if n == 0.0 {
        0f64.to_bits()
    } else {
        n.to_bits()
    }
}
