//! Filter predicates sent to the remote search call.
//!
//! A [`Domain`] is a boolean expression tree over field comparisons. On the
//! wire it is encoded in the ERP's prefix notation, e.g.
//! `["|", ["write_date", ">", v], "&", ["write_date", "=", v], ["id", ">", 7]]`.

use crate::model::Record;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

/// Boolean filter expression. [`Domain::All`] matches every record.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    All,
    Leaf(Condition),
    And(Box<Domain>, Box<Domain>),
    Or(Box<Domain>, Box<Domain>),
}

impl Domain {
    pub fn compare(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self::Leaf(Condition {
            field: field.into(),
            op,
            value: value.into(),
        })
    }

    pub fn and(self, other: Domain) -> Self {
        match (self, other) {
            (Self::All, d) | (d, Self::All) => d,
            (a, b) => Self::And(Box::new(a), Box::new(b)),
        }
    }

    pub fn or(self, other: Domain) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (a, b) => Self::Or(Box::new(a), Box::new(b)),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Predicate resuming after the watermark `(last_value, last_id)`:
    /// `field > v OR (field = v AND id > last_id)`.
    ///
    /// Without a tie-break id only `field > v` is emitted; an empty
    /// `last_value` yields [`Domain::All`].
    pub fn after_watermark(field: &str, last_value: &str, last_id: Option<i64>) -> Self {
        if last_value.is_empty() {
            return Self::All;
        }
        let newer = Self::compare(field, Operator::Gt, last_value);
        match last_id {
            None => newer,
            Some(id) => newer.or(
                Self::compare(field, Operator::Eq, last_value)
                    .and(Self::compare("id", Operator::Gt, id)),
            ),
        }
    }

    /// Prefix-notation encoding understood by the remote search call.
    pub fn to_wire(&self) -> Vec<Value> {
        let mut out = Vec::new();
        self.push_wire(&mut out);
        out
    }

    fn push_wire(&self, out: &mut Vec<Value>) {
        match self {
            Self::All => {}
            Self::Leaf(c) => out.push(json!([c.field, c.op.as_str(), c.value])),
            Self::And(a, b) => {
                out.push(Value::from("&"));
                a.push_wire(out);
                b.push_wire(out);
            }
            Self::Or(a, b) => {
                out.push(Value::from("|"));
                a.push_wire(out);
                b.push_wire(out);
            }
        }
    }

    /// Evaluates the predicate locally. A comparison against a missing or
    /// incomparable value is false.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::Leaf(c) => record
                .get(&c.field)
                .and_then(|v| compare_values(v, &c.value))
                .is_some_and(|ord| c.op.holds(ord)),
            Self::And(a, b) => a.matches(record) && b.matches(record),
            Self::Or(a, b) => a.matches(record) || b.matches(record),
        }
    }
}

impl Serialize for Domain {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(s)
    }
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
