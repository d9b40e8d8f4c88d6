//! Coercion of remote values into column-safe representations.
//!
//! The remote mixes types freely: `false` stands in for empty strings and
//! empty relations, relations arrive as `[id, "label"]` pairs, and nested
//! structures appear wherever a field is computed. The columnar writer needs
//! one type per column, so every batch passes through [`normalize`] before
//! it reaches the sink.

use crate::model::{Batch, FieldMap, FieldType, Record};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Normalizes a batch. Fields with a declared type are coerced per type;
/// the rest are flattened and then reconciled so each column carries a
/// single concrete type across the batch.
pub fn normalize(batch: Batch, fields: &FieldMap) -> Batch {
    let declared: HashMap<&str, FieldType> = fields
        .iter()
        .filter_map(|(name, meta)| meta.field_type.map(|t| (name.as_str(), t)))
        .collect();

    let mut records: Batch = batch
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .map(|(key, value)| {
                    let value = match declared.get(key.as_str()) {
                        Some(t) => coerce_declared(*t, value),
                        None => flatten(value),
                    };
                    (key, value)
                })
                .collect()
        })
        .collect();

    reconcile(&mut records, &declared);
    records
}

/// Lists and mappings become their JSON text; scalars pass through.
fn flatten(value: Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other,
    }
}

fn coerce_declared(field_type: FieldType, value: Value) -> Value {
    match field_type {
        FieldType::Many2one => match value {
            Value::Array(items) => items
                .into_iter()
                .next()
                .map(|id| Value::String(scalar_text(&id)))
                .unwrap_or(Value::Null),
            Value::Number(n) => Value::String(n.to_string()),
            _ => Value::Null,
        },
        FieldType::One2many | FieldType::Many2many => match value {
            Value::Array(_) => Value::String(value.to_string()),
            _ => Value::String("[]".to_string()),
        },
        FieldType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from)
                .unwrap_or(Value::Null),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldType::Float | FieldType::Monetary => match value {
            Value::Number(n) => n.as_f64().map(Value::from).unwrap_or(Value::Null),
            Value::String(s) => s.trim().parse::<f64>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldType::Boolean => Value::Bool(match value {
            Value::Bool(b) => b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }),
        FieldType::Date => match value {
            Value::String(s) => parse_date(&s)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldType::Datetime => match value {
            Value::String(s) => parse_datetime(&s)
                .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldType::Char | FieldType::Text | FieldType::Html | FieldType::Selection => match value {
            Value::Bool(false) | Value::Null => Value::Null,
            Value::String(s) => Value::String(s),
            other => Value::String(scalar_text(&flatten(other))),
        },
        FieldType::Binary | FieldType::Other => match value {
            Value::Bool(false) => Value::Null,
            other => flatten(other),
        },
    }
}

/// Parses a remote timestamp: ISO-8601 first, then the fixed fallbacks.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = raw.parse::<NaiveDateTime>() {
        return Some(dt);
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime_only(raw).map(|dt| dt.date()))
}

fn parse_datetime_only(raw: &str) -> Option<NaiveDateTime> {
    raw.parse::<NaiveDateTime>().ok().or_else(|| {
        DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Bool,
    Int,
    Float,
    Str,
    Nested,
}

fn kind_of(value: &Value) -> Option<Kind> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(Kind::Bool),
        Value::Number(n) if n.is_f64() => Some(Kind::Float),
        Value::Number(_) => Some(Kind::Int),
        Value::String(_) => Some(Kind::Str),
        Value::Array(_) | Value::Object(_) => Some(Kind::Nested),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Stringifies every non-null value of an undeclared field that shows more
/// than one concrete type within the batch.
fn reconcile(records: &mut [Record], declared: &HashMap<&str, FieldType>) {
    let mut kinds: HashMap<&str, HashSet<Kind>> = HashMap::new();
    for record in records.iter() {
        for (key, value) in record {
            if declared.contains_key(key.as_str()) {
                continue;
            }
            if let Some(kind) = kind_of(value) {
                kinds.entry(key.as_str()).or_default().insert(kind);
            }
        }
    }

    let mixed: HashSet<String> = kinds
        .into_iter()
        .filter(|(_, k)| k.len() > 1)
        .map(|(field, _)| field.to_string())
        .collect();
    if mixed.is_empty() {
        return;
    }

    for record in records.iter_mut() {
        for (key, value) in record.iter_mut() {
            if mixed.contains(key) && !value.is_null() {
                *value = Value::String(scalar_text(value));
            }
        }
    }
}
