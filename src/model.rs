use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One remote record: a flat mapping from field name to value, in source order.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// One page of records returned by a paginated fetch.
pub type Batch = Vec<Record>;

/// Field metadata for one entity, keyed by field name.
pub type FieldMap = HashMap<String, FieldMeta>;

/// Field descriptor as reported by the remote `fields_get` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    #[serde(default, rename = "string")]
    pub label: Option<String>,
    #[serde(default, rename = "type", with = "field_type_opt")]
    pub field_type: Option<FieldType>,
}

impl FieldMeta {
    pub fn typed(field_type: FieldType) -> Self {
        Self {
            label: None,
            field_type: Some(field_type),
        }
    }
}

/// Declared field type, used by the normalizer's schema-aware mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Many2one,
    One2many,
    Many2many,
    Integer,
    Float,
    Monetary,
    Boolean,
    Date,
    Datetime,
    Char,
    Text,
    Html,
    Selection,
    Binary,
    #[serde(other)]
    Other,
}

impl FieldType {
    /// Parses the remote type tag. Unknown tags map to [`FieldType::Other`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "many2one" => Self::Many2one,
            "one2many" => Self::One2many,
            "many2many" => Self::Many2many,
            "integer" => Self::Integer,
            "float" => Self::Float,
            "monetary" => Self::Monetary,
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            "datetime" => Self::Datetime,
            "char" => Self::Char,
            "text" => Self::Text,
            "html" => Self::Html,
            "selection" => Self::Selection,
            "binary" => Self::Binary,
            _ => Self::Other,
        }
    }
}

// The remote reports arbitrary type tags; unknown ones must not fail decoding.
mod field_type_opt {
    use super::FieldType;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<FieldType>, s: S) -> Result<S::Ok, S::Error> {
        value.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<FieldType>, D::Error> {
        let tag: Option<String> = Option::deserialize(d)?;
        Ok(tag.as_deref().map(FieldType::from_tag))
    }
}

/// Durable per-entity watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(default = "default_cursor_field")]
    pub cursor_field: String,
    pub last_value: String,
    #[serde(default)]
    pub last_id: Option<i64>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

/// Field used as the watermark when none is configured.
pub const DEFAULT_CURSOR_FIELD: &str = "write_date";

fn default_cursor_field() -> String {
    DEFAULT_CURSOR_FIELD.to_string()
}

/// Refresh mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Incremental,
    Full,
}

/// Outcome of one entity in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    Empty,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entity: String,
    pub status: ExtractionStatus,
    pub records_count: usize,
    pub output_locations: Vec<String>,
    /// Most recently written chunk, if any.
    pub last_location: Option<String>,
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn success(entity: &str, records_count: usize, output_locations: Vec<String>) -> Self {
        Self {
            entity: entity.to_string(),
            status: ExtractionStatus::Success,
            records_count,
            last_location: output_locations.last().cloned(),
            output_locations,
            error: None,
        }
    }

    pub fn empty(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            status: ExtractionStatus::Empty,
            records_count: 0,
            output_locations: Vec::new(),
            last_location: None,
            error: None,
        }
    }

    pub fn failed(
        entity: &str,
        records_count: usize,
        output_locations: Vec<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.to_string(),
            status: ExtractionStatus::Error,
            records_count,
            last_location: output_locations.last().cloned(),
            output_locations,
            error: Some(error.into()),
        }
    }
}

/// Aggregated outcome of a multi-entity run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_entities: usize,
    pub successful: usize,
    pub empty: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_records: usize,
    pub results: Vec<ExtractionResult>,
}

impl RunSummary {
    pub fn with_capacity(total_entities: usize) -> Self {
        Self {
            total_entities,
            results: Vec::with_capacity(total_entities),
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: ExtractionResult) {
        match result.status {
            ExtractionStatus::Success => self.successful += 1,
            ExtractionStatus::Empty => self.empty += 1,
            ExtractionStatus::Skipped => self.skipped += 1,
            ExtractionStatus::Error => self.failed += 1,
        }
        self.total_records += result.records_count;
        self.results.push(result);
    }
}
