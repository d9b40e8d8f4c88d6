//! Maximum-watermark tracking across batches.
//!
//! Records are ordered by `(cursor value as timestamp, id)`; a missing id
//! ranks as 0. The raw string of the winning value is what gets persisted,
//! so the next predicate compares against exactly what the remote sent.

use crate::harvest::normalize::parse_datetime;
use crate::model::Record;
use chrono::NaiveDateTime;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub at: NaiveDateTime,
    pub value: String,
    pub id: Option<i64>,
}

impl Watermark {
    fn rank(&self) -> (NaiveDateTime, i64) {
        (self.at, self.id.unwrap_or(0))
    }

    /// Whether `self` sorts strictly after `other`.
    pub fn is_after(&self, other: &Watermark) -> bool {
        self.rank() > other.rank()
    }
}

/// Keeps the greater of `current` and `candidate`; ties keep `current`.
pub fn merge(current: Option<Watermark>, candidate: Watermark) -> Watermark {
    match current {
        Some(current) if !candidate.is_after(&current) => current,
        _ => candidate,
    }
}

/// Folds an optional candidate into a running maximum.
pub fn merge_opt(current: Option<Watermark>, candidate: Option<Watermark>) -> Option<Watermark> {
    match candidate {
        Some(candidate) => Some(merge(current, candidate)),
        None => current,
    }
}

/// Greatest watermark within one batch. Records whose cursor value is
/// missing or unparseable are not candidates.
pub fn batch_candidate(batch: &[Record], cursor_field: &str) -> Option<Watermark> {
    batch
        .iter()
        .filter_map(|record| record_watermark(record, cursor_field))
        .fold(None, |best, wm| Some(merge(best, wm)))
}

fn record_watermark(record: &Record, cursor_field: &str) -> Option<Watermark> {
    let raw = record.get(cursor_field)?.as_str()?;
    let at = parse_datetime(raw)?;
    Some(Watermark {
        at,
        value: raw.to_string(),
        id: record.get("id").and_then(record_id),
    })
}

fn record_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(write_date: Value, id: Value) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), id);
        r.insert("write_date".into(), write_date);
        r
    }

    #[test]
    fn test_greatest_value_wins() {
        let batch = vec![
            record(json!("2024-01-01 10:00:00"), json!(9)),
            record(json!("2024-01-02 10:00:00"), json!(1)),
            record(json!("2024-01-01 23:00:00"), json!(50)),
        ];
        let wm = batch_candidate(&batch, "write_date").unwrap();
        assert_eq!(wm.value, "2024-01-02 10:00:00");
        assert_eq!(wm.id, Some(1));
    }

    #[test]
    fn test_ties_broken_by_id() {
        let batch = vec![
            record(json!("2024-01-01 10:00:00"), json!(3)),
            record(json!("2024-01-01 10:00:00"), json!("12")),
            record(json!("2024-01-01 10:00:00"), json!(7)),
        ];
        let wm = batch_candidate(&batch, "write_date").unwrap();
        assert_eq!(wm.id, Some(12));
    }

    #[test]
    fn test_unparseable_values_are_ignored() {
        let batch = vec![
            record(json!(false), json!(3)),
            record(json!("garbage"), json!(4)),
        ];
        assert!(batch_candidate(&batch, "write_date").is_none());
        assert!(batch_candidate(&[], "write_date").is_none());
    }

    #[test]
    fn test_missing_id_ranks_as_zero() {
        let a = Watermark {
            at: parse_datetime("2024-01-01 10:00:00").unwrap(),
            value: "2024-01-01 10:00:00".into(),
            id: None,
        };
        let b = Watermark { id: Some(1), ..a.clone() };
        assert_eq!(merge(Some(a.clone()), b.clone()), b);
        assert_eq!(merge(Some(b.clone()), a), b);
    }

    fn rows() -> impl Strategy<Value = Vec<(u32, i64)>> {
        prop::collection::vec((0u32..50, 0i64..20), 0..60)
    }

    proptest! {
        #[test]
        fn test_per_batch_maxima_equal_global_maximum(rows in rows(), cuts in prop::collection::vec(0usize..60, 0..5)) {
            let records: Vec<Record> = rows
                .iter()
                .map(|(minute, id)| {
                    record(json!(format!("2024-01-01 10:{:02}:00", minute % 60)), json!(id))
                })
                .collect();

            let global = batch_candidate(&records, "write_date");

            let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c.min(records.len())).collect();
            bounds.push(0);
            bounds.push(records.len());
            bounds.sort_unstable();
            let merged = bounds
                .windows(2)
                .map(|w| batch_candidate(&records[w[0]..w[1]], "write_date"))
                .fold(None, merge_opt);

            prop_assert_eq!(
                global.map(|w| (w.at, w.id)),
                merged.map(|w| (w.at, w.id))
            );
        }

        #[test]
        fn test_merge_order_does_not_matter(rows in rows()) {
            let records: Vec<Record> = rows
                .iter()
                .map(|(minute, id)| record(json!(format!("2024-01-01 10:{:02}:00", minute)), json!(id)))
                .collect();
            let mut reversed = records.clone();
            reversed.reverse();

            let forward = batch_candidate(&records, "write_date").map(|w| (w.at, w.id));
            let backward = batch_candidate(&reversed, "write_date").map(|w| (w.at, w.id));
            prop_assert_eq!(forward, backward);
        }
    }
}
