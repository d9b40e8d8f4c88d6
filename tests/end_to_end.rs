use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use serde_json::json;

use erp_harvester::harvest::{CursorStore, EngineConfig, ExtractionEngine, ExtractionRequest, RetryPolicy};
use erp_harvester::memory::MemoryConnection;
use erp_harvester::storage::ParquetSink;
use erp_harvester::{ExtractionStatus, FieldMap, FieldMeta, FieldType, Record};

const ENTITY: &str = "res.partner";

fn write_date(id: i64) -> String {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    // Three records share each timestamp so the id tie-break matters.
    (base + Duration::minutes(id / 3))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn partner(id: i64) -> Record {
    let mut r = Record::new();
    r.insert("id".into(), json!(id));
    r.insert("name".into(), json!(format!("Partner {id}")));
    r.insert(
        "parent_id".into(),
        if id % 2 == 0 { json!([1, "Root"]) } else { json!(false) },
    );
    r.insert("write_date".into(), json!(write_date(id)));
    r
}

fn partner_fields() -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("id".into(), FieldMeta::typed(FieldType::Integer));
    fields.insert("name".into(), FieldMeta::typed(FieldType::Char));
    fields.insert("parent_id".into(), FieldMeta::typed(FieldType::Many2one));
    fields.insert("write_date".into(), FieldMeta::typed(FieldType::Datetime));
    fields
}

struct Harness {
    store: Arc<InMemory>,
    conn: MemoryConnection,
    cursors: CursorStore,
}

impl Harness {
    fn new(records: usize) -> Self {
        let store = Arc::new(InMemory::new());
        let conn = MemoryConnection::new().with_entity(
            ENTITY,
            partner_fields(),
            (1..=records as i64).map(partner).collect(),
        );
        let cursors = CursorStore::new(store.clone(), "data-lake/odoo");
        Self { store, conn, cursors }
    }

    fn engine(&self) -> ExtractionEngine<ParquetSink> {
        ExtractionEngine::new(
            Arc::new(self.conn.clone()),
            ParquetSink::new(self.store.clone(), "lake", "data-lake/odoo"),
            self.cursors.clone(),
            EngineConfig {
                page_size: 2000,
                retry: RetryPolicy::immediate(3),
                ..EngineConfig::default()
            },
        )
    }
}

#[tokio::test]
async fn test_first_incremental_run_lands_every_record_and_saves_cursor() {
    let h = Harness::new(2500);
    let mut engine = h.engine();

    let summary = engine
        .run(&[ENTITY.to_string()], &ExtractionRequest::incremental())
        .await;

    assert_eq!(summary.total_entities, 1);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.total_records, 2500);

    let result = &summary.results[0];
    assert_eq!(result.status, ExtractionStatus::Success);
    assert_eq!(result.output_locations.len(), 2);
    assert!(result.output_locations[0].starts_with("gs://lake/data-lake/odoo/res_partner/"));
    assert!(result.output_locations[0].ends_with("_part0001.parquet"));
    assert!(result.output_locations[1].ends_with("_part0002.parquet"));
    assert_eq!(result.last_location.as_ref(), result.output_locations.last());

    for location in &result.output_locations {
        let key = location.trim_start_matches("gs://lake/");
        assert!(h.store.head(&Path::from(key)).await.is_ok(), "{key} missing");
    }

    let cursor = h.cursors.load(ENTITY).await.expect("cursor saved");
    assert_eq!(cursor.cursor_field, "write_date");
    assert_eq!(cursor.last_value, write_date(2500));
    assert_eq!(cursor.last_id, Some(2500));
}

#[tokio::test]
async fn test_rerun_without_changes_is_empty_and_keeps_cursor() {
    let h = Harness::new(2500);
    h.engine()
        .run(&[ENTITY.to_string()], &ExtractionRequest::incremental())
        .await;
    let before = h.cursors.load(ENTITY).await.unwrap();

    let summary = h
        .engine()
        .run(&[ENTITY.to_string()], &ExtractionRequest::incremental())
        .await;

    assert_eq!(summary.empty, 1);
    assert_eq!(summary.total_records, 0);
    assert_eq!(summary.results[0].status, ExtractionStatus::Empty);
    assert_eq!(h.cursors.load(ENTITY).await.unwrap(), before);
}

#[tokio::test]
async fn test_resumes_with_only_new_and_tied_records() {
    let h = Harness::new(2500);
    h.engine()
        .run(&[ENTITY.to_string()], &ExtractionRequest::incremental())
        .await;

    // 2501 shares the timestamp of 2499 and 2500 but has a higher id;
    // 2502 and 2503 are strictly later.
    h.conn
        .insert_records(ENTITY, (2501..=2503).map(partner).collect());

    let summary = h
        .engine()
        .run(&[ENTITY.to_string()], &ExtractionRequest::incremental())
        .await;

    assert_eq!(summary.total_records, 3);
    let cursor = h.cursors.load(ENTITY).await.unwrap();
    assert_eq!(cursor.last_id, Some(2503));
    assert_eq!(cursor.last_value, write_date(2503));
}

#[tokio::test]
async fn test_empty_entity_never_creates_a_cursor() {
    let h = Harness::new(0);
    let summary = h
        .engine()
        .run(&[ENTITY.to_string()], &ExtractionRequest::incremental())
        .await;

    assert_eq!(summary.empty, 1);
    assert!(summary.results[0].error.is_none());
    assert!(h.cursors.load(ENTITY).await.is_none());
}
