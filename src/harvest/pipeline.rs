//! Incremental extraction engine.
//!
//! This module provides the [`ExtractionEngine`] coordinator that walks a
//! list of entities one at a time and, for each one:
//! 1. **Determining strategy**: reads field metadata, decides between
//!    cursor-tracked and full refresh, builds the filter predicate
//! 2. **Fetching / writing**: pages through the remote, normalizes each
//!    batch, hands it to the sink, and tracks the running maximum watermark
//! 3. **Advancing cursor**: persists the watermark once, after every chunk
//!    of the entity has been written
//!
//! One entity's failure never aborts the others; it is captured in that
//! entity's [`ExtractionResult`].
//!
//! # Ordering
//!
//! The watermark only ever covers records the sink has acknowledged. A
//! crash between the last write and the cursor save makes the next run
//! re-fetch an overlapping range (duplicates), never skip one (loss).
//!
//! Cursor-tracked entities are paged in `(cursor field, id)` order, the same
//! order the resume predicate uses, so a run capped by a record limit has
//! read a prefix of the pending records and its watermark is safe to save.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::harvest::classify::summarize;
use crate::harvest::cursor_store::{CursorStore, CursorStoreError};
use crate::harvest::domain::Domain;
use crate::harvest::fetcher::{FetchError, FetchRequest, PageFetcher, RetryPolicy};
use crate::harvest::normalize::normalize;
use crate::harvest::watermark::{self, Watermark};
use crate::model::{
    ExtractionResult, ExtractionStatus, FieldMap, RunMode, RunSummary, DEFAULT_CURSOR_FIELD,
};
use crate::traits::{Connection, RemoteError, Sink, SinkError};

// ============================================================================
// Engine Types
// ============================================================================

/// Engine tuning shared by every entity of a run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Records requested per page
    pub page_size: usize,

    /// Field whose maximum value is tracked as the watermark
    pub cursor_field: String,

    /// Per-page retry policy
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 5000,
            cursor_field: DEFAULT_CURSOR_FIELD.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Caller-supplied parameters of one run.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub mode: RunMode,

    /// Restricts the requested fields. `None` requests every field.
    pub fields: Option<Vec<String>>,

    /// Caps the records fetched per entity.
    pub limit: Option<usize>,
}

impl ExtractionRequest {
    pub fn incremental() -> Self {
        Self {
            mode: RunMode::Incremental,
            fields: None,
            limit: None,
        }
    }

    pub fn full() -> Self {
        Self {
            mode: RunMode::Full,
            fields: None,
            limit: None,
        }
    }
}

/// Where an entity's extraction currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPhase {
    DeterminingStrategy,
    Fetching,
    Writing,
    AdvancingCursor,
    Done,
    Skipped,
    Failed,
}

impl fmt::Display for EntityPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DeterminingStrategy => "determining-strategy",
            Self::Fetching => "fetching",
            Self::Writing => "writing",
            Self::AdvancingCursor => "advancing-cursor",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        })
    }
}

/// How an entity is read in this run.
#[derive(Debug, Clone, PartialEq)]
enum Strategy {
    /// No predicate and no cursor bookkeeping.
    FullRefresh,
    /// Cursor-tracked; `domain` resumes after the stored watermark.
    Incremental { cursor_field: String, domain: Domain },
}

/// Work done so far for one entity.
#[derive(Debug, Default)]
struct Progress {
    records: usize,
    locations: Vec<String>,
    watermark: Option<Watermark>,
}

// ============================================================================
// Engine Errors
// ============================================================================

/// Failures that end one entity's extraction.
#[derive(Error, Debug)]
pub enum EntityError {
    /// Field metadata could not be read
    #[error("Failed to read field metadata: {reason}")]
    Metadata {
        reason: String,
        #[source]
        source: RemoteError,
    },

    /// The fetcher gave up on the entity
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A chunk could not be persisted
    #[error("Chunk {chunk} write failed: {source}")]
    Sink {
        chunk: usize,
        #[source]
        source: SinkError,
    },

    /// Every chunk was written but the watermark could not be saved. The
    /// next run re-extracts the same range.
    #[error("Cursor not advanced after {chunks} written chunk(s), next run will re-extract them: {source}")]
    CursorSave {
        chunks: usize,
        #[source]
        source: CursorStoreError,
    },
}

impl EntityError {
    fn status(&self) -> ExtractionStatus {
        match self {
            Self::Fetch(_) => ExtractionStatus::Skipped,
            Self::Metadata { .. } | Self::Sink { .. } | Self::CursorSave { .. } => {
                ExtractionStatus::Error
            }
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Sequential multi-entity extraction with durable watermarks.
///
/// The engine owns its connection handle for the lifetime of a run and
/// replaces it whenever the fetcher reconnects.
///
/// # Example
///
/// ```ignore
/// use erp_harvester::harvest::pipeline::{EngineConfig, ExtractionEngine, ExtractionRequest};
///
/// let mut engine = ExtractionEngine::new(connection, sink, cursors, EngineConfig::default());
/// let summary = engine
///     .run(&["res.partner".to_string()], &ExtractionRequest::incremental())
///     .await;
/// println!("{} records", summary.total_records);
/// ```
pub struct ExtractionEngine<K>
where
    K: Sink,
{
    connection: Arc<dyn Connection>,
    sink: K,
    cursors: CursorStore,
    config: EngineConfig,
}

impl<K> ExtractionEngine<K>
where
    K: Sink,
{
    pub fn new(
        connection: Arc<dyn Connection>,
        sink: K,
        cursors: CursorStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            connection,
            sink,
            cursors,
            config,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Hands back the connection, which reconnects may have replaced.
    pub fn into_connection(self) -> Arc<dyn Connection> {
        self.connection
    }

    /// Extracts every entity in order and aggregates the outcomes.
    pub async fn run(&mut self, entities: &[String], request: &ExtractionRequest) -> RunSummary {
        info!(entities = entities.len(), mode = ?request.mode, "Extraction run started");

        let mut summary = RunSummary::with_capacity(entities.len());
        for entity in entities {
            let result = self.extract_entity(entity, request).await;
            summary.record(result);
        }

        info!(
            successful = summary.successful,
            empty = summary.empty,
            skipped = summary.skipped,
            failed = summary.failed,
            records = summary.total_records,
            "Extraction run finished"
        );
        summary
    }

    /// Extracts one entity. Never fails: errors land in the result.
    #[instrument(skip(self, request), fields(mode = ?request.mode))]
    pub async fn extract_entity(
        &mut self,
        entity: &str,
        request: &ExtractionRequest,
    ) -> ExtractionResult {
        let mut progress = Progress::default();
        let mut phase = EntityPhase::DeterminingStrategy;

        match self.try_extract(entity, request, &mut progress, &mut phase).await {
            Ok(()) if progress.locations.is_empty() => {
                warn!(entity, phase = %EntityPhase::Skipped, "No records found");
                ExtractionResult::empty(entity)
            }
            Ok(()) => {
                info!(
                    entity,
                    phase = %EntityPhase::Done,
                    records = progress.records,
                    chunks = progress.locations.len(),
                    "Entity extracted"
                );
                ExtractionResult::success(entity, progress.records, progress.locations)
            }
            Err(err) => {
                match &err {
                    EntityError::Fetch(e) => warn!(
                        entity,
                        phase = %EntityPhase::Failed,
                        failed_while = %phase,
                        category = %e.category,
                        "Entity skipped: {}",
                        e
                    ),
                    other => error!(
                        entity,
                        phase = %EntityPhase::Failed,
                        failed_while = %phase,
                        "Entity failed: {}",
                        other
                    ),
                }
                let mut result = ExtractionResult::failed(
                    entity,
                    progress.records,
                    progress.locations,
                    err.to_string(),
                );
                result.status = err.status();
                result
            }
        }
    }

    async fn try_extract(
        &mut self,
        entity: &str,
        request: &ExtractionRequest,
        progress: &mut Progress,
        phase: &mut EntityPhase,
    ) -> Result<(), EntityError> {
        let metadata = self
            .connection
            .list_fields(entity)
            .await
            .map_err(|source| EntityError::Metadata {
                reason: summarize(entity, &source),
                source,
            })?;

        let strategy = self.strategy(entity, request.mode, &metadata).await;
        let fields = requested_fields(request.fields.as_deref(), &metadata, &strategy);
        let order = fetch_order(&strategy);
        let (domain, cursor_field) = match &strategy {
            Strategy::FullRefresh => (Domain::All, None),
            Strategy::Incremental {
                cursor_field,
                domain,
            } => (domain.clone(), Some(cursor_field.as_str())),
        };

        let mut fetcher = PageFetcher::new(
            Arc::clone(&self.connection),
            FetchRequest {
                entity: entity.to_string(),
                domain,
                fields,
                order: Some(order),
                page_size: self.config.page_size,
                max_records: request.limit,
            },
            self.config.retry,
        );
        let run_timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        let drained = self
            .drain(entity, &mut fetcher, &metadata, cursor_field, &run_timestamp, progress, phase)
            .await;
        self.connection = fetcher.into_connection();
        drained?;

        if progress.locations.is_empty() {
            return Ok(());
        }

        if let (Some(cursor_field), Some(wm)) = (cursor_field, progress.watermark.as_ref()) {
            *phase = EntityPhase::AdvancingCursor;
            self.cursors
                .save(entity, cursor_field, &wm.value, wm.id)
                .await
                .map_err(|source| EntityError::CursorSave {
                    chunks: progress.locations.len(),
                    source,
                })?;
        }

        *phase = EntityPhase::Done;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drain(
        &self,
        entity: &str,
        fetcher: &mut PageFetcher,
        metadata: &FieldMap,
        cursor_field: Option<&str>,
        run_timestamp: &str,
        progress: &mut Progress,
        phase: &mut EntityPhase,
    ) -> Result<(), EntityError> {
        loop {
            *phase = EntityPhase::Fetching;
            let Some(batch) = fetcher.next_batch().await? else {
                return Ok(());
            };

            let candidate = cursor_field.and_then(|f| watermark::batch_candidate(&batch, f));
            let count = batch.len();
            let normalized = normalize(batch, metadata);

            *phase = EntityPhase::Writing;
            let chunk = progress.locations.len() + 1;
            let location = self
                .sink
                .write(&normalized, entity, run_timestamp, chunk)
                .await
                .map_err(|source| EntityError::Sink { chunk, source })?;

            info!(entity, chunk, records = count, location = %location, "Chunk written");
            progress.records += count;
            progress.locations.push(location);
            progress.watermark = watermark::merge_opt(progress.watermark.take(), candidate);
        }
    }

    async fn strategy(&self, entity: &str, mode: RunMode, metadata: &FieldMap) -> Strategy {
        if mode == RunMode::Full {
            info!(entity, "Full refresh");
            return Strategy::FullRefresh;
        }

        let cursor_field = self.config.cursor_field.as_str();
        if !metadata.contains_key(cursor_field) {
            info!(entity, cursor_field, "No cursor field, running full refresh");
            return Strategy::FullRefresh;
        }

        let domain = match self.cursors.load(entity).await {
            Some(cursor) => {
                info!(
                    entity,
                    last_value = %cursor.last_value,
                    last_id = ?cursor.last_id,
                    "Incremental from stored cursor"
                );
                Domain::after_watermark(cursor_field, &cursor.last_value, cursor.last_id)
            }
            None => {
                info!(entity, "Incremental without stored cursor, reading full history");
                Domain::All
            }
        };

        Strategy::Incremental {
            cursor_field: cursor_field.to_string(),
            domain,
        }
    }
}

/// Field list sent to the remote: the caller's selection (or every field,
/// sorted), always including `id` and, when tracked, the cursor field.
fn requested_fields(
    selected: Option<&[String]>,
    metadata: &FieldMap,
    strategy: &Strategy,
) -> Vec<String> {
    let mut fields: Vec<String> = match selected {
        Some(selected) if !selected.is_empty() => selected.to_vec(),
        _ => {
            let mut all: Vec<String> = metadata.keys().cloned().collect();
            all.sort();
            all
        }
    };

    let mut ensure = |name: &str| {
        if !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
    };
    if let Strategy::Incremental { cursor_field, .. } = strategy {
        ensure(cursor_field);
    }
    ensure("id");
    fields
}

/// Sort order for paging. Ties on the cursor field are broken by id, matching
/// [`Domain::after_watermark`].
fn fetch_order(strategy: &Strategy) -> String {
    match strategy {
        Strategy::FullRefresh => "id asc".to_string(),
        Strategy::Incremental { cursor_field, .. } => format!("{cursor_field} asc, id asc"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnection, MemorySink};
    use crate::model::{FieldMeta, Record};
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;
    use serde_json::json;

    fn partner(id: i64, write_date: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), json!(id));
        r.insert("name".into(), json!(format!("Partner {id}")));
        r.insert("write_date".into(), json!(write_date));
        r
    }

    fn fields(with_cursor: bool) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("id".into(), FieldMeta::default());
        f.insert("name".into(), FieldMeta::default());
        if with_cursor {
            f.insert("write_date".into(), FieldMeta::default());
        }
        f
    }

    fn engine(conn: &MemoryConnection, cursors: CursorStore) -> ExtractionEngine<MemorySink> {
        ExtractionEngine::new(
            Arc::new(conn.clone()),
            MemorySink::new(),
            cursors,
            EngineConfig {
                page_size: 2,
                retry: RetryPolicy::immediate(3),
                ..EngineConfig::default()
            },
        )
    }

    fn cursors() -> CursorStore {
        CursorStore::new(Arc::new(InMemory::new()), "lake")
    }

    #[tokio::test]
    async fn test_first_run_writes_chunks_and_saves_cursor() {
        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            fields(true),
            vec![
                partner(1, "2024-01-01 10:00:00"),
                partner(2, "2024-01-03 10:00:00"),
                partner(3, "2024-01-03 10:00:00"),
            ],
        );
        let store = cursors();
        let mut engine = engine(&conn, store.clone());

        let result = engine
            .extract_entity("res.partner", &ExtractionRequest::incremental())
            .await;

        assert_eq!(result.status, ExtractionStatus::Success);
        assert_eq!(result.records_count, 3);
        assert_eq!(result.output_locations.len(), 2);
        let cursor = store.load("res.partner").await.unwrap();
        assert_eq!(cursor.last_value, "2024-01-03 10:00:00");
        assert_eq!(cursor.last_id, Some(3));
    }

    #[tokio::test]
    async fn test_resumes_after_stored_watermark() {
        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            fields(true),
            vec![
                partner(1, "2024-01-01 10:00:00"),
                partner(2, "2024-01-02 10:00:00"),
                partner(3, "2024-01-02 10:00:00"),
                partner(4, "2024-01-03 10:00:00"),
            ],
        );
        let store = cursors();
        store
            .save("res.partner", "write_date", "2024-01-02 10:00:00", Some(2))
            .await
            .unwrap();
        let mut engine = engine(&conn, store.clone());

        let result = engine
            .extract_entity("res.partner", &ExtractionRequest::incremental())
            .await;

        assert_eq!(result.records_count, 2);
        let ids: Vec<_> = engine
            .sink()
            .records_for("res.partner")
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(3), json!(4)]);
        assert_eq!(store.load("res.partner").await.unwrap().last_id, Some(4));
    }

    #[tokio::test]
    async fn test_entity_without_cursor_field_is_full_refresh() {
        let conn = MemoryConnection::new().with_entity(
            "res.country",
            fields(false),
            vec![Record::from_iter([("id".to_string(), json!(1))])],
        );
        let store = cursors();
        let mut engine = engine(&conn, store.clone());

        let result = engine
            .extract_entity("res.country", &ExtractionRequest::incremental())
            .await;

        assert_eq!(result.status, ExtractionStatus::Success);
        assert!(store.load("res.country").await.is_none());
    }

    #[tokio::test]
    async fn test_full_mode_ignores_and_keeps_cursor() {
        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            fields(true),
            vec![partner(1, "2024-01-01 10:00:00"), partner(2, "2024-02-01 10:00:00")],
        );
        let store = cursors();
        store
            .save("res.partner", "write_date", "2024-01-15 00:00:00", Some(9))
            .await
            .unwrap();
        let mut engine = engine(&conn, store.clone());

        let result = engine
            .extract_entity("res.partner", &ExtractionRequest::full())
            .await;

        assert_eq!(result.records_count, 2);
        let cursor = store.load("res.partner").await.unwrap();
        assert_eq!(cursor.last_value, "2024-01-15 00:00:00");
    }

    #[tokio::test]
    async fn test_empty_entity_never_writes_cursor() {
        let conn = MemoryConnection::new().with_entity("res.partner", fields(true), vec![]);
        let store = cursors();
        let mut engine = engine(&conn, store.clone());

        let result = engine
            .extract_entity("res.partner", &ExtractionRequest::incremental())
            .await;

        assert_eq!(result.status, ExtractionStatus::Empty);
        assert!(result.error.is_none());
        assert!(store.load("res.partner").await.is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_cursor_behind() {
        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            fields(true),
            vec![
                partner(1, "2024-01-01 10:00:00"),
                partner(2, "2024-01-02 10:00:00"),
                partner(3, "2024-01-03 10:00:00"),
            ],
        );
        let store = cursors();
        let mut engine = engine(&conn, store.clone());
        engine.sink().fail_on_chunk(2);

        let result = engine
            .extract_entity("res.partner", &ExtractionRequest::incremental())
            .await;

        assert_eq!(result.status, ExtractionStatus::Error);
        assert_eq!(result.records_count, 2);
        assert_eq!(result.output_locations.len(), 1);
        assert!(result.error.unwrap().contains("Chunk 2"));
        assert!(store.load("res.partner").await.is_none());
    }

    #[tokio::test]
    async fn test_schema_failure_is_skipped_and_run_continues() {
        let conn = MemoryConnection::new()
            .with_entity("bad.entity", fields(true), vec![partner(1, "2024-01-01 10:00:00")])
            .with_entity("res.partner", fields(true), vec![partner(1, "2024-01-01 10:00:00")]);
        conn.push_fault(RemoteError::fault("ValueError: Invalid field 'x' on model 'bad.entity'"));
        let mut engine = engine(&conn, cursors());

        let summary = engine
            .run(
                &["bad.entity".to_string(), "res.partner".to_string()],
                &ExtractionRequest::incremental(),
            )
            .await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.total_records, 1);
        assert_eq!(summary.results[0].status, ExtractionStatus::Skipped);
    }

    #[tokio::test]
    async fn test_unknown_entity_metadata_is_an_error() {
        let conn = MemoryConnection::new();
        let mut engine = engine(&conn, cursors());

        let result = engine
            .extract_entity("nope", &ExtractionRequest::incremental())
            .await;

        assert_eq!(result.status, ExtractionStatus::Error);
        assert!(result.error.unwrap().contains("field metadata"));
    }

    #[tokio::test]
    async fn test_capped_run_never_skips_older_records() {
        // Stored newest first, so an unordered read would see id 2 first.
        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            fields(true),
            vec![partner(2, "2024-01-03 00:00:00"), partner(1, "2024-01-01 00:00:00")],
        );
        let store = cursors();
        let mut engine = engine(&conn, store.clone());
        let capped = ExtractionRequest {
            limit: Some(1),
            ..ExtractionRequest::incremental()
        };

        let first = engine.extract_entity("res.partner", &capped).await;
        assert_eq!(first.records_count, 1);
        let cursor = store.load("res.partner").await.unwrap();
        assert_eq!(cursor.last_value, "2024-01-01 00:00:00");
        assert_eq!(cursor.last_id, Some(1));

        let second = engine
            .extract_entity("res.partner", &ExtractionRequest::incremental())
            .await;
        assert_eq!(second.records_count, 1);

        let ids: Vec<_> = engine
            .sink()
            .records_for("res.partner")
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(1), json!(2)]);
        assert_eq!(store.load("res.partner").await.unwrap().last_id, Some(2));
    }

    #[tokio::test]
    async fn test_cursor_save_failure_keeps_written_chunks() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the cursor directory should be makes every
        // cursor put fail while the data sink keeps working.
        std::fs::create_dir_all(dir.path().join("lake")).unwrap();
        std::fs::write(dir.path().join("lake").join("cursors"), b"").unwrap();
        let local = LocalFileSystem::new_with_prefix(dir.path()).unwrap();
        let store = CursorStore::new(Arc::new(local), "lake");

        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            fields(true),
            vec![
                partner(1, "2024-01-01 10:00:00"),
                partner(2, "2024-01-02 10:00:00"),
                partner(3, "2024-01-03 10:00:00"),
            ],
        );
        let mut engine = engine(&conn, store.clone());

        let result = engine
            .extract_entity("res.partner", &ExtractionRequest::incremental())
            .await;

        assert_eq!(result.status, ExtractionStatus::Error);
        assert_eq!(result.records_count, 3);
        assert_eq!(result.output_locations.len(), 2);
        assert_eq!(engine.sink().chunks().len(), 2);
        let error = result.error.unwrap();
        assert!(
            error.starts_with("Cursor not advanced after 2 written chunk(s)"),
            "{error}"
        );
        assert!(store.load("res.partner").await.is_none());
    }

    #[test]
    fn test_fetch_order_matches_resume_predicate() {
        let strategy = Strategy::Incremental {
            cursor_field: "write_date".into(),
            domain: Domain::All,
        };
        assert_eq!(fetch_order(&strategy), "write_date asc, id asc");
        assert_eq!(fetch_order(&Strategy::FullRefresh), "id asc");
    }

    #[test]
    fn test_requested_fields_always_carry_id_and_cursor() {
        let strategy = Strategy::Incremental {
            cursor_field: "write_date".into(),
            domain: Domain::All,
        };
        let selected = vec!["name".to_string()];
        let f = requested_fields(Some(&selected), &fields(true), &strategy);
        assert_eq!(f, vec!["name", "write_date", "id"]);

        let f = requested_fields(None, &fields(true), &Strategy::FullRefresh);
        assert_eq!(f, vec!["id", "name", "write_date"]);
    }
}
