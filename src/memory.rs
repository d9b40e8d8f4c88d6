//! In-memory collaborators.
//!
//! [`MemoryConnection`] serves records from local tables, honouring the
//! filter predicate, sort order and offset/limit paging, and can be scripted
//! to fail.
//! [`MemorySink`] keeps every written chunk. Both are cheap to clone; clones
//! share state, so a test can keep a handle and inspect what the engine did.

use crate::harvest::domain::{compare_values, Domain};
use crate::model::{Batch, FieldMap, Record};
use crate::traits::{
    Connection, EntityRegistry, RegistryError, RemoteError, Sink, SinkError,
};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Table {
    fields: FieldMap,
    records: Vec<Record>,
}

#[derive(Default)]
struct ConnectionState {
    tables: Mutex<HashMap<String, Table>>,
    faults: Mutex<VecDeque<RemoteError>>,
    search_calls: AtomicUsize,
    reconnects: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct MemoryConnection {
    state: Arc<ConnectionState>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(self, entity: &str, fields: FieldMap, records: Vec<Record>) -> Self {
        lock(&self.state.tables).insert(entity.to_string(), Table { fields, records });
        self
    }

    /// Appends records to an existing entity's table.
    pub fn insert_records(&self, entity: &str, records: Vec<Record>) {
        lock(&self.state.tables)
            .entry(entity.to_string())
            .or_default()
            .records
            .extend(records);
    }

    /// Queues a failure for the next `search_read` call.
    pub fn push_fault(&self, err: RemoteError) {
        lock(&self.state.faults).push_back(err);
    }

    pub fn search_calls(&self) -> usize {
        self.state.search_calls.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.state.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn list_fields(&self, entity: &str) -> Result<FieldMap, RemoteError> {
        lock(&self.state.tables)
            .get(entity)
            .map(|t| t.fields.clone())
            .ok_or_else(|| RemoteError::fault(format!("Unknown model '{entity}'")))
    }

    async fn search_read(
        &self,
        entity: &str,
        domain: &Domain,
        fields: &[String],
        order: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Batch, RemoteError> {
        self.state.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = lock(&self.state.faults).pop_front() {
            return Err(fault);
        }

        let tables = lock(&self.state.tables);
        let table = tables
            .get(entity)
            .ok_or_else(|| RemoteError::fault(format!("Unknown model '{entity}'")))?;

        let mut matching: Vec<&Record> = table
            .records
            .iter()
            .filter(|r| domain.matches(r))
            .collect();
        if let Some(order) = order {
            let keys = sort_keys(order);
            matching.sort_by(|a, b| compare_by_keys(a, b, &keys));
        }

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|r| project(r, fields))
            .collect())
    }

    async fn reconnect(&self) -> Result<Arc<dyn Connection>, RemoteError> {
        self.state.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

/// Parses `"write_date asc, id desc"` into `(field, descending)` pairs.
fn sort_keys(order: &str) -> Vec<(String, bool)> {
    order
        .split(',')
        .filter_map(|term| {
            let mut parts = term.split_whitespace();
            let field = parts.next()?.to_string();
            let descending = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
            Some((field, descending))
        })
        .collect()
}

/// Missing and null values sort last, as in an ascending SQL order.
fn compare_by_keys(a: &Record, b: &Record, keys: &[(String, bool)]) -> CmpOrdering {
    for (field, descending) in keys {
        let present = |r: &Record| r.get(field).filter(|v| !v.is_null()).cloned();
        let ord = match (present(a), present(b)) {
            (Some(x), Some(y)) => compare_values(&x, &y).unwrap_or(CmpOrdering::Equal),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        };
        let ord = if *descending { ord.reverse() } else { ord };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    CmpOrdering::Equal
}

fn project(record: &Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record.clone();
    }
    fields
        .iter()
        .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

/// One chunk captured by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct WrittenChunk {
    pub entity: String,
    pub run_timestamp: String,
    pub chunk: usize,
    pub records: Vec<Record>,
    pub location: String,
}

#[derive(Clone, Default)]
pub struct MemorySink {
    chunks: Arc<Mutex<Vec<WrittenChunk>>>,
    fail_on_chunk: Arc<Mutex<Option<usize>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the write of the given chunk number fail.
    pub fn fail_on_chunk(&self, chunk: usize) {
        *lock(&self.fail_on_chunk) = Some(chunk);
    }

    pub fn chunks(&self) -> Vec<WrittenChunk> {
        lock(&self.chunks).clone()
    }

    pub fn records_for(&self, entity: &str) -> Vec<Record> {
        lock(&self.chunks)
            .iter()
            .filter(|c| c.entity == entity)
            .flat_map(|c| c.records.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(
        &self,
        batch: &[Record],
        entity: &str,
        run_timestamp: &str,
        chunk: usize,
    ) -> Result<String, SinkError> {
        if *lock(&self.fail_on_chunk) == Some(chunk) {
            return Err(SinkError::Upload(format!("chunk {chunk} rejected")));
        }
        let location = format!("memory://{entity}/{run_timestamp}_part{chunk:04}");
        lock(&self.chunks).push(WrittenChunk {
            entity: entity.to_string(),
            run_timestamp: run_timestamp.to_string(),
            chunk,
            records: batch.to_vec(),
            location: location.clone(),
        });
        Ok(location)
    }
}

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    entities: Arc<Mutex<Vec<String>>>,
}

impl MemoryRegistry {
    pub fn new(entities: &[&str]) -> Self {
        Self {
            entities: Arc::new(Mutex::new(
                entities.iter().map(|e| e.to_string()).collect(),
            )),
        }
    }
}

#[async_trait]
impl EntityRegistry for MemoryRegistry {
    async fn load(&self) -> Result<Vec<String>, RegistryError> {
        Ok(lock(&self.entities).clone())
    }

    async fn save(&self, entities: &[String]) -> Result<usize, RegistryError> {
        let mut unique = entities.to_vec();
        unique.sort();
        unique.dedup();
        let count = unique.len();
        *lock(&self.entities) = unique;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::domain::Operator;
    use serde_json::json;

    fn record(id: i64, name: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), json!(id));
        r.insert("name".into(), json!(name));
        r
    }

    #[tokio::test]
    async fn test_search_read_filters_pages_and_projects() {
        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            FieldMap::new(),
            (1..=5).map(|i| record(i, "x")).collect(),
        );
        let domain = Domain::compare("id", Operator::Gt, 1);
        let page = conn
            .search_read("res.partner", &domain, &["id".to_string()], None, 2, 1)
            .await
            .unwrap();

        let ids: Vec<_> = page.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(4)]);
        assert!(page[0].get("name").is_none());
    }

    #[tokio::test]
    async fn test_search_read_sorts_before_paging() {
        let mut late = record(1, "late");
        late.insert("write_date".into(), json!("2024-01-03 00:00:00"));
        let mut early = record(2, "early");
        early.insert("write_date".into(), json!("2024-01-01 00:00:00"));
        let mut tied = record(3, "tied");
        tied.insert("write_date".into(), json!("2024-01-01 00:00:00"));
        let conn = MemoryConnection::new().with_entity(
            "res.partner",
            FieldMap::new(),
            vec![late, tied, early],
        );

        let page = conn
            .search_read("res.partner", &Domain::All, &[], Some("write_date asc, id asc"), 2, 0)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);

        let page = conn
            .search_read("res.partner", &Domain::All, &[], Some("id desc"), 1, 0)
            .await
            .unwrap();
        assert_eq!(page[0]["id"], json!(3));
    }

    #[tokio::test]
    async fn test_unknown_entity_is_a_fault() {
        let conn = MemoryConnection::new();
        let err = conn.list_fields("nope").await.unwrap_err();
        assert!(err.message.contains("Unknown model"));
    }

    #[tokio::test]
    async fn test_sink_failure_injection() {
        let sink = MemorySink::new();
        sink.fail_on_chunk(2);
        assert!(sink.write(&[record(1, "a")], "e", "ts", 1).await.is_ok());
        assert!(sink.write(&[record(2, "b")], "e", "ts", 2).await.is_err());
        assert_eq!(sink.chunks().len(), 1);
    }
}
