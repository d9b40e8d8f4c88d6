//! Object-storage backed collaborators: the Parquet chunk sink and the CSV
//! entity registry. Both work against any [`ObjectStore`]; production wires
//! in Google Cloud Storage, tests use `InMemory`.

use crate::harvest::cursor_store::sanitize_entity;
use crate::model::Record;
use crate::traits::{EntityRegistry, RegistryError, Sink, SinkError};
use arrow::json::reader::{infer_json_schema_from_iterator, ReaderBuilder};
use async_trait::async_trait;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload, RetryConfig};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REGISTRY_FILE: &str = "models_list.csv";

/// Google Cloud Storage client for `bucket`, with credentials taken from the
/// environment (`GOOGLE_APPLICATION_CREDENTIALS` or the metadata server).
pub fn gcs_store(bucket: &str) -> Result<Arc<dyn ObjectStore>, object_store::Error> {
    let store = GoogleCloudStorageBuilder::from_env()
        .with_bucket_name(bucket)
        .with_retry(RetryConfig {
            max_retries: 3,
            retry_timeout: Duration::from_secs(30),
            ..Default::default()
        })
        .build()?;
    Ok(Arc::new(store))
}

fn join_base(base_path: &str, rest: &str) -> String {
    let base = base_path.trim_matches('/');
    if base.is_empty() {
        rest.to_string()
    } else {
        format!("{base}/{rest}")
    }
}

// ============================================================================
// Parquet sink
// ============================================================================

/// Writes each normalized batch as one Parquet object under
/// `{base}/{entity}/{run_timestamp}_part{NNNN}.parquet`.
#[derive(Clone)]
pub struct ParquetSink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    base_path: String,
}

impl ParquetSink {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, base_path: &str) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            base_path: base_path.trim_matches('/').to_string(),
        }
    }

    fn object_path(&self, entity: &str, run_timestamp: &str, chunk: usize) -> Path {
        Path::from(join_base(
            &self.base_path,
            &format!(
                "{}/{}_part{:04}.parquet",
                sanitize_entity(entity),
                run_timestamp,
                chunk
            ),
        ))
    }

    fn location(&self, path: &Path) -> String {
        format!("gs://{}/{}", self.bucket, path)
    }
}

/// Encodes records as a single-row-group Parquet file. The schema is
/// inferred from the batch itself.
pub fn encode_parquet(batch: &[Record]) -> Result<Vec<u8>, SinkError> {
    let encode = |e: &dyn std::fmt::Display| SinkError::Encode(e.to_string());

    let schema = infer_json_schema_from_iterator(
        batch
            .iter()
            .map(|record| Ok::<_, arrow::error::ArrowError>(Value::Object(record.clone()))),
    )
    .map_err(|e| encode(&e))?;
    let schema = Arc::new(schema);

    let mut decoder = ReaderBuilder::new(Arc::clone(&schema))
        .with_batch_size(batch.len().max(1))
        .with_coerce_primitive(true)
        .build_decoder()
        .map_err(|e| encode(&e))?;
    decoder.serialize(batch).map_err(|e| encode(&e))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, Arc::clone(&schema), Some(props)).map_err(|e| encode(&e))?;
    if let Some(record_batch) = decoder.flush().map_err(|e| encode(&e))? {
        writer.write(&record_batch).map_err(|e| encode(&e))?;
    }
    writer.close().map_err(|e| encode(&e))?;
    Ok(buf)
}

#[async_trait]
impl Sink for ParquetSink {
    async fn write(
        &self,
        batch: &[Record],
        entity: &str,
        run_timestamp: &str,
        chunk: usize,
    ) -> Result<String, SinkError> {
        let body = encode_parquet(batch)?;
        let path = self.object_path(entity, run_timestamp, chunk);
        let size = body.len();

        self.store
            .put(&path, PutPayload::from(body))
            .await
            .map_err(|e| SinkError::Upload(format!("{path}: {e}")))?;

        let location = self.location(&path);
        info!(entity, chunk, bytes = size, location = %location, "Parquet chunk uploaded");
        Ok(location)
    }
}

// ============================================================================
// Entity registry
// ============================================================================

/// Entity list stored as a one-column CSV at `{base}/models_list.csv`.
#[derive(Clone)]
pub struct ObjectStoreRegistry {
    store: Arc<dyn ObjectStore>,
    path: Path,
}

impl ObjectStoreRegistry {
    pub fn new(store: Arc<dyn ObjectStore>, base_path: &str) -> Self {
        Self {
            store,
            path: Path::from(join_base(base_path, REGISTRY_FILE)),
        }
    }
}

fn parse_registry(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let first = line.split(',').next()?.trim().trim_matches('"').trim();
            (!first.is_empty()).then(|| first.to_string())
        })
        .collect()
}

#[async_trait]
impl EntityRegistry for ObjectStoreRegistry {
    async fn load(&self) -> Result<Vec<String>, RegistryError> {
        let bytes = match self.store.get(&self.path).await {
            Ok(object) => object
                .bytes()
                .await
                .map_err(|e| RegistryError::Unreachable(e.to_string()))?,
            Err(object_store::Error::NotFound { .. }) => {
                warn!(path = %self.path, "Entity registry does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(RegistryError::Unreachable(e.to_string())),
        };

        let text =
            std::str::from_utf8(&bytes).map_err(|e| RegistryError::Malformed(e.to_string()))?;
        let entities = parse_registry(text);
        info!(count = entities.len(), "Entity registry loaded");
        Ok(entities)
    }

    async fn save(&self, entities: &[String]) -> Result<usize, RegistryError> {
        let mut unique: Vec<&str> = entities
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect();
        unique.sort_unstable();
        unique.dedup();

        let mut body = unique.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }

        self.store
            .put(&self.path, PutPayload::from(body.into_bytes()))
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        info!(count = unique.len(), path = %self.path, "Entity registry saved");
        Ok(unique.len())
    }
}
