use crate::harvest::cursor_store::CursorStore;
use crate::harvest::domain::Domain;
use crate::harvest::fetcher::{FetchError, FetchRequest, PageFetcher};
use crate::harvest::pipeline::{EngineConfig, ExtractionEngine, ExtractionRequest};
use crate::model::{RunMode, RunSummary};
use crate::traits::{Connection, EntityRegistry, RegistryError, Sink};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

/// Entity listing every model the ERP knows about.
const MODEL_CATALOG: &str = "ir.model";

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Entity registry is empty, refresh it with update-models first")]
    EmptyRegistry,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to read the model catalog: {0}")]
    Catalog(#[from] FetchError),

    #[error("Executor is shutting down: {0}")]
    Closed(String),
}

/// Caller-supplied narrowing of a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only entities whose name starts with this prefix.
    pub prefix: Option<String>,
    pub fields: Option<Vec<String>>,
    pub limit: Option<usize>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The registry has entities but none matched the prefix.
    NothingToRun,
    Completed(RunSummary),
}

/// Runs extractions one at a time against a shared connection.
///
/// Runs are serialized by a single-permit semaphore: the cursor store is
/// last-writer-wins, so two runs over the same entity must never overlap.
pub struct HarvesterExecutor {
    semaphore: Arc<Semaphore>,
    connection: Mutex<Arc<dyn Connection>>,
    sink: Arc<dyn Sink>,
    cursors: CursorStore,
    registry: Arc<dyn EntityRegistry>,
    config: EngineConfig,
}

impl HarvesterExecutor {
    pub fn new(
        connection: Arc<dyn Connection>,
        sink: Arc<dyn Sink>,
        cursors: CursorStore,
        registry: Arc<dyn EntityRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            connection: Mutex::new(connection),
            sink,
            cursors,
            registry,
            config,
        }
    }

    fn current_connection(&self) -> Arc<dyn Connection> {
        let guard = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn replace_connection(&self, connection: Arc<dyn Connection>) {
        *self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = connection;
    }

    /// Registered entities, filtered by prefix. An empty registry is an error;
    /// a prefix that matches nothing is not.
    pub async fn select_entities(&self, prefix: Option<&str>) -> Result<Vec<String>, ExecutorError> {
        let selected = self.registry.list_entities(prefix).await?;
        if selected.is_empty() && self.registry.load().await?.is_empty() {
            return Err(ExecutorError::EmptyRegistry);
        }

        match prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => info!(prefix, count = selected.len(), "Entities selected by prefix"),
            None => info!(count = selected.len(), "Processing every registered entity"),
        }
        Ok(selected)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ExecutorError> {
        Ok(self.registry.load().await?)
    }

    #[instrument(skip(self, options), fields(prefix = ?options.prefix))]
    pub async fn run(&self, mode: RunMode, options: RunOptions) -> Result<RunOutcome, ExecutorError> {
        let entities = self.select_entities(options.prefix.as_deref()).await?;
        if entities.is_empty() {
            warn!("No entity to process");
            return Ok(RunOutcome::NothingToRun);
        }

        let request = ExtractionRequest {
            mode,
            fields: options.fields,
            limit: options.limit,
        };
        Ok(RunOutcome::Completed(self.extract(&entities, &request).await?))
    }

    pub async fn run_incremental(&self, options: RunOptions) -> Result<RunOutcome, ExecutorError> {
        self.run(RunMode::Incremental, options).await
    }

    pub async fn run_full(&self, options: RunOptions) -> Result<RunOutcome, ExecutorError> {
        self.run(RunMode::Full, options).await
    }

    /// Batch job: full refresh of every registered entity, all fields, no cap.
    #[instrument(skip(self))]
    pub async fn full_extract(&self) -> Result<RunSummary, ExecutorError> {
        let entities = self.select_entities(None).await?;
        self.extract(&entities, &ExtractionRequest::full()).await
    }

    async fn extract(
        &self,
        entities: &[String],
        request: &ExtractionRequest,
    ) -> Result<RunSummary, ExecutorError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ExecutorError::Closed(e.to_string()))?;

        let mut engine = ExtractionEngine::new(
            self.current_connection(),
            Arc::clone(&self.sink),
            self.cursors.clone(),
            self.config.clone(),
        );
        let summary = engine.run(entities, request).await;
        self.replace_connection(engine.into_connection());
        Ok(summary)
    }

    /// Re-reads the ERP's model catalog and replaces the registry.
    #[instrument(skip(self))]
    pub async fn update_models(&self) -> Result<usize, ExecutorError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ExecutorError::Closed(e.to_string()))?;

        let mut fetcher = PageFetcher::new(
            self.current_connection(),
            FetchRequest {
                entity: MODEL_CATALOG.to_string(),
                domain: Domain::All,
                fields: vec!["model".to_string()],
                order: Some("id asc".to_string()),
                page_size: self.config.page_size,
                max_records: None,
            },
            self.config.retry,
        );

        let mut models = Vec::new();
        let drained = loop {
            match fetcher.next_batch().await {
                Ok(Some(batch)) => models.extend(batch.into_iter().filter_map(|record| {
                    match record.get("model") {
                        Some(Value::String(name)) if !name.trim().is_empty() => {
                            Some(name.trim().to_string())
                        }
                        _ => None,
                    }
                })),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.replace_connection(fetcher.into_connection());
        drained?;

        let count = self.registry.save(&models).await?;
        info!(count, "Entity registry refreshed");
        Ok(count)
    }
}
