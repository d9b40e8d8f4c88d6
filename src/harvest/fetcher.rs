//! Offset/limit pagination over the remote search call.
//!
//! [`PageFetcher`] is a single-pass, pull-based sequence of non-empty
//! batches. Each page gets its own bounded retry loop; every transient failure
//! sleeps with linear backoff and swaps in a freshly authenticated
//! connection, so the handle left behind is never the one that just failed. The sequence cannot be resumed after
//! a failure: start a new fetcher from offset 0 instead.

use crate::harvest::classify::{classify, summarize, ErrorClass};
use crate::harvest::domain::Domain;
use crate::model::Batch;
use crate::traits::Connection;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Per-page retry bound and linear backoff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, backing off 5s, 10s, then 15s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_step: Duration::ZERO,
        }
    }

    /// Sleep after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// Why a fetch gave up on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Structural failure; retrying the same request cannot succeed.
    Schema,
    /// Every attempt failed transiently; a later run may succeed.
    Temporary,
    /// No classification rule matched.
    Unexpected,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Schema => "schema",
            Self::Temporary => "temporary",
            Self::Unexpected => "unexpected",
        })
    }
}

/// Entity-fatal fetch failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct FetchError {
    pub entity: String,
    pub category: FailureCategory,
    pub reason: String,
}

/// What to fetch and how to page through it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub entity: String,
    pub domain: Domain,
    pub fields: Vec<String>,
    /// Sort order sent with every page. Offset paging is only stable, and a
    /// capped fetch only a prefix of the source, when this is set.
    pub order: Option<String>,
    pub page_size: usize,
    pub max_records: Option<usize>,
}

pub struct PageFetcher {
    connection: Arc<dyn Connection>,
    request: FetchRequest,
    policy: RetryPolicy,
    offset: usize,
    fetched: usize,
    finished: bool,
}

impl PageFetcher {
    pub fn new(connection: Arc<dyn Connection>, request: FetchRequest, policy: RetryPolicy) -> Self {
        Self {
            connection,
            request,
            policy,
            offset: 0,
            fetched: 0,
            finished: false,
        }
    }

    /// Records yielded so far.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Hands back the connection, which may have been replaced by a reconnect.
    pub fn into_connection(self) -> Arc<dyn Connection> {
        self.connection
    }

    /// Next non-empty batch, or `None` once the source is exhausted or the
    /// record cap is reached.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>, FetchError> {
        if self.finished {
            return Ok(None);
        }

        let limit = match self.request.max_records {
            Some(max) => {
                let remaining = max.saturating_sub(self.fetched);
                if remaining == 0 {
                    self.finished = true;
                    return Ok(None);
                }
                remaining.min(self.request.page_size)
            }
            None => self.request.page_size,
        };

        let batch = match self.fetch_page(limit).await {
            Ok(batch) => batch,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        if batch.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        self.fetched += batch.len();
        self.offset += batch.len();
        info!(
            entity = %self.request.entity,
            records = batch.len(),
            total = self.fetched,
            "Page loaded"
        );

        if self
            .request
            .max_records
            .is_some_and(|max| self.fetched >= max)
        {
            self.finished = true;
        }

        Ok(Some(batch))
    }

    async fn fetch_page(&mut self, limit: usize) -> Result<Batch, FetchError> {
        let entity = self.request.entity.clone();
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            debug!(entity = %entity, offset = self.offset, limit, attempt, "search_read");
            let result = self
                .connection
                .search_read(
                    &entity,
                    &self.request.domain,
                    &self.request.fields,
                    self.request.order.as_deref(),
                    limit,
                    self.offset,
                )
                .await;

            let err = match result {
                Ok(batch) => return Ok(batch),
                Err(err) => err,
            };
            let reason = summarize(&entity, &err);

            match classify(&err) {
                ErrorClass::Schema => {
                    warn!(entity = %entity, category = "schema", "Entity skipped: {}", reason);
                    return Err(self.failure(FailureCategory::Schema, reason));
                }
                ErrorClass::Unexpected => {
                    error!(
                        entity = %entity,
                        category = "unexpected",
                        raw = %err,
                        "Unclassified remote error, add a rule if this recurs: {}",
                        reason
                    );
                    return Err(self.failure(FailureCategory::Unexpected, reason));
                }
                ErrorClass::Transient => {
                    warn!(
                        entity = %entity,
                        attempt,
                        max_attempts,
                        "Transient failure: {}",
                        reason
                    );
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    match self.connection.reconnect().await {
                        Ok(fresh) => self.connection = fresh,
                        Err(e) => warn!(entity = %entity, "Reconnect failed: {}", e),
                    }
                }
            }
        }

        let reason = format!("Failed after {max_attempts} attempts (consecutive transient errors).");
        error!(entity = %entity, category = "temporary", "{}", reason);
        Err(self.failure(FailureCategory::Temporary, reason))
    }

    fn failure(&self, category: FailureCategory, reason: String) -> FetchError {
        FetchError {
            entity: self.request.entity.clone(),
            category,
            reason,
        }
    }
}
