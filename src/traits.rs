//! Collaborator contracts consumed by the extraction engine.
//!
//! The engine never talks to the network, the object store or the columnar
//! encoder directly; it goes through these traits so every collaborator can
//! be swapped for a scripted double in tests.

use crate::harvest::domain::Domain;
use crate::model::{Batch, FieldMap, Record};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Transport-level tag attached to a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The request did not complete within the transport timeout.
    Timeout,
    /// The peer reset or refused the connection.
    ConnectionReset,
    /// HTTP-level failure (non-2xx status, broken framing).
    Protocol,
    /// The remote application raised an error and reported it in-band.
    Fault,
    /// Login was rejected.
    Authentication,
    /// The response could not be decoded.
    Decode,
    Other,
}

/// Failure raised by a [`Connection`] call.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Fault, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }
}

/// Authenticated session against the remote ERP.
///
/// Implementations must be `Send + Sync` so a handle can be shared behind
/// `Arc<dyn Connection>`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Field metadata for `entity`, keyed by field name.
    async fn list_fields(&self, entity: &str) -> Result<FieldMap, RemoteError>;

    /// One page of records matching `domain`, sorted by `order` (the ERP's
    /// `"field asc, id asc"` form) when given.
    async fn search_read(
        &self,
        entity: &str,
        domain: &Domain,
        fields: &[String],
        order: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Batch, RemoteError>;

    /// Re-authenticates and returns a fresh handle.
    ///
    /// The receiver is left untouched; callers replace the handle they hold.
    async fn reconnect(&self) -> Result<Arc<dyn Connection>, RemoteError>;
}

/// Errors raised while persisting a chunk.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to encode chunk: {0}")]
    Encode(String),
    #[error("Failed to upload chunk: {0}")]
    Upload(String),
}

/// Durable destination for normalized batches.
///
/// A sink may receive an overlapping batch again after a crash-recovery
/// re-run and must be durable before `write` returns.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Persists one chunk and returns its location identifier.
    async fn write(
        &self,
        batch: &[Record],
        entity: &str,
        run_timestamp: &str,
        chunk: usize,
    ) -> Result<String, SinkError>;
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for Arc<T> {
    async fn write(
        &self,
        batch: &[Record],
        entity: &str,
        run_timestamp: &str,
        chunk: usize,
    ) -> Result<String, SinkError> {
        (**self).write(batch, entity, run_timestamp, chunk).await
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Entity registry unreachable: {0}")]
    Unreachable(String),
    #[error("Entity registry is malformed: {0}")]
    Malformed(String),
}

/// Ordered list of extractable entity names.
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    /// Every registered entity, in registry order. A registry that was never
    /// written is empty, not an error.
    async fn load(&self) -> Result<Vec<String>, RegistryError>;

    /// Replaces the registry contents. Returns the stored entity count.
    async fn save(&self, entities: &[String]) -> Result<usize, RegistryError>;

    /// Registered entities whose name starts with `prefix`. An empty prefix
    /// selects everything.
    async fn list_entities(&self, prefix: Option<&str>) -> Result<Vec<String>, RegistryError> {
        let entities = self.load().await?;
        Ok(match prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => entities
                .into_iter()
                .filter(|entity| entity.starts_with(prefix))
                .collect(),
            None => entities,
        })
    }
}
