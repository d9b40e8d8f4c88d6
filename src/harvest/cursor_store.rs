//! Durable per-entity watermarks.
//!
//! Cursors are stored as small JSON objects, one per entity, under
//! `{base}/cursors/{entity}.json` in the same object store as the data.
//! Reads never fail: a missing, malformed or unreachable cursor means
//! "start from full history". Writes do fail loudly.

use crate::model::Cursor;
use chrono::Utc;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CursorStoreError {
    #[error("Failed to encode cursor for {entity}: {source}")]
    Encode {
        entity: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to persist cursor for {entity}: {source}")]
    Persist {
        entity: String,
        #[source]
        source: object_store::Error,
    },
}

/// Object-store key fragment for an entity name.
pub fn sanitize_entity(entity: &str) -> String {
    entity.replace('.', "_")
}

#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl CursorStore {
    /// Cursor store rooted at `{base_path}/cursors`.
    pub fn new(store: Arc<dyn ObjectStore>, base_path: &str) -> Self {
        let base = base_path.trim_matches('/');
        let prefix = if base.is_empty() {
            "cursors".to_string()
        } else {
            format!("{base}/cursors")
        };
        Self { store, prefix }
    }

    fn key(&self, entity: &str) -> Path {
        Path::from(format!("{}/{}.json", self.prefix, sanitize_entity(entity)))
    }

    /// Stored cursor for `entity`, if a usable one exists.
    pub async fn load(&self, entity: &str) -> Option<Cursor> {
        let key = self.key(entity);
        let bytes = match self.store.get(&key).await {
            Ok(object) => match object.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(entity, "Failed to read cursor: {}", e);
                    return None;
                }
            },
            Err(object_store::Error::NotFound { .. }) => return None,
            Err(e) => {
                warn!(entity, "Failed to load cursor: {}", e);
                return None;
            }
        };

        match serde_json::from_slice::<Cursor>(&bytes) {
            Ok(cursor) if !cursor.last_value.is_empty() => Some(cursor),
            Ok(_) => None,
            Err(e) => {
                warn!(entity, "Ignoring malformed cursor: {}", e);
                None
            }
        }
    }

    /// Overwrites the cursor for `entity`, stamping `updated_at` now.
    pub async fn save(
        &self,
        entity: &str,
        cursor_field: &str,
        last_value: &str,
        last_id: Option<i64>,
    ) -> Result<Cursor, CursorStoreError> {
        let cursor = Cursor {
            cursor_field: cursor_field.to_string(),
            last_value: last_value.to_string(),
            last_id,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec(&cursor).map_err(|source| CursorStoreError::Encode {
            entity: entity.to_string(),
            source,
        })?;

        self.store
            .put(&self.key(entity), PutPayload::from(body))
            .await
            .map_err(|source| CursorStoreError::Persist {
                entity: entity.to_string(),
                source,
            })?;

        info!(
            entity,
            cursor_field,
            last_value,
            last_id = ?last_id,
            "Cursor advanced"
        );
        Ok(cursor)
    }
}
