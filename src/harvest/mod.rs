//! Harvest module - incremental extraction of ERP entities.
//!
//! This module provides the building blocks of one extraction run:
//! - **Classification**: remote failures sorted into transient, schema and
//!   unexpected via [`classify::classify`]
//! - **Predicates**: filter expressions and the watermark predicate via [`Domain`]
//! - **Fetching**: retrying offset/limit pagination via [`PageFetcher`]
//! - **Normalization**: column-safe values via [`normalize::normalize`]
//! - **Cursors**: durable per-entity watermarks via [`CursorStore`]
//! - **Pipeline**: the per-entity state machine via [`pipeline::ExtractionEngine`]

pub mod classify;
pub mod cursor_store;
pub mod domain;
pub mod fetcher;
pub mod normalize;
pub mod pipeline;
pub mod watermark;

// Re-export commonly used types
pub use classify::{classify, summarize, ErrorClass};
pub use cursor_store::{CursorStore, CursorStoreError};
pub use domain::{Condition, Domain, Operator};
pub use fetcher::{FailureCategory, FetchError, FetchRequest, PageFetcher, RetryPolicy};
pub use pipeline::{
    EngineConfig, EntityError, EntityPhase, ExtractionEngine, ExtractionRequest,
};
pub use watermark::Watermark;
