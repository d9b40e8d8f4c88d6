pub mod api;
pub mod config;
pub mod executor;
pub mod harvest;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod model;
pub mod odoo;
pub mod storage;
pub mod traits;

// Re-export common types for convenience
pub use executor::*;
pub use model::*;
pub use traits::*;
