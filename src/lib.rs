//! A/B testing engine for landing pages: deterministic sticky variant
//! allocation, conversion recording, two-proportion significance testing and
//! test lifecycle management over a SQLite store.

pub mod allocator;
pub mod cli;
pub mod config;
pub mod conversions;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod retention;
pub mod stats;
pub mod store;

pub use config::EngineConfig;
pub use engine::ExperimentEngine;
pub use error::{EngineError, Result};
pub use lifecycle::CreatedTest;
pub use model::{
    Allocation, Conversion, Goal, NewTest, NewVariant, PageId, Test, TestId, TestStatus, Variant,
    VariantId,
};
pub use retention::CleanupReport;
pub use stats::{ResultStatus, TestResults, VariantResult};
pub use store::{ExperimentStore, InMemoryStore, SqliteStore};
