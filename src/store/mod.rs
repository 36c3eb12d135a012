//! # Stage: Persistence Seam
//!
//! ## Responsibility
//! The narrow storage interface the engine consumes. Two backends implement it:
//!
//! - [`sqlite::SqliteStore`]: durable, rusqlite-backed, safe across
//!   connections and processes
//! - [`memory::InMemoryStore`]: same semantics in process memory
//!
//! ## Guarantees
//! - `create_test` persists the test and all its variants, or nothing
//! - At most one allocation exists per (test, visitor). A losing concurrent
//!   writer gets [`AllocationWrite::Conflict`], never an error
//! - `variants` returns rows in creation order
//!
//! ## NOT Responsible For
//! - Traffic-split validation before insert (lifecycle's concern; the store
//!   re-checks only inside `set_traffic`)
//! - Choosing variants or computing statistics

pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::model::{
    Allocation, Conversion, Goal, NewConversion, NewVariant, PageId, Test, TestId, TestStatus,
    Variant, VariantId,
};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Outcome of an allocation insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationWrite {
    Inserted,
    /// Another writer already holds the (test, visitor) slot.
    Conflict,
}

/// Resolved row data for a new test and its variants.
#[derive(Debug, Clone)]
pub struct TestInsert<'a> {
    pub page_id: PageId,
    pub name: &'a str,
    pub confidence_level: f64,
    pub min_sample_size: u32,
    pub goals: &'a [Goal],
    pub variants: &'a [NewVariant],
    pub created_at_ms: u64,
}

/// Raw per-variant counts used by the statistics engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantTally {
    pub variant_id: VariantId,
    /// Distinct allocated visitors.
    pub visitors: u64,
    /// Distinct visitors allocated to this variant with at least one
    /// conversion on it. Never exceeds `visitors`.
    pub converted_visitors: u64,
    /// Every conversion event, repeats included.
    pub conversion_events: u64,
    pub total_value: f64,
}

/// Rows removed by one allocation purge batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgedAllocations {
    pub allocations: usize,
    /// Conversions of the purged visitors, whatever their age.
    pub conversions: usize,
}

/// Storage backend for tests, variants, allocations and conversions.
pub trait ExperimentStore: Send + Sync {
    fn create_test(&self, insert: &TestInsert<'_>) -> Result<(Test, Vec<Variant>)>;
    fn get_test(&self, id: TestId) -> Result<Option<Test>>;
    /// Tests on a page, optionally filtered by status, in creation order.
    fn tests_for_page(&self, page_id: PageId, status: Option<TestStatus>) -> Result<Vec<Test>>;
    /// Set the status. Moving to `running` stamps `started_at` the first time;
    /// moving to `completed` stamps `ended_at`. `None` if the test is unknown.
    fn update_status(&self, id: TestId, status: TestStatus, now_ms: u64) -> Result<Option<Test>>;
    /// Remove a test with its variants, allocations and conversions.
    fn delete_test(&self, id: TestId) -> Result<bool>;

    fn variants(&self, test_id: TestId) -> Result<Vec<Variant>>;
    fn get_variant(&self, id: VariantId) -> Result<Option<Variant>>;
    /// Atomically replace traffic percentages. Fails without changes if a
    /// variant is not part of the test or the resulting split is not 100.
    fn set_traffic(&self, test_id: TestId, split: &[(VariantId, u8)]) -> Result<()>;

    fn find_allocation(&self, test_id: TestId, visitor_id: &str) -> Result<Option<Allocation>>;
    fn insert_allocation(&self, allocation: &Allocation) -> Result<AllocationWrite>;

    fn insert_conversion(&self, conversion: &NewConversion) -> Result<Conversion>;

    /// One tally per variant of the test, in creation order.
    fn tallies(&self, test_id: TestId) -> Result<Vec<VariantTally>>;

    /// Delete up to `limit` conversions older than `cutoff_ms`.
    fn delete_conversions_before(&self, cutoff_ms: u64, limit: usize) -> Result<usize>;
    /// Delete up to `limit` allocations older than `cutoff_ms`, together with
    /// every conversion the purged visitors recorded on those tests.
    fn delete_allocations_before(&self, cutoff_ms: u64, limit: usize) -> Result<PurgedAllocations>;
}
