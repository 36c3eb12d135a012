//! # Stage: Engine Facade
//!
//! ## Responsibility
//! Wire the allocator, conversion recorder, statistics engine, lifecycle
//! manager and retention over one injected [`ExperimentStore`], and expose the
//! operations a host service calls. There is no global connection: every
//! component receives the same `Arc` at construction.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::allocator::Allocator;
use crate::config::EngineConfig;
use crate::conversions::ConversionRecorder;
use crate::error::Result;
use crate::lifecycle::{CreatedTest, TestManager};
use crate::model::{Conversion, NewTest, PageId, Test, TestId, TestStatus, Variant, VariantId};
use crate::retention::{self, CleanupReport};
use crate::stats::{StatisticsEngine, TestResults};
use crate::store::{ExperimentStore, SqliteStore};

pub struct ExperimentEngine {
    store: Arc<dyn ExperimentStore>,
    config: EngineConfig,
    allocator: Allocator,
    recorder: ConversionRecorder,
    statistics: StatisticsEngine,
    lifecycle: TestManager,
}

impl ExperimentEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, config: EngineConfig) -> Self {
        Self {
            allocator: Allocator::new(Arc::clone(&store)),
            recorder: ConversionRecorder::new(Arc::clone(&store), config.conversions.clone()),
            statistics: StatisticsEngine::new(Arc::clone(&store), config.statistics.clone()),
            lifecycle: TestManager::new(Arc::clone(&store), config.statistics.clone()),
            store,
            config,
        }
    }

    /// Validate `config` and open the SQLite database it names.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::from_config(&config.storage)?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.store
    }

    /// Rebalance, delete and lookups live on the manager directly.
    pub fn lifecycle(&self) -> &TestManager {
        &self.lifecycle
    }

    pub fn allocate(&self, test_id: TestId, visitor_id: &str) -> Result<Option<Variant>> {
        self.allocator.allocate(test_id, visitor_id)
    }

    pub fn record_conversion(
        &self,
        test_id: TestId,
        variant_id: VariantId,
        visitor_id: &str,
        conversion_type: &str,
        value: Option<f64>,
    ) -> Result<Conversion> {
        self.recorder
            .record_conversion(test_id, variant_id, visitor_id, conversion_type, value)
    }

    pub fn get_results(&self, test_id: TestId) -> Result<TestResults> {
        self.statistics.get_results(test_id)
    }

    pub fn create_test(&self, page_id: PageId, config: &NewTest) -> Result<CreatedTest> {
        self.lifecycle.create_test(page_id, config)
    }

    pub fn update_status(&self, test_id: TestId, status: TestStatus) -> Result<Test> {
        self.lifecycle.update_status(test_id, status)
    }

    pub fn get_active_tests_for_page(&self, page_id: PageId) -> Result<Vec<Test>> {
        self.lifecycle.get_active_tests_for_page(page_id)
    }

    /// Delete allocations and conversions older than `days_to_keep` days.
    pub fn cleanup(&self, days_to_keep: u32) -> Result<CleanupReport> {
        retention::cleanup(self.store.as_ref(), days_to_keep, self.config.retention.batch_size)
    }

    /// Start the periodic retention task on the current tokio runtime.
    pub fn spawn_retention(&self) -> JoinHandle<()> {
        retention::spawn_periodic(Arc::clone(&self.store), self.config.retention.clone())
    }
}
