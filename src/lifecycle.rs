//! # Stage: Test Lifecycle Manager
//!
//! ## Responsibility
//! Create tests together with their variants, move tests between statuses,
//! rebalance traffic, and remove tests explicitly.
//!
//! ## Guarantees
//! - `create_test` validates the whole payload (split sums to 100, at most one
//!   control, goals well-formed) before anything is written, and the store
//!   writes test and variants in one transaction
//! - `rebalance` never touches existing allocations
//!
//! ## NOT Responsible For
//! - Enforcing an order of status transitions (callers decide draft → running)
//! - Preventing two running tests on one page; this is logged, not rejected

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::StatisticsConfig;
use crate::error::{EngineError, Result};
use crate::model::{now_ms, NewTest, PageId, Test, TestId, TestStatus, Variant, VariantId};
use crate::store::{ExperimentStore, TestInsert};

/// A freshly created test and its variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedTest {
    pub test: Test,
    pub variants: Vec<Variant>,
}

pub struct TestManager {
    store: Arc<dyn ExperimentStore>,
    defaults: StatisticsConfig,
}

impl TestManager {
    pub fn new(store: Arc<dyn ExperimentStore>, defaults: StatisticsConfig) -> Self {
        Self { store, defaults }
    }

    /// Create a test in `draft` status with all its variants, or nothing.
    pub fn create_test(&self, page_id: PageId, config: &NewTest) -> Result<CreatedTest> {
        config.validate()?;
        let insert = TestInsert {
            page_id,
            name: config.name.trim(),
            confidence_level: config.confidence_level.unwrap_or(self.defaults.confidence_level),
            min_sample_size: config.min_sample_size.unwrap_or(self.defaults.min_visitors),
            goals: &config.goals,
            variants: &config.variants,
            created_at_ms: now_ms(),
        };
        let (test, variants) = self.store.create_test(&insert)?;
        info!(
            test_id = test.id,
            page_id,
            name = %test.name,
            variants = variants.len(),
            "test created"
        );
        Ok(CreatedTest { test, variants })
    }

    pub fn update_status(&self, test_id: TestId, status: TestStatus) -> Result<Test> {
        if status == TestStatus::Running {
            self.warn_on_overlap(test_id)?;
        }
        let test = self
            .store
            .update_status(test_id, status, now_ms())?
            .ok_or(EngineError::TestNotFound(test_id))?;
        info!(test_id, status = %status, "test status changed");
        Ok(test)
    }

    fn warn_on_overlap(&self, test_id: TestId) -> Result<()> {
        let Some(test) = self.store.get_test(test_id)? else {
            return Ok(());
        };
        let others: Vec<TestId> = self
            .store
            .tests_for_page(test.page_id, Some(TestStatus::Running))?
            .into_iter()
            .map(|t| t.id)
            .filter(|&id| id != test_id)
            .collect();
        if !others.is_empty() {
            warn!(
                test_id,
                page_id = test.page_id,
                running = ?others,
                "another test is already running on this page"
            );
        }
        Ok(())
    }

    /// Running tests on a page.
    pub fn get_active_tests_for_page(&self, page_id: PageId) -> Result<Vec<Test>> {
        self.store.tests_for_page(page_id, Some(TestStatus::Running))
    }

    /// Every test on a page regardless of status.
    pub fn tests_for_page(&self, page_id: PageId) -> Result<Vec<Test>> {
        self.store.tests_for_page(page_id, None)
    }

    pub fn get_test(&self, test_id: TestId) -> Result<Test> {
        self.store.get_test(test_id)?.ok_or(EngineError::TestNotFound(test_id))
    }

    pub fn variants(&self, test_id: TestId) -> Result<Vec<Variant>> {
        self.get_test(test_id)?;
        self.store.variants(test_id)
    }

    /// Replace traffic percentages. The resulting split must sum to 100.
    pub fn rebalance(&self, test_id: TestId, split: &[(VariantId, u8)]) -> Result<Vec<Variant>> {
        self.get_test(test_id)?;
        if let Some(&(_, pct)) = split.iter().find(|(_, pct)| *pct > 100) {
            return Err(EngineError::InvalidConfig(format!(
                "traffic percentage must be in 0..=100, got {}",
                pct
            )));
        }
        self.store.set_traffic(test_id, split)?;
        info!(test_id, variants = split.len(), "traffic rebalanced");
        self.store.variants(test_id)
    }

    /// Delete a test and everything recorded against it.
    pub fn delete_test(&self, test_id: TestId) -> Result<()> {
        if !self.store.delete_test(test_id)? {
            return Err(EngineError::TestNotFound(test_id));
        }
        info!(test_id, "test deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Goal, NewVariant};
    use crate::store::{InMemoryStore, SqliteStore};

    fn manager() -> TestManager {
        TestManager::new(Arc::new(SqliteStore::open_in_memory().unwrap()), StatisticsConfig::default())
    }

    fn hero(a: u8, b: u8) -> NewTest {
        NewTest::new("hero")
            .with_variant(NewVariant::control("control", "tpl/hero-a", a))
            .with_variant(NewVariant::new("bold", "tpl/hero-b", b))
            .with_goal(Goal::FormSubmit { form_id: Some("lead".into()) })
    }

    #[test]
    fn test_create_applies_defaults() {
        let m = manager();
        let created = m.create_test(10, &hero(50, 50)).unwrap();
        assert_eq!(created.test.status, TestStatus::Draft);
        assert_eq!(created.test.confidence_level, 95.0);
        assert_eq!(created.test.min_sample_size, 30);
        assert_eq!(created.variants.len(), 2);
        assert_eq!(m.variants(created.test.id).unwrap(), created.variants);
    }

    #[test]
    fn test_create_keeps_explicit_targets() {
        let m = manager();
        let cfg = hero(50, 50).with_confidence_level(99.0).with_min_sample_size(500);
        let created = m.create_test(10, &cfg).unwrap();
        assert_eq!(created.test.confidence_level, 99.0);
        assert_eq!(created.test.min_sample_size, 500);
    }

    #[test]
    fn test_create_bad_split_persists_nothing() {
        let m = manager();
        for (a, b) in [(50, 49), (50, 51)] {
            let err = m.create_test(10, &hero(a, b)).unwrap_err();
            assert!(matches!(err, EngineError::InvalidTrafficSplit { .. }));
        }
        assert!(m.tests_for_page(10).unwrap().is_empty());
    }

    #[test]
    fn test_status_transitions() {
        let m = manager();
        let id = m.create_test(10, &hero(50, 50)).unwrap().test.id;
        assert!(m.get_active_tests_for_page(10).unwrap().is_empty());

        let running = m.update_status(id, TestStatus::Running).unwrap();
        assert!(running.started_at_ms.is_some());
        assert_eq!(m.get_active_tests_for_page(10).unwrap().len(), 1);

        m.update_status(id, TestStatus::Paused).unwrap();
        assert!(m.get_active_tests_for_page(10).unwrap().is_empty());

        let done = m.update_status(id, TestStatus::Completed).unwrap();
        assert!(done.ended_at_ms.is_some());
    }

    #[test]
    fn test_transitions_are_not_constrained() {
        let m = manager();
        let id = m.create_test(10, &hero(50, 50)).unwrap().test.id;
        m.update_status(id, TestStatus::Completed).unwrap();
        assert_eq!(m.update_status(id, TestStatus::Draft).unwrap().status, TestStatus::Draft);
    }

    #[test]
    fn test_overlapping_running_tests_allowed() {
        let m = manager();
        let a = m.create_test(10, &hero(50, 50)).unwrap().test.id;
        let b = m.create_test(10, &hero(30, 70)).unwrap().test.id;
        m.update_status(a, TestStatus::Running).unwrap();
        m.update_status(b, TestStatus::Running).unwrap();
        assert_eq!(m.get_active_tests_for_page(10).unwrap().len(), 2);
    }

    #[test]
    fn test_update_unknown_test_is_not_found() {
        let err = manager().update_status(77, TestStatus::Running).unwrap_err();
        assert!(matches!(err, EngineError::TestNotFound(77)));
    }

    #[test]
    fn test_rebalance() {
        let m = manager();
        let created = m.create_test(10, &hero(50, 50)).unwrap();
        let ids: Vec<VariantId> = created.variants.iter().map(|v| v.id).collect();
        let updated = m.rebalance(created.test.id, &[(ids[0], 10), (ids[1], 90)]).unwrap();
        assert_eq!(updated.iter().map(|v| v.traffic_percentage).collect::<Vec<_>>(), vec![10, 90]);

        assert!(m.rebalance(created.test.id, &[(ids[0], 11)]).is_err());
        assert!(m.rebalance(created.test.id, &[(ids[0], 200)]).is_err());
        assert!(m.rebalance(404, &[(ids[0], 100)]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete() {
        let m = TestManager::new(Arc::new(InMemoryStore::new()), StatisticsConfig::default());
        let id = m.create_test(10, &hero(50, 50)).unwrap().test.id;
        m.delete_test(id).unwrap();
        assert!(m.get_test(id).unwrap_err().is_not_found());
        assert!(m.delete_test(id).unwrap_err().is_not_found());
    }
}
