//! # Stage: Retention
//!
//! ## Responsibility
//! Delete allocations and conversions older than the retention window, in
//! small batches so concurrent writers are never blocked for long.
//!
//! # Cleanup order
//!
//! 1. Conversions with `converted_at` before the cutoff, batch by batch
//! 2. Allocations with `allocated_at` before the cutoff, batch by batch, each
//!    taking the purged visitor's remaining conversions on that test with it
//!
//! Each batch is its own transaction. Tests and variants are never touched.
//! A visitor whose allocation is purged is re-bucketed on their next request
//! and starts with no conversion history.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::{EngineError, Result};
use crate::model::now_ms;
use crate::store::ExperimentStore;

const DAY_MS: u64 = 86_400_000;

/// Rows removed by one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub conversions_deleted: usize,
    pub allocations_deleted: usize,
}

impl CleanupReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.conversions_deleted + self.allocations_deleted
    }

    #[must_use]
    pub fn any_work_done(&self) -> bool {
        self.total() > 0
    }
}

/// Delete rows older than `days_to_keep` days.
pub fn cleanup(store: &dyn ExperimentStore, days_to_keep: u32, batch_size: usize) -> Result<CleanupReport> {
    if days_to_keep == 0 {
        return Err(EngineError::InvalidInput("days_to_keep must be >= 1".into()));
    }
    let cutoff_ms = now_ms().saturating_sub(u64::from(days_to_keep) * DAY_MS);
    let report = cleanup_before(store, cutoff_ms, batch_size)?;
    if report.any_work_done() {
        info!(
            conversions = report.conversions_deleted,
            allocations = report.allocations_deleted,
            days_to_keep,
            "retention cleanup removed expired rows"
        );
    }
    Ok(report)
}

/// Delete rows older than an absolute cutoff.
pub fn cleanup_before(store: &dyn ExperimentStore, cutoff_ms: u64, batch_size: usize) -> Result<CleanupReport> {
    if batch_size == 0 {
        return Err(EngineError::InvalidInput("batch_size must be >= 1".into()));
    }
    let mut conversions_deleted = drain(batch_size, |limit| store.delete_conversions_before(cutoff_ms, limit))?;
    let allocations_deleted = drain(batch_size, |limit| {
        let purged = store.delete_allocations_before(cutoff_ms, limit)?;
        conversions_deleted += purged.conversions;
        Ok(purged.allocations)
    })?;
    Ok(CleanupReport { conversions_deleted, allocations_deleted })
}

fn drain(batch_size: usize, mut delete_batch: impl FnMut(usize) -> Result<usize>) -> Result<usize> {
    let mut total = 0;
    loop {
        let deleted = delete_batch(batch_size)?;
        total += deleted;
        if deleted < batch_size {
            return Ok(total);
        }
        debug!(deleted, total, "retention batch done");
    }
}

/// Run [`cleanup`] every `config.interval()` on the tokio runtime.
///
/// The first run happens immediately. Failures are logged and the loop keeps
/// going; abort the returned handle to stop it.
pub fn spawn_periodic(store: Arc<dyn ExperimentStore>, config: RetentionConfig) -> JoinHandle<()> {
    let period = config.interval();
    spawn_periodic_every(store, config, period)
}

fn spawn_periodic_every(
    store: Arc<dyn ExperimentStore>,
    config: RetentionConfig,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let store = Arc::clone(&store);
            let (days, batch) = (config.days_to_keep, config.batch_size);
            match tokio::task::spawn_blocking(move || cleanup(store.as_ref(), days, batch)).await {
                Ok(Ok(report)) => {
                    debug!(total = report.total(), "periodic retention run finished");
                }
                Ok(Err(e)) => warn!(error = %e, "periodic retention run failed"),
                Err(e) => warn!(error = %e, "retention task join error"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Allocation, NewConversion, NewVariant, Test, Variant};
    use crate::store::{InMemoryStore, SqliteStore, TestInsert};

    fn seed(store: &dyn ExperimentStore) -> (Test, Vec<Variant>) {
        let variants = vec![NewVariant::control("a", "x", 100)];
        store
            .create_test(&TestInsert {
                page_id: 1,
                name: "t",
                confidence_level: 95.0,
                min_sample_size: 30,
                goals: &[],
                variants: &variants,
                created_at_ms: 0,
            })
            .unwrap()
    }

    fn add_visitor(store: &dyn ExperimentStore, test: &Test, variant: &Variant, visitor: &str, at: u64) {
        store
            .insert_allocation(&Allocation {
                test_id: test.id,
                variant_id: variant.id,
                visitor_id: visitor.into(),
                allocated_at_ms: at,
            })
            .unwrap();
        store
            .insert_conversion(&NewConversion {
                test_id: test.id,
                variant_id: variant.id,
                visitor_id: visitor.into(),
                conversion_type: "signup".into(),
                value: None,
                converted_at_ms: at,
            })
            .unwrap();
    }

    #[test]
    fn test_cleanup_removes_only_expired_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (test, variants) = seed(&store);
        let now = now_ms();
        for i in 0..7 {
            add_visitor(&store, &test, &variants[0], &format!("old-{i}"), now - 91 * DAY_MS);
        }
        add_visitor(&store, &test, &variants[0], "recent", now - DAY_MS);

        let report = cleanup(&store, 90, 3).unwrap();
        assert_eq!(report, CleanupReport { conversions_deleted: 7, allocations_deleted: 7 });
        assert!(store.find_allocation(test.id, "recent").unwrap().is_some());
        assert!(store.find_allocation(test.id, "old-0").unwrap().is_none());
        assert!(store.get_test(test.id).unwrap().is_some());
    }

    #[test]
    fn test_cleanup_drops_recent_conversions_of_expired_allocations() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (test, variants) = seed(&store);
        let now = now_ms();
        for i in 0..3 {
            let visitor = format!("lapsed-{i}");
            store
                .insert_allocation(&Allocation {
                    test_id: test.id,
                    variant_id: variants[0].id,
                    visitor_id: visitor.clone(),
                    allocated_at_ms: now - 100 * DAY_MS,
                })
                .unwrap();
            store
                .insert_conversion(&NewConversion {
                    test_id: test.id,
                    variant_id: variants[0].id,
                    visitor_id: visitor,
                    conversion_type: "signup".into(),
                    value: None,
                    converted_at_ms: now - 10 * DAY_MS,
                })
                .unwrap();
        }
        add_visitor(&store, &test, &variants[0], "recent", now - DAY_MS);

        let report = cleanup(&store, 90, 2).unwrap();
        assert_eq!(report, CleanupReport { conversions_deleted: 3, allocations_deleted: 3 });
        let tallies = store.tallies(test.id).unwrap();
        assert_eq!((tallies[0].visitors, tallies[0].converted_visitors, tallies[0].conversion_events), (1, 1, 1));
    }

    #[test]
    fn test_cleanup_exact_batch_multiple() {
        let store = InMemoryStore::new();
        let (test, variants) = seed(&store);
        for i in 0..4 {
            add_visitor(&store, &test, &variants[0], &format!("v{i}"), 10);
        }
        let report = cleanup_before(&store, 11, 2).unwrap();
        assert_eq!(report.total(), 8);
        assert_eq!(store.allocation_count(), 0);
    }

    #[test]
    fn test_cleanup_nothing_to_do() {
        let store = InMemoryStore::new();
        let report = cleanup(&store, 90, 100).unwrap();
        assert!(!report.any_work_done());
    }

    #[test]
    fn test_cleanup_rejects_zero_arguments() {
        let store = InMemoryStore::new();
        assert!(cleanup(&store, 0, 10).is_err());
        assert!(cleanup_before(&store, 0, 0).is_err());
    }

    #[tokio::test]
    async fn test_periodic_task_runs_cleanup() {
        let store = Arc::new(InMemoryStore::new());
        let (test, variants) = seed(store.as_ref());
        add_visitor(store.as_ref(), &test, &variants[0], "ancient", 0);

        let handle = spawn_periodic_every(
            store.clone(),
            RetentionConfig { days_to_keep: 1, interval_hours: 24, batch_size: 10 },
            Duration::from_millis(10),
        );
        for _ in 0..100 {
            if store.allocation_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(store.allocation_count(), 0);
        assert_eq!(store.conversion_count(), 0);
    }
}
