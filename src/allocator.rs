//! # Stage: Allocator
//!
//! ## Responsibility
//! Decide which variant a visitor sees on a running test, and make that
//! decision sticky by persisting it before returning.
//!
//! ## Guarantees
//! - Deterministic: the bucket depends only on the visitor id, through a pinned
//!   32-bit rolling hash (`h = (h << 5) - h + unit` over UTF-16 code units,
//!   two's-complement wrap-around, `|h| mod 100` computed in 64 bits)
//! - Sticky: an existing allocation wins over the current traffic split
//! - Race-safe: when two first requests collide, the loser re-reads and
//!   returns the winner's variant
//!
//! ## NOT Responsible For
//! - Minting visitor ids (the caller owns cookies/sessions)
//! - Rebalancing already-allocated visitors

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::model::{self, now_ms, Allocation, TestId, TestStatus, Variant};
use crate::store::{AllocationWrite, ExperimentStore};

/// Pinned 32-bit rolling hash of a visitor id.
pub fn visitor_hash(visitor_id: &str) -> i32 {
    visitor_id
        .encode_utf16()
        .fold(0i32, |h, unit| (h << 5).wrapping_sub(h).wrapping_add(i32::from(unit)))
}

/// Bucket in `0..100` for a visitor id.
pub fn bucket_for(visitor_id: &str) -> u32 {
    (i64::from(visitor_hash(visitor_id)).abs() % 100) as u32
}

/// Variants in bucketing order: the control first, then creation order.
pub fn bucketing_order(variants: &[Variant]) -> Vec<&Variant> {
    let control_id = model::control_variant(variants).map(|v| v.id);
    let mut ordered: Vec<&Variant> = variants.iter().collect();
    ordered.sort_by_key(|v| (Some(v.id) != control_id, v.position, v.id));
    ordered
}

/// Map a bucket onto contiguous ranges sized by traffic percentage.
///
/// Returns `None` only when the percentages cover less than `bucket + 1`.
pub fn choose_variant(variants: &[Variant], bucket: u32) -> Option<&Variant> {
    let mut cumulative = 0u32;
    for v in bucketing_order(variants) {
        cumulative += u32::from(v.traffic_percentage);
        if bucket < cumulative {
            return Some(v);
        }
    }
    None
}

fn pick_variant(variants: &[Variant], bucket: u32) -> Result<&Variant> {
    choose_variant(variants, bucket).ok_or_else(|| {
        let total: u32 = variants.iter().map(|v| u32::from(v.traffic_percentage)).sum();
        EngineError::InvalidConfig(format!("no variant covers bucket {} (split totals {}%)", bucket, total))
    })
}

/// Sticky hash-based variant assignment over an injected store.
pub struct Allocator {
    store: Arc<dyn ExperimentStore>,
}

impl Allocator {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self { store }
    }

    /// The variant `visitor_id` sees on `test_id`.
    ///
    /// `Ok(None)` when the test is not running or has no variants. A running
    /// test whose percentages do not sum to 100 fails with
    /// [`EngineError::InvalidTrafficSplit`] for visitors not yet allocated.
    pub fn allocate(&self, test_id: TestId, visitor_id: &str) -> Result<Option<Variant>> {
        if visitor_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("visitor id must not be empty".into()));
        }
        let test = self.store.get_test(test_id)?.ok_or(EngineError::TestNotFound(test_id))?;
        if test.status != TestStatus::Running {
            debug!(test_id, status = %test.status, "test not running, no allocation");
            return Ok(None);
        }

        if let Some(existing) = self.store.find_allocation(test_id, visitor_id)? {
            return self.variant_of(&existing).map(Some);
        }

        let variants = self.store.variants(test_id)?;
        if variants.is_empty() {
            warn!(test_id, "running test has no variants");
            return Ok(None);
        }
        model::validate_split(variants.iter().map(|v| v.traffic_percentage))?;
        if !model::has_flagged_control(&variants) {
            warn!(test_id, "no control flagged, bucketing from first variant");
        }

        let bucket = bucket_for(visitor_id);
        let chosen = pick_variant(&variants, bucket)?.clone();

        let allocation = Allocation {
            test_id,
            variant_id: chosen.id,
            visitor_id: visitor_id.to_string(),
            allocated_at_ms: now_ms(),
        };
        match self.store.insert_allocation(&allocation)? {
            AllocationWrite::Inserted => {
                debug!(test_id, visitor_id, bucket, variant_id = chosen.id, "visitor allocated");
                Ok(Some(chosen))
            }
            AllocationWrite::Conflict => {
                let winner = self.store.find_allocation(test_id, visitor_id)?.ok_or_else(|| {
                    EngineError::NotAllocated { test_id, visitor_id: visitor_id.to_string() }
                })?;
                debug!(
                    test_id,
                    visitor_id,
                    variant_id = winner.variant_id,
                    "concurrent allocation won, returning stored variant"
                );
                self.variant_of(&winner).map(Some)
            }
        }
    }

    fn variant_of(&self, allocation: &Allocation) -> Result<Variant> {
        self.store
            .get_variant(allocation.variant_id)?
            .ok_or(EngineError::VariantNotFound(allocation.variant_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Conversion, NewConversion, NewVariant, PageId, Test, VariantId,
    };
    use crate::store::{InMemoryStore, PurgedAllocations, TestInsert, VariantTally};
    use proptest::prelude::*;
    use rstest::rstest;

    fn variant(id: VariantId, position: u32, pct: u8, is_control: bool) -> Variant {
        Variant {
            id,
            test_id: 1,
            name: format!("v{id}"),
            target: String::new(),
            traffic_percentage: pct,
            is_control,
            position,
        }
    }

    fn running_test(store: &InMemoryStore, variants: &[NewVariant]) -> (Test, Vec<Variant>) {
        let (test, created) = store
            .create_test(&TestInsert {
                page_id: 1,
                name: "t",
                confidence_level: 95.0,
                min_sample_size: 30,
                goals: &[],
                variants,
                created_at_ms: 0,
            })
            .unwrap();
        let test = store.update_status(test.id, TestStatus::Running, 1).unwrap().unwrap();
        (test, created)
    }

    // ===== hash vectors =====

    #[rstest]
    #[case("", 0, 0)]
    #[case("a", 97, 97)]
    #[case("ab", 3105, 5)]
    #[case("hello", 99162322, 22)]
    #[case("visitor-1", 1880544914, 14)]
    #[case("visitor-42", -1832649667, 67)]
    #[case("550e8400-e29b-41d4-a716-446655440000", 1716781005, 5)]
    #[case("héllo", 103094734, 34)]
    #[case("😀", 1772899, 99)]
    #[case("polygenelubricants", i32::MIN, 48)]
    fn test_hash_vectors(#[case] id: &str, #[case] hash: i32, #[case] bucket: u32) {
        assert_eq!(visitor_hash(id), hash);
        assert_eq!(bucket_for(id), bucket);
    }

    proptest! {
        #[test]
        fn prop_bucket_in_range(id in ".*") {
            prop_assert!(bucket_for(&id) < 100);
        }

        #[test]
        fn prop_bucket_deterministic(id in "[a-zA-Z0-9-]{1,40}") {
            prop_assert_eq!(bucket_for(&id), bucket_for(&id.clone()));
        }
    }

    // ===== partitioning =====

    #[rstest]
    #[case(0, 1)]
    #[case(29, 1)]
    #[case(30, 2)]
    #[case(99, 2)]
    fn test_choose_variant_ranges(#[case] bucket: u32, #[case] expected: VariantId) {
        let vs = vec![variant(1, 0, 30, true), variant(2, 1, 70, false)];
        assert_eq!(choose_variant(&vs, bucket).map(|v| v.id), Some(expected));
    }

    #[test]
    fn test_control_ranges_first_regardless_of_position() {
        // Control created second still owns the low range.
        let vs = vec![variant(1, 0, 70, false), variant(2, 1, 30, true)];
        assert_eq!(choose_variant(&vs, 0).map(|v| v.id), Some(2));
        assert_eq!(choose_variant(&vs, 29).map(|v| v.id), Some(2));
        assert_eq!(choose_variant(&vs, 30).map(|v| v.id), Some(1));
    }

    #[test]
    fn test_zero_percent_variant_never_chosen() {
        let vs = vec![variant(1, 0, 0, true), variant(2, 1, 100, false)];
        for bucket in 0..100 {
            assert_eq!(choose_variant(&vs, bucket).map(|v| v.id), Some(2));
        }
    }

    #[test]
    fn test_under_covered_split_returns_none() {
        let vs = vec![variant(1, 0, 40, true), variant(2, 1, 40, false)];
        assert!(choose_variant(&vs, 85).is_none());
    }

    #[test]
    fn test_uncovered_bucket_reports_real_total() {
        let vs = vec![variant(1, 0, 40, true), variant(2, 1, 40, false)];
        let err = pick_variant(&vs, 85).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("80%"), "{}", err);
        assert_eq!(pick_variant(&vs, 79).unwrap().id, 2);
    }

    // ===== allocate =====

    #[test]
    fn test_allocate_persists_and_is_sticky() {
        let store = Arc::new(InMemoryStore::new());
        let (test, _) = running_test(&store, &[NewVariant::control("a", "x", 50), NewVariant::new("b", "y", 50)]);
        let allocator = Allocator::new(store.clone());
        let first = allocator.allocate(test.id, "visitor-42").unwrap().unwrap();
        for _ in 0..5 {
            assert_eq!(allocator.allocate(test.id, "visitor-42").unwrap().unwrap(), first);
        }
        assert_eq!(store.allocation_count(), 1);
    }

    #[test]
    fn test_allocate_follows_bucket() {
        let store = Arc::new(InMemoryStore::new());
        let (test, variants) =
            running_test(&store, &[NewVariant::control("a", "x", 30), NewVariant::new("b", "y", 70)]);
        let allocator = Allocator::new(store);
        // "visitor-1" → bucket 14, "visitor-42" → bucket 67.
        assert_eq!(allocator.allocate(test.id, "visitor-1").unwrap().unwrap().id, variants[0].id);
        assert_eq!(allocator.allocate(test.id, "visitor-42").unwrap().unwrap().id, variants[1].id);
    }

    #[test]
    fn test_allocate_not_running_returns_none() {
        let store = Arc::new(InMemoryStore::new());
        let (test, _) = running_test(&store, &[NewVariant::new("a", "x", 100)]);
        store.update_status(test.id, TestStatus::Paused, 2).unwrap();
        let allocator = Allocator::new(store.clone());
        assert!(allocator.allocate(test.id, "v").unwrap().is_none());
        assert_eq!(store.allocation_count(), 0);
    }

    #[test]
    fn test_allocate_no_variants_returns_none() {
        let store = Arc::new(InMemoryStore::new());
        let (test, _) = running_test(&store, &[]);
        assert!(Allocator::new(store).allocate(test.id, "v").unwrap().is_none());
    }

    #[test]
    fn test_allocate_bad_split_is_config_error() {
        let store = Arc::new(InMemoryStore::new());
        let (test, _) = running_test(&store, &[NewVariant::new("a", "x", 60), NewVariant::new("b", "y", 60)]);
        let err = Allocator::new(store.clone()).allocate(test.id, "v").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrafficSplit { total: 120 }));
        assert_eq!(store.allocation_count(), 0);
    }

    #[test]
    fn test_allocate_unknown_test_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let err = Allocator::new(store).allocate(404, "v").unwrap_err();
        assert!(matches!(err, EngineError::TestNotFound(404)));
    }

    #[test]
    fn test_allocate_empty_visitor_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let (test, _) = running_test(&store, &[NewVariant::new("a", "x", 100)]);
        assert!(matches!(
            Allocator::new(store).allocate(test.id, "  "),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_existing_allocation_survives_rebalance() {
        let store = Arc::new(InMemoryStore::new());
        let (test, variants) =
            running_test(&store, &[NewVariant::control("a", "x", 30), NewVariant::new("b", "y", 70)]);
        let allocator = Allocator::new(store.clone());
        let before = allocator.allocate(test.id, "visitor-42").unwrap().unwrap();
        assert_eq!(before.id, variants[1].id);
        store.set_traffic(test.id, &[(variants[0].id, 100), (variants[1].id, 0)]).unwrap();
        let after = allocator.allocate(test.id, "visitor-42").unwrap().unwrap();
        assert_eq!(after.id, before.id);
        // A fresh visitor follows the new split.
        assert_eq!(allocator.allocate(test.id, "visitor-new").unwrap().unwrap().id, variants[0].id);
    }

    // ===== race recovery =====

    /// Store that lets a competing writer claim the slot between the
    /// allocator's lookup and its insert.
    struct RacingStore {
        inner: InMemoryStore,
        rival_variant: VariantId,
    }

    impl ExperimentStore for RacingStore {
        fn create_test(&self, insert: &TestInsert<'_>) -> Result<(Test, Vec<Variant>)> {
            self.inner.create_test(insert)
        }
        fn get_test(&self, id: TestId) -> Result<Option<Test>> {
            self.inner.get_test(id)
        }
        fn tests_for_page(&self, page_id: PageId, status: Option<TestStatus>) -> Result<Vec<Test>> {
            self.inner.tests_for_page(page_id, status)
        }
        fn update_status(&self, id: TestId, status: TestStatus, now_ms: u64) -> Result<Option<Test>> {
            self.inner.update_status(id, status, now_ms)
        }
        fn delete_test(&self, id: TestId) -> Result<bool> {
            self.inner.delete_test(id)
        }
        fn variants(&self, test_id: TestId) -> Result<Vec<Variant>> {
            self.inner.variants(test_id)
        }
        fn get_variant(&self, id: VariantId) -> Result<Option<Variant>> {
            self.inner.get_variant(id)
        }
        fn set_traffic(&self, test_id: TestId, split: &[(VariantId, u8)]) -> Result<()> {
            self.inner.set_traffic(test_id, split)
        }
        fn find_allocation(&self, test_id: TestId, visitor_id: &str) -> Result<Option<Allocation>> {
            self.inner.find_allocation(test_id, visitor_id)
        }
        fn insert_allocation(&self, allocation: &Allocation) -> Result<AllocationWrite> {
            let rival = Allocation { variant_id: self.rival_variant, ..allocation.clone() };
            self.inner.insert_allocation(&rival)?;
            self.inner.insert_allocation(allocation)
        }
        fn insert_conversion(&self, conversion: &NewConversion) -> Result<Conversion> {
            self.inner.insert_conversion(conversion)
        }
        fn tallies(&self, test_id: TestId) -> Result<Vec<VariantTally>> {
            self.inner.tallies(test_id)
        }
        fn delete_conversions_before(&self, cutoff_ms: u64, limit: usize) -> Result<usize> {
            self.inner.delete_conversions_before(cutoff_ms, limit)
        }
        fn delete_allocations_before(&self, cutoff_ms: u64, limit: usize) -> Result<PurgedAllocations> {
            self.inner.delete_allocations_before(cutoff_ms, limit)
        }
    }

    #[test]
    fn test_lost_race_returns_winning_variant() {
        let inner = InMemoryStore::new();
        // Every visitor buckets into "a" (100%); the rival writes "b".
        let (test, variants) = running_test(&inner, &[NewVariant::control("a", "x", 100), NewVariant::new("b", "y", 0)]);
        let store = Arc::new(RacingStore { inner, rival_variant: variants[1].id });
        let allocator = Allocator::new(store.clone());
        let got = allocator.allocate(test.id, "visitor-1").unwrap().unwrap();
        assert_eq!(got.id, variants[1].id);
        assert_eq!(store.inner.allocation_count(), 1);
    }
}
