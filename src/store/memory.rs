//! # Stage: In-Memory Store
//!
//! ## Responsibility
//! In-process [`ExperimentStore`] with the same semantics as the SQLite
//! backend. All state sits behind a single `Mutex`, so every method is atomic
//! with respect to the others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{AllocationWrite, ExperimentStore, PurgedAllocations, TestInsert, VariantTally};
use crate::error::{EngineError, Result};
use crate::model::{
    Allocation, Conversion, NewConversion, PageId, Test, TestId, TestStatus, Variant, VariantId,
};

#[derive(Default)]
struct MemoryState {
    next_test_id: TestId,
    next_variant_id: VariantId,
    next_conversion_id: i64,
    tests: BTreeMap<TestId, Test>,
    variants: BTreeMap<VariantId, Variant>,
    allocations: HashMap<(TestId, String), Allocation>,
    conversions: Vec<Conversion>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of allocation rows currently held.
    pub fn allocation_count(&self) -> usize {
        self.state().allocations.len()
    }

    pub fn conversion_count(&self) -> usize {
        self.state().conversions.len()
    }
}

impl MemoryState {
    fn variants_of(&self, test_id: TestId) -> Vec<Variant> {
        let mut out: Vec<Variant> =
            self.variants.values().filter(|v| v.test_id == test_id).cloned().collect();
        out.sort_by_key(|v| (v.position, v.id));
        out
    }
}

impl ExperimentStore for InMemoryStore {
    fn create_test(&self, insert: &TestInsert<'_>) -> Result<(Test, Vec<Variant>)> {
        let mut names = HashSet::new();
        for v in insert.variants {
            if !names.insert(v.name.as_str()) {
                return Err(EngineError::InvalidConfig(format!("duplicate variant name '{}'", v.name)));
            }
        }

        let mut state = self.state();
        state.next_test_id += 1;
        let test = Test {
            id: state.next_test_id,
            page_id: insert.page_id,
            name: insert.name.to_string(),
            status: TestStatus::Draft,
            started_at_ms: None,
            ended_at_ms: None,
            confidence_level: insert.confidence_level,
            min_sample_size: insert.min_sample_size,
            goals: insert.goals.to_vec(),
            created_at_ms: insert.created_at_ms,
        };

        let mut variants = Vec::with_capacity(insert.variants.len());
        for (position, v) in insert.variants.iter().enumerate() {
            state.next_variant_id += 1;
            variants.push(Variant {
                id: state.next_variant_id,
                test_id: test.id,
                name: v.name.clone(),
                target: v.target.clone(),
                traffic_percentage: v.traffic_percentage,
                is_control: v.is_control,
                position: position as u32,
            });
        }
        for v in &variants {
            state.variants.insert(v.id, v.clone());
        }
        state.tests.insert(test.id, test.clone());
        Ok((test, variants))
    }

    fn get_test(&self, id: TestId) -> Result<Option<Test>> {
        Ok(self.state().tests.get(&id).cloned())
    }

    fn tests_for_page(&self, page_id: PageId, status: Option<TestStatus>) -> Result<Vec<Test>> {
        Ok(self
            .state()
            .tests
            .values()
            .filter(|t| t.page_id == page_id && status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    fn update_status(&self, id: TestId, status: TestStatus, now_ms: u64) -> Result<Option<Test>> {
        let mut state = self.state();
        let Some(test) = state.tests.get_mut(&id) else {
            return Ok(None);
        };
        test.status = status;
        match status {
            TestStatus::Running => {
                test.started_at_ms.get_or_insert(now_ms);
            }
            TestStatus::Completed => test.ended_at_ms = Some(now_ms),
            TestStatus::Draft | TestStatus::Paused => {}
        }
        Ok(Some(test.clone()))
    }

    fn delete_test(&self, id: TestId) -> Result<bool> {
        let mut state = self.state();
        if state.tests.remove(&id).is_none() {
            return Ok(false);
        }
        state.variants.retain(|_, v| v.test_id != id);
        state.allocations.retain(|(test_id, _), _| *test_id != id);
        state.conversions.retain(|c| c.test_id != id);
        Ok(true)
    }

    fn variants(&self, test_id: TestId) -> Result<Vec<Variant>> {
        Ok(self.state().variants_of(test_id))
    }

    fn get_variant(&self, id: VariantId) -> Result<Option<Variant>> {
        Ok(self.state().variants.get(&id).cloned())
    }

    fn set_traffic(&self, test_id: TestId, split: &[(VariantId, u8)]) -> Result<()> {
        let mut state = self.state();
        let mut pending: HashMap<VariantId, u8> =
            state.variants_of(test_id).iter().map(|v| (v.id, v.traffic_percentage)).collect();
        for &(variant_id, pct) in split {
            match pending.get_mut(&variant_id) {
                Some(slot) => *slot = pct,
                None => return Err(EngineError::VariantNotFound(variant_id)),
            }
        }
        let total: u32 = pending.values().map(|&p| u32::from(p)).sum();
        if total != 100 {
            return Err(EngineError::InvalidTrafficSplit { total });
        }
        for (id, pct) in pending {
            if let Some(v) = state.variants.get_mut(&id) {
                v.traffic_percentage = pct;
            }
        }
        Ok(())
    }

    fn find_allocation(&self, test_id: TestId, visitor_id: &str) -> Result<Option<Allocation>> {
        Ok(self.state().allocations.get(&(test_id, visitor_id.to_string())).cloned())
    }

    fn insert_allocation(&self, allocation: &Allocation) -> Result<AllocationWrite> {
        let mut state = self.state();
        if !state.variants.contains_key(&allocation.variant_id) {
            return Err(EngineError::VariantNotFound(allocation.variant_id));
        }
        let key = (allocation.test_id, allocation.visitor_id.clone());
        if state.allocations.contains_key(&key) {
            return Ok(AllocationWrite::Conflict);
        }
        state.allocations.insert(key, allocation.clone());
        Ok(AllocationWrite::Inserted)
    }

    fn insert_conversion(&self, conversion: &NewConversion) -> Result<Conversion> {
        let mut state = self.state();
        if !state.variants.contains_key(&conversion.variant_id) {
            return Err(EngineError::VariantNotFound(conversion.variant_id));
        }
        state.next_conversion_id += 1;
        let stored = Conversion {
            id: state.next_conversion_id,
            test_id: conversion.test_id,
            variant_id: conversion.variant_id,
            visitor_id: conversion.visitor_id.clone(),
            conversion_type: conversion.conversion_type.clone(),
            value: conversion.value,
            converted_at_ms: conversion.converted_at_ms,
        };
        state.conversions.push(stored.clone());
        Ok(stored)
    }

    fn tallies(&self, test_id: TestId) -> Result<Vec<VariantTally>> {
        let state = self.state();
        let tallies = state
            .variants_of(test_id)
            .into_iter()
            .map(|v| {
                let visitors = state
                    .allocations
                    .values()
                    .filter(|a| a.test_id == test_id && a.variant_id == v.id)
                    .count() as u64;
                let events: Vec<&Conversion> = state
                    .conversions
                    .iter()
                    .filter(|c| c.test_id == test_id && c.variant_id == v.id)
                    .collect();
                let converted: HashSet<&str> = events
                    .iter()
                    .filter(|c| {
                        state
                            .allocations
                            .get(&(test_id, c.visitor_id.clone()))
                            .is_some_and(|a| a.variant_id == v.id)
                    })
                    .map(|c| c.visitor_id.as_str())
                    .collect();
                VariantTally {
                    variant_id: v.id,
                    visitors,
                    converted_visitors: converted.len() as u64,
                    conversion_events: events.len() as u64,
                    total_value: events.iter().filter_map(|c| c.value).sum(),
                }
            })
            .collect();
        Ok(tallies)
    }

    fn delete_conversions_before(&self, cutoff_ms: u64, limit: usize) -> Result<usize> {
        let mut state = self.state();
        let mut deleted = 0;
        state.conversions.retain(|c| {
            if deleted < limit && c.converted_at_ms < cutoff_ms {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    fn delete_allocations_before(&self, cutoff_ms: u64, limit: usize) -> Result<PurgedAllocations> {
        let mut state = self.state();
        let expired: Vec<(TestId, String)> = state
            .allocations
            .iter()
            .filter(|(_, a)| a.allocated_at_ms < cutoff_ms)
            .map(|(key, _)| key.clone())
            .take(limit)
            .collect();
        for key in &expired {
            state.allocations.remove(key);
        }
        let before = state.conversions.len();
        state
            .conversions
            .retain(|c| !expired.iter().any(|(test_id, visitor)| c.test_id == *test_id && c.visitor_id == *visitor));
        Ok(PurgedAllocations {
            allocations: expired.len(),
            conversions: before - state.conversions.len(),
        })
    }
}
