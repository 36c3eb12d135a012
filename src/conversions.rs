//! # Stage: Conversion Recorder
//!
//! ## Responsibility
//! Append conversion events for (test, variant, visitor) tuples.
//!
//! ## Trust boundary
//! Callers are expected to pass back the variant the allocator handed out.
//! With `verify_allocation` on (the default) the recorder checks that:
//!
//! - the test and the variant exist and the variant belongs to the test
//! - the visitor has an allocation on the test ([`EngineError::NotAllocated`])
//! - that allocation names the reported variant
//!   ([`EngineError::InconsistentConversion`])
//!
//! With it off, only the first check runs and the caller's variant is trusted.
//!
//! ## Guarantees
//! - No dedup: every accepted call appends one event. Rates are computed over
//!   distinct visitors, so repeats only move the event count

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ConversionConfig;
use crate::error::{EngineError, Result};
use crate::model::{now_ms, Conversion, NewConversion, TestId, VariantId};
use crate::store::ExperimentStore;

pub struct ConversionRecorder {
    store: Arc<dyn ExperimentStore>,
    config: ConversionConfig,
}

impl ConversionRecorder {
    pub fn new(store: Arc<dyn ExperimentStore>, config: ConversionConfig) -> Self {
        Self { store, config }
    }

    pub fn record_conversion(
        &self,
        test_id: TestId,
        variant_id: VariantId,
        visitor_id: &str,
        conversion_type: &str,
        value: Option<f64>,
    ) -> Result<Conversion> {
        if visitor_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("visitor id must not be empty".into()));
        }
        if conversion_type.trim().is_empty() {
            return Err(EngineError::InvalidInput("conversion type must not be empty".into()));
        }
        if value.is_some_and(|v| !v.is_finite()) {
            return Err(EngineError::InvalidInput("conversion value must be finite".into()));
        }

        self.store.get_test(test_id)?.ok_or(EngineError::TestNotFound(test_id))?;
        let variant = self
            .store
            .get_variant(variant_id)?
            .filter(|v| v.test_id == test_id)
            .ok_or(EngineError::VariantNotFound(variant_id))?;

        if self.config.verify_allocation {
            let allocation = self.store.find_allocation(test_id, visitor_id)?.ok_or_else(|| {
                EngineError::NotAllocated { test_id, visitor_id: visitor_id.to_string() }
            })?;
            if allocation.variant_id != variant.id {
                warn!(
                    test_id,
                    visitor_id,
                    allocated = allocation.variant_id,
                    reported = variant.id,
                    "conversion variant diverges from allocation"
                );
                return Err(EngineError::InconsistentConversion {
                    test_id,
                    visitor_id: visitor_id.to_string(),
                    allocated: allocation.variant_id,
                    reported: variant.id,
                });
            }
        }

        let conversion = self.store.insert_conversion(&NewConversion {
            test_id,
            variant_id: variant.id,
            visitor_id: visitor_id.to_string(),
            conversion_type: conversion_type.to_string(),
            value,
            converted_at_ms: now_ms(),
        })?;
        debug!(test_id, variant_id, visitor_id, conversion_type, "conversion recorded");
        Ok(conversion)
    }
}
