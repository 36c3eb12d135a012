//! # Stage: Statistics Engine
//!
//! ## Responsibility
//! Turn per-variant visitor and conversion tallies into conversion rates,
//! 95% Wald confidence intervals, and a two-proportion Z-test of every
//! challenger against the control. Declares a winner or reports why not.
//!
//! ## Guarantees
//! - Rates count distinct converting visitors, never raw events
//! - Zero-visitor variants have rate 0 and interval [0, 0]
//! - No comparison runs unless both groups reach `min_visitors`
//! - With more than one challenger, p-values are Bonferroni-adjusted by the
//!   number of comparisons performed, so the family-wise error stays at the
//!   target level. A single challenger is unadjusted
//! - Read-only: results are computed from whatever snapshot the store returns

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StatisticsConfig;
use crate::error::{EngineError, Result};
use crate::model::{self, Test, TestId, Variant, VariantId};
use crate::store::{ExperimentStore, VariantTally};

/// z-value for a two-sided 95% interval.
pub const CI_Z_95: f64 = 1.96;

// ---------------------------------------------------------------------------
// Normal distribution
// ---------------------------------------------------------------------------

/// Upper tail probability of the standard normal distribution (Z > x).
///
/// Abramowitz & Stegun 26.2.17; absolute error below 7.5e-8.
fn standard_normal_upper_tail(x: f64) -> f64 {
    if x < 0.0 {
        return 1.0 - standard_normal_upper_tail(-x);
    }
    if x > 8.0 {
        return 0.0;
    }
    let t = 1.0 / (1.0 + 0.2316419 * x);
    let poly = t * (0.319381530
        + t * (-0.356563782
        + t * (1.781477937
        + t * (-1.821255978
        + t * 1.330274429))));
    let pdf = (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
    pdf * poly
}

/// Standard normal CDF, Φ(z).
pub fn normal_cdf(z: f64) -> f64 {
    1.0 - standard_normal_upper_tail(z)
}

// ---------------------------------------------------------------------------
// Two-proportion Z-test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZTest {
    /// |rate_b - rate_a| / pooled standard error.
    pub z_score: f64,
    /// Two-tailed p-value.
    pub p_value: f64,
    /// `(1 - p_value) * 100`.
    pub significance: f64,
}

/// Pooled two-proportion Z-test. `None` when either group is empty.
pub fn two_proportion_z_test(
    conversions_a: u64,
    visitors_a: u64,
    conversions_b: u64,
    visitors_b: u64,
) -> Option<ZTest> {
    if visitors_a == 0 || visitors_b == 0 {
        return None;
    }
    let (na, nb) = (visitors_a as f64, visitors_b as f64);
    let rate_a = conversions_a as f64 / na;
    let rate_b = conversions_b as f64 / nb;
    let pooled = (conversions_a + conversions_b) as f64 / (na + nb);
    let se = (pooled * (1.0 - pooled) * (1.0 / na + 1.0 / nb)).sqrt();

    // Both groups all-converted or none-converted: no evidence of a difference.
    if se <= 0.0 || !se.is_finite() {
        return Some(ZTest { z_score: 0.0, p_value: 1.0, significance: 0.0 });
    }

    let z_score = (rate_b - rate_a).abs() / se;
    let p_value = (2.0 * standard_normal_upper_tail(z_score)).clamp(0.0, 1.0);
    Some(ZTest { z_score, p_value, significance: (1.0 - p_value) * 100.0 })
}

/// 95% Wald interval for a proportion, in percent, clipped to [0, 100].
pub fn confidence_interval(rate: f64, visitors: u64) -> (f64, f64) {
    if visitors == 0 {
        return (0.0, 0.0);
    }
    let half_width = CI_Z_95 * (rate * (1.0 - rate) / visitors as f64).sqrt();
    let lower = ((rate - half_width) * 100.0).clamp(0.0, 100.0);
    let upper = ((rate + half_width) * 100.0).clamp(0.0, 100.0);
    (lower, upper)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Significant,
    Inconclusive,
    InsufficientData,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Significant => write!(f, "significant"),
            ResultStatus::Inconclusive => write!(f, "inconclusive"),
            ResultStatus::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: VariantId,
    pub name: String,
    pub is_control: bool,
    pub visitors: u64,
    /// Distinct visitors with at least one conversion.
    pub conversions: u64,
    pub conversion_events: u64,
    pub total_value: f64,
    /// Percent.
    pub conversion_rate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub is_winner: bool,
}

/// One challenger measured against the control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub variant_id: VariantId,
    pub z_score: f64,
    pub p_value: f64,
    /// `p_value` times the number of comparisons, capped at 1.
    pub adjusted_p_value: f64,
    /// `(1 - adjusted_p_value) * 100`.
    pub significance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub test_id: TestId,
    pub control_variant_id: Option<VariantId>,
    pub variants: Vec<VariantResult>,
    pub comparisons: Vec<Comparison>,
    /// Highest significance across comparisons, percent.
    pub statistical_significance: f64,
    /// The test's significance target, percent.
    pub confidence_interval: f64,
    pub winner_variant_id: Option<VariantId>,
    pub test_status: ResultStatus,
}

impl TestResults {
    pub fn variant(&self, id: VariantId) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.variant_id == id)
    }
}

/// Compute results for one test from its variants and their tallies.
///
/// `min_visitors` is the normal-approximation floor; a winner additionally
/// needs both groups to reach the test's own `min_sample_size`.
pub fn compute_results(
    test: &Test,
    variants: &[Variant],
    tallies: &[VariantTally],
    min_visitors: u32,
) -> TestResults {
    let by_id: HashMap<VariantId, &VariantTally> = tallies.iter().map(|t| (t.variant_id, t)).collect();

    let mut ordered: Vec<&Variant> = variants.iter().collect();
    ordered.sort_by_key(|v| (v.position, v.id));

    let control_id = model::control_variant(variants).map(|v| v.id);
    let mut results: Vec<VariantResult> = ordered
        .iter()
        .map(|v| {
            let tally = by_id.get(&v.id).copied().cloned().unwrap_or_default();
            let rate = if tally.visitors == 0 {
                0.0
            } else {
                tally.converted_visitors as f64 / tally.visitors as f64
            };
            let (ci_lower, ci_upper) = confidence_interval(rate, tally.visitors);
            VariantResult {
                variant_id: v.id,
                name: v.name.clone(),
                is_control: Some(v.id) == control_id,
                visitors: tally.visitors,
                conversions: tally.converted_visitors,
                conversion_events: tally.conversion_events,
                total_value: tally.total_value,
                conversion_rate: rate * 100.0,
                ci_lower,
                ci_upper,
                is_winner: false,
            }
        })
        .collect();

    let mut out = TestResults {
        test_id: test.id,
        control_variant_id: control_id,
        variants: Vec::new(),
        comparisons: Vec::new(),
        statistical_significance: 0.0,
        confidence_interval: test.confidence_level,
        winner_variant_id: None,
        test_status: ResultStatus::InsufficientData,
    };

    if results.len() < 2 {
        out.variants = results;
        return out;
    }
    if !model::has_flagged_control(variants) {
        warn!(test_id = test.id, "no control flagged, comparing against first variant");
    }

    let floor = u64::from(min_visitors);
    let Some(control) = results.iter().find(|r| r.is_control).cloned() else {
        out.variants = results;
        return out;
    };
    let eligible: Vec<&VariantResult> = results
        .iter()
        .filter(|r| !r.is_control && r.visitors >= floor && control.visitors >= floor)
        .collect();
    let comparisons = eligible.len().max(1) as f64;

    // (comparison, candidate winner id, smaller group size)
    let mut best: Option<(Comparison, VariantId, u64)> = None;
    for challenger in eligible {
        let Some(z) = two_proportion_z_test(
            control.conversions,
            control.visitors,
            challenger.conversions,
            challenger.visitors,
        ) else {
            continue;
        };
        let adjusted = (z.p_value * comparisons).min(1.0);
        let comparison = Comparison {
            variant_id: challenger.variant_id,
            z_score: z.z_score,
            p_value: z.p_value,
            adjusted_p_value: adjusted,
            significance: (1.0 - adjusted) * 100.0,
        };
        let candidate = if challenger.conversion_rate > control.conversion_rate {
            challenger.variant_id
        } else {
            control.variant_id
        };
        let smaller = control.visitors.min(challenger.visitors);
        if best.as_ref().map_or(true, |(b, _, _)| comparison.significance > b.significance) {
            best = Some((comparison.clone(), candidate, smaller));
        }
        out.comparisons.push(comparison);
    }

    let required = floor.max(u64::from(test.min_sample_size));
    if let Some((comparison, candidate, smaller)) = best {
        out.statistical_significance = comparison.significance;
        if comparison.significance >= test.confidence_level && smaller >= required {
            out.winner_variant_id = Some(candidate);
        }
    }

    if let Some(winner) = out.winner_variant_id {
        for r in results.iter_mut() {
            r.is_winner = r.variant_id == winner;
        }
        out.test_status = ResultStatus::Significant;
    } else if results.iter().all(|r| r.visitors >= floor) {
        out.test_status = ResultStatus::Inconclusive;
    }

    debug!(
        test_id = test.id,
        significance = out.statistical_significance,
        status = %out.test_status,
        "results computed"
    );
    out.variants = results;
    out
}

/// Reads tallies from the store and computes [`TestResults`] on demand.
pub struct StatisticsEngine {
    store: Arc<dyn ExperimentStore>,
    config: StatisticsConfig,
}

impl StatisticsEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, config: StatisticsConfig) -> Self {
        Self { store, config }
    }

    pub fn get_results(&self, test_id: TestId) -> Result<TestResults> {
        let test = self.store.get_test(test_id)?.ok_or(EngineError::TestNotFound(test_id))?;
        let variants = self.store.variants(test_id)?;
        let tallies = self.store.tallies(test_id)?;
        Ok(compute_results(&test, &variants, &tallies, self.config.min_visitors))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
