//! # Stage: Data Model
//!
//! ## Responsibility
//! Plain data types shared by every engine component: tests, variants,
//! allocations, conversions, and the creation payloads that describe a new
//! test. Validation of creation payloads lives here so the store and the
//! lifecycle manager agree on what a well-formed test looks like.
//!
//! ## Guarantees
//! - A [`NewTest`] that passes [`NewTest::validate`] has variant percentages
//!   summing to exactly 100 and at most one control flag
//! - [`Goal`] is a closed, tagged set; unknown goal kinds fail deserialization

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub type TestId = i64;
pub type VariantId = i64;
pub type PageId = i64;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// TestStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Draft,
    /// Accepting allocations.
    Running,
    Paused,
    Completed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Draft => "draft",
            TestStatus::Running => "running",
            TestStatus::Paused => "paused",
            TestStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(TestStatus::Draft),
            "running" => Ok(TestStatus::Running),
            "paused" => Ok(TestStatus::Paused),
            "completed" => Ok(TestStatus::Completed),
            other => Err(EngineError::InvalidInput(format!("unknown test status '{}'", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Goal
// ---------------------------------------------------------------------------

/// What counts as success for a test. Stored as JSON alongside the test row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Goal {
    /// Any form submission, or one specific form.
    FormSubmit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        form_id: Option<String>,
    },
    Click { selector: String },
    PageView { path: String },
    /// Caller-defined event name, matched against `conversion_type`.
    Custom { event: String },
}

impl Goal {
    pub fn validate(&self) -> Result<()> {
        let blank = match self {
            Goal::FormSubmit { form_id } => form_id.as_deref().is_some_and(|f| f.trim().is_empty()),
            Goal::Click { selector } => selector.trim().is_empty(),
            Goal::PageView { path } => path.trim().is_empty(),
            Goal::Custom { event } => event.trim().is_empty(),
        };
        if blank {
            return Err(EngineError::InvalidInput(format!("goal has an empty target: {:?}", self)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

/// One experiment on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: TestId,
    pub page_id: PageId,
    pub name: String,
    pub status: TestStatus,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    /// Significance target in percent (e.g. 95.0).
    pub confidence_level: f64,
    /// Visitors each compared group needs before a winner may be declared.
    pub min_sample_size: u32,
    pub goals: Vec<Goal>,
    pub created_at_ms: u64,
}

/// One arm of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub test_id: TestId,
    pub name: String,
    /// Rendering target reference. Opaque to the engine.
    pub target: String,
    /// Share of traffic in whole percent, 0..=100.
    pub traffic_percentage: u8,
    pub is_control: bool,
    /// Creation order within the test, starting at 0.
    pub position: u32,
}

/// Sticky binding of a visitor to a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub test_id: TestId,
    pub variant_id: VariantId,
    pub visitor_id: String,
    pub allocated_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub id: i64,
    pub test_id: TestId,
    pub variant_id: VariantId,
    pub visitor_id: String,
    pub conversion_type: String,
    pub value: Option<f64>,
    pub converted_at_ms: u64,
}

/// A conversion event before it has been assigned a row id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversion {
    pub test_id: TestId,
    pub variant_id: VariantId,
    pub visitor_id: String,
    pub conversion_type: String,
    pub value: Option<f64>,
    pub converted_at_ms: u64,
}

// ---------------------------------------------------------------------------
// Creation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVariant {
    pub name: String,
    pub target: String,
    pub traffic_percentage: u8,
    #[serde(default)]
    pub is_control: bool,
}

impl NewVariant {
    pub fn new(name: impl Into<String>, target: impl Into<String>, traffic_percentage: u8) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            traffic_percentage,
            is_control: false,
        }
    }

    pub fn control(name: impl Into<String>, target: impl Into<String>, traffic_percentage: u8) -> Self {
        Self { is_control: true, ..Self::new(name, target, traffic_percentage) }
    }
}

/// Everything needed to create a test and its variants in one step.
///
/// `confidence_level` and `min_sample_size` fall back to the engine's
/// statistics config when left as `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewTest {
    pub name: String,
    #[serde(default)]
    pub confidence_level: Option<f64>,
    #[serde(default)]
    pub min_sample_size: Option<u32>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    pub variants: Vec<NewVariant>,
}

impl NewTest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_variant(mut self, variant: NewVariant) -> Self {
        self.variants.push(variant);
        self
    }

    pub fn with_goal(mut self, goal: Goal) -> Self {
        self.goals.push(goal);
        self
    }

    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = Some(level);
        self
    }

    pub fn with_min_sample_size(mut self, n: u32) -> Self {
        self.min_sample_size = Some(n);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("test name must not be empty".into()));
        }
        if self.variants.is_empty() {
            return Err(EngineError::InvalidConfig("a test needs at least one variant".into()));
        }
        if let Some(level) = self.confidence_level {
            if !(level > 0.0 && level < 100.0) {
                return Err(EngineError::InvalidConfig(format!(
                    "confidence_level must be in (0, 100), got {}",
                    level
                )));
            }
        }
        validate_split(self.variants.iter().map(|v| v.traffic_percentage))?;

        let controls = self.variants.iter().filter(|v| v.is_control).count();
        if controls > 1 {
            return Err(EngineError::InvalidConfig(format!(
                "at most one variant may be the control, got {}",
                controls
            )));
        }

        let mut names = HashSet::new();
        for v in &self.variants {
            if v.name.trim().is_empty() {
                return Err(EngineError::InvalidInput("variant name must not be empty".into()));
            }
            if !names.insert(v.name.as_str()) {
                return Err(EngineError::InvalidConfig(format!("duplicate variant name '{}'", v.name)));
            }
        }

        for goal in &self.goals {
            goal.validate()?;
        }
        Ok(())
    }
}

/// The flagged control, or the first variant by creation order when none is
/// flagged. `variants` may be in any order.
pub fn control_variant(variants: &[Variant]) -> Option<&Variant> {
    variants
        .iter()
        .find(|v| v.is_control)
        .or_else(|| variants.iter().min_by_key(|v| (v.position, v.id)))
}

/// `true` when some variant carries the control flag.
pub fn has_flagged_control(variants: &[Variant]) -> bool {
    variants.iter().any(|v| v.is_control)
}

/// Check that every percentage is in 0..=100 and that they sum to exactly 100.
pub fn validate_split(percentages: impl IntoIterator<Item = u8>) -> Result<()> {
    let mut total: u32 = 0;
    for pct in percentages {
        if pct > 100 {
            return Err(EngineError::InvalidConfig(format!(
                "traffic percentage must be in 0..=100, got {}",
                pct
            )));
        }
        total += u32::from(pct);
    }
    if total != 100 {
        return Err(EngineError::InvalidTrafficSplit { total });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
