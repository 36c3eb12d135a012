//! Crate-level error type.
//!
//! Every fallible operation in the engine returns [`Result<T>`]. Storage and
//! serialization failures are carried through untouched; the only storage
//! condition the engine absorbs is the allocation uniqueness race, which never
//! surfaces here (see [`crate::store::AllocationWrite`]).

use crate::model::{TestId, VariantId};

/// Errors surfaced by the experimentation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Variant traffic percentages do not add up to exactly 100.
    #[error("variant traffic percentages must sum to 100, got {total}")]
    InvalidTrafficSplit { total: u32 },

    /// Any other structural problem with a test definition or engine config.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Caller-supplied value rejected at the boundary.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("test {0} not found")]
    TestNotFound(TestId),

    #[error("variant {0} not found")]
    VariantNotFound(VariantId),

    /// A conversion was reported for a visitor that was never allocated.
    #[error("visitor '{visitor_id}' has no allocation on test {test_id}")]
    NotAllocated { test_id: TestId, visitor_id: String },

    /// A conversion named a different variant than the stored allocation.
    #[error(
        "visitor '{visitor_id}' on test {test_id} is allocated to variant {allocated}, \
         conversion reported variant {reported}"
    )]
    InconsistentConversion {
        test_id: TestId,
        visitor_id: String,
        allocated: VariantId,
        reported: VariantId,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// `true` for the not-found family (unknown test, variant, or allocation).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::TestNotFound(_)
                | EngineError::VariantNotFound(_)
                | EngineError::NotAllocated { .. }
        )
    }

    /// `true` when a conversion disagreed with the stored allocation.
    pub fn is_consistency(&self) -> bool {
        matches!(self, EngineError::InconsistentConversion { .. })
    }

    /// `true` for configuration problems (bad split, bad test or engine config).
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidTrafficSplit { .. } | EngineError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_family() {
        assert!(EngineError::TestNotFound(1).is_not_found());
        assert!(EngineError::VariantNotFound(2).is_not_found());
        let e = EngineError::NotAllocated { test_id: 1, visitor_id: "v".into() };
        assert!(e.is_not_found());
        assert!(!e.is_consistency());
    }

    #[test]
    fn test_consistency_is_distinct_from_not_found() {
        let e = EngineError::InconsistentConversion {
            test_id: 1,
            visitor_id: "v".into(),
            allocated: 10,
            reported: 11,
        };
        assert!(e.is_consistency());
        assert!(!e.is_not_found());
        assert!(!e.is_config());
    }

    #[test]
    fn test_split_error_message_names_total() {
        let msg = EngineError::InvalidTrafficSplit { total: 99 }.to_string();
        assert!(msg.contains("99"), "{}", msg);
        assert!(EngineError::InvalidTrafficSplit { total: 99 }.is_config());
    }
}
