//! Failure classification handed to advisers

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Category of a step failure, used by advisers to decide recoverability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Unknown,
    Application,
    Authentication,
    Authorization,
    Connectivity,
    Timeout,
    Verification,
    DelegateProvisioning,
    PolicyEvaluation,
    InputTimeout,
    ApprovalRejection,
    UserMarkedFailure,
}

/// Why a node failed
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            failure_types: BTreeSet::new(),
            message: message.into(),
            error_code: None,
        }
    }

    /// Add a failure type
    pub fn with_type(mut self, failure_type: FailureType) -> Self {
        self.failure_types.insert(failure_type);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// A deadline elapsed (task, node, or barrier)
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message).with_type(FailureType::Timeout)
    }

    /// Synthetic failure for an unclassified error or panic inside an executor
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(message).with_type(FailureType::Unknown)
    }

    /// A user resolved a manual intervention by failing the node
    pub fn user_marked(message: impl Into<String>) -> Self {
        Self::new(message).with_type(FailureType::UserMarkedFailure)
    }

    /// True when any of `types` is present, or `types` is empty (matches all)
    pub fn matches_any(&self, types: &BTreeSet<FailureType>) -> bool {
        if types.is_empty() {
            return true;
        }
        if self.failure_types.is_empty() {
            return types.contains(&FailureType::Unknown);
        }
        self.failure_types.iter().any(|t| types.contains(t))
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_any() {
        let info = FailureInfo::timeout("deadline");
        let mut filter = BTreeSet::new();
        assert!(info.matches_any(&filter));

        filter.insert(FailureType::Connectivity);
        assert!(!info.matches_any(&filter));

        filter.insert(FailureType::Timeout);
        assert!(info.matches_any(&filter));
    }

    #[test]
    fn test_untyped_failure_counts_as_unknown() {
        let info = FailureInfo::new("boom");
        let filter: BTreeSet<_> = [FailureType::Unknown].into_iter().collect();
        assert!(info.matches_any(&filter));
    }
}
