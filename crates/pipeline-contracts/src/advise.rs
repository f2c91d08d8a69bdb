//! Adviser obtainments and responses
//!
//! A node declares an ordered list of adviser obtainments; after the node
//! reaches a terminal status the first adviser that can advise produces an
//! [`AdviserResponse`] naming the next control-flow action.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Registry key of an adviser implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    Retry,
    OnFailRollback,
    ManualIntervention,
    Ignore,
    NextStage,
}

impl std::fmt::Display for AdviserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AdviserType::Retry => "RETRY",
            AdviserType::OnFailRollback => "ON_FAIL_ROLLBACK",
            AdviserType::ManualIntervention => "MANUAL_INTERVENTION",
            AdviserType::Ignore => "IGNORE",
            AdviserType::NextStage => "NEXT_STAGE",
        };
        f.write_str(name)
    }
}

/// An adviser declared on a plan node, with its encoded parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdviserObtainment {
    pub adviser_type: AdviserType,
    #[serde(default)]
    pub parameters: Payload,
}

impl AdviserObtainment {
    pub fn new(adviser_type: AdviserType, parameters: Payload) -> Self {
        Self {
            adviser_type,
            parameters,
        }
    }
}

/// Action taken when retries are exhausted or an intervention times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairActionCode {
    ManualIntervention,
    Ignore,
    /// Let the failure stand and end the node
    #[default]
    MarkAsFailure,
    MarkAsSuccess,
    Rollback,
    /// Stop the whole plan execution
    EndExecution,
    Abort,
}

/// Scope a rollback applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStrategy {
    StageRollback,
    StepGroupRollback,
    PipelineRollback,
}

/// The control-flow action chosen by an adviser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    /// Advance to the named node, or end when there is none
    #[serde(rename_all = "camelCase")]
    NextStep { next_node_id: Option<String> },
    /// Re-run the node after `wait_interval`; `retry_index` is the new attempt's index
    #[serde(rename_all = "camelCase")]
    Retry {
        wait_interval: Duration,
        retry_index: u32,
    },
    /// Redirect to a rollback sub-graph
    #[serde(rename_all = "camelCase")]
    Rollback {
        strategy: RollbackStrategy,
        rollback_node_id: Option<String>,
    },
    /// Hold the node for a human, optionally with a timeout
    #[serde(rename_all = "camelCase")]
    ManualIntervention {
        timeout: Option<Duration>,
        timeout_action: RepairActionCode,
    },
    /// Treat the failure as ignorable and continue
    #[serde(rename_all = "camelCase")]
    IgnoreFailure { next_node_id: Option<String> },
    /// Finish the plan execution now
    #[serde(rename_all = "camelCase")]
    EndPlan { is_abort: bool },
    /// Hold the node for a human until the timeout fires
    #[serde(rename_all = "camelCase")]
    InterventionWait {
        timeout: Duration,
        timeout_action: RepairActionCode,
    },
}
