use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use pipeline_contracts::{
    AdviserResponse, FailureType, PayloadType, RepairActionCode, RollbackStrategy,
};
use serde::{Deserialize, Serialize};

use super::{Adviser, AdvisingEvent};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStageParameters {
    /// Node that follows; `None` ends the chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

impl PayloadType for NextStageParameters {
    const KIND: &'static str = "next-stage-adviser";
}

/// Advances to the next node after a succeeded, skipped or ignored node
pub struct NextStageAdviser;

impl Adviser for NextStageAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool> {
        Ok(event.to_status.is_positive())
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse> {
        let params: NextStageParameters = event.adviser_parameters.decode_or_default()?;
        Ok(AdviserResponse::NextStep {
            next_node_id: params.next_node_id,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreAdviserParameters {
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

impl PayloadType for IgnoreAdviserParameters {
    const KIND: &'static str = "ignore-adviser";
}

/// Treats matching failures as ignorable and continues
///
/// Never applies to an aborted node.
pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool> {
        let params: IgnoreAdviserParameters = event.adviser_parameters.decode_or_default()?;
        Ok(event.is_matching_failure(&params.failure_types))
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse> {
        let params: IgnoreAdviserParameters = event.adviser_parameters.decode_or_default()?;
        Ok(AdviserResponse::IgnoreFailure {
            next_node_id: params.next_node_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFailRollbackParameters {
    pub strategy: RollbackStrategy,
    /// Rollback entry node per strategy
    #[serde(default)]
    pub strategy_to_node: HashMap<RollbackStrategy, String>,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
}

impl Default for OnFailRollbackParameters {
    fn default() -> Self {
        Self {
            strategy: RollbackStrategy::StageRollback,
            strategy_to_node: HashMap::new(),
            failure_types: BTreeSet::new(),
        }
    }
}

impl PayloadType for OnFailRollbackParameters {
    const KIND: &'static str = "on-fail-rollback-adviser";
}

/// Redirects a failed node to the rollback sub-graph of its strategy
pub struct OnFailRollbackAdviser;

impl Adviser for OnFailRollbackAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool> {
        let params: OnFailRollbackParameters = event.adviser_parameters.decode_or_default()?;
        Ok(event.is_matching_failure(&params.failure_types)
            && params.strategy_to_node.contains_key(&params.strategy))
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse> {
        let params: OnFailRollbackParameters = event.adviser_parameters.decode_or_default()?;
        Ok(AdviserResponse::Rollback {
            strategy: params.strategy,
            rollback_node_id: params.strategy_to_node.get(&params.strategy).cloned(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualInterventionParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Applied when the timeout passes without a human decision
    #[serde(default)]
    pub timeout_action: RepairActionCode,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
}

impl PayloadType for ManualInterventionParameters {
    const KIND: &'static str = "manual-intervention-adviser";
}

/// Holds a failed node for a human decision
pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool> {
        let params: ManualInterventionParameters = event.adviser_parameters.decode_or_default()?;
        // A node is held at most once
        Ok(event.is_matching_failure(&params.failure_types)
            && event.node_execution.intervention_from.is_none())
    }

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse> {
        let params: ManualInterventionParameters = event.adviser_parameters.decode_or_default()?;
        Ok(match params.timeout {
            Some(timeout) => AdviserResponse::InterventionWait {
                timeout,
                timeout_action: params.timeout_action,
            },
            None => AdviserResponse::ManualIntervention {
                timeout: None,
                timeout_action: params.timeout_action,
            },
        })
    }
}
