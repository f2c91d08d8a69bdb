//! Advisers: what happens after a node reaches a terminal status
//!
//! A node declares an ordered list of adviser obtainments. Once the node is
//! terminal the engine asks each adviser in turn whether it
//! [`can_advise`](Adviser::can_advise); the first that can produces the
//! [`AdviserResponse`]. Selection depends only on the node execution, its
//! plan node and the adviser parameters, so the same inputs always pick the
//! same adviser. When no adviser applies, the node ends and its status is
//! reported to its parent or the plan.

mod flow;
mod retry;

use std::collections::BTreeSet;
use std::sync::Arc;

use pipeline_contracts::{
    AdviserResponse, AdviserType, FailureInfo, FailureType, Payload, PlanNode, RepairActionCode,
    Status,
};

use crate::error::Result;
use crate::execution::NodeExecution;
use crate::registry::Registry;

pub use flow::{
    IgnoreAdviser, IgnoreAdviserParameters, ManualInterventionAdviser,
    ManualInterventionParameters, NextStageAdviser, NextStageParameters, OnFailRollbackAdviser,
    OnFailRollbackParameters,
};
pub use retry::{RetryAdviser, RetryAdviserParameters};

/// A terminal node execution waiting for advice
pub struct AdvisingEvent<'a> {
    pub node_execution: &'a NodeExecution,
    pub plan_node: &'a PlanNode,
    /// Status the node reached
    pub to_status: Status,
    pub adviser_parameters: &'a Payload,
}

impl AdvisingEvent<'_> {
    pub fn failure_info(&self) -> Option<&FailureInfo> {
        self.node_execution.failure_info.as_ref()
    }

    pub fn retry_index(&self) -> u32 {
        self.node_execution.retry_index()
    }

    /// Broken, and the failure matches `failure_types` (empty matches all)
    pub fn is_matching_failure(&self, failure_types: &BTreeSet<FailureType>) -> bool {
        if !self.to_status.is_broken() {
            return false;
        }
        match self.failure_info() {
            Some(info) => info.matches_any(failure_types),
            None => failure_types.is_empty() || failure_types.contains(&FailureType::Unknown),
        }
    }
}

pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool>;

    fn on_advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse>;
}

pub type AdviserRegistry = Registry<AdviserType, dyn Adviser>;

/// A registry holding every built-in adviser
pub fn default_advisers() -> Result<AdviserRegistry> {
    let mut registry = AdviserRegistry::new("adviser");
    registry.register(AdviserType::Retry, Arc::new(RetryAdviser))?;
    registry.register(AdviserType::OnFailRollback, Arc::new(OnFailRollbackAdviser))?;
    registry.register(
        AdviserType::ManualIntervention,
        Arc::new(ManualInterventionAdviser),
    )?;
    registry.register(AdviserType::Ignore, Arc::new(IgnoreAdviser))?;
    registry.register(AdviserType::NextStage, Arc::new(NextStageAdviser))?;
    Ok(registry)
}

/// Ask the node's advisers in declaration order; the first that can advise wins
pub fn advise(
    registry: &AdviserRegistry,
    node_execution: &NodeExecution,
    plan_node: &PlanNode,
) -> Result<Option<(AdviserType, AdviserResponse)>> {
    for obtainment in &plan_node.adviser_obtainments {
        let adviser = registry.obtain(&obtainment.adviser_type)?;
        let event = AdvisingEvent {
            node_execution,
            plan_node,
            to_status: node_execution.status,
            adviser_parameters: &obtainment.parameters,
        };
        if adviser.can_advise(&event)? {
            let response = adviser.on_advise(&event)?;
            log::debug!(
                "Adviser {} chose {:?} for '{}'",
                obtainment.adviser_type,
                response,
                node_execution.identifier
            );
            return Ok(Some((obtainment.adviser_type, response)));
        }
    }
    Ok(None)
}

/// The advice a repair action stands for, if it changes control flow
///
/// `MarkAsFailure` and `Rollback` return `None`: the failure stands and
/// the next adviser in line (e.g. an on-fail rollback) may act on it.
/// `MarkAsSuccess` cannot turn a failed node into a succeeded one, so it
/// continues the way an ignored failure does.
pub fn repair_response(
    action: RepairActionCode,
    next_node_id: Option<&str>,
) -> Option<AdviserResponse> {
    match action {
        RepairActionCode::ManualIntervention => Some(AdviserResponse::ManualIntervention {
            timeout: None,
            timeout_action: RepairActionCode::MarkAsFailure,
        }),
        RepairActionCode::Ignore | RepairActionCode::MarkAsSuccess => {
            Some(AdviserResponse::IgnoreFailure {
                next_node_id: next_node_id.map(str::to_string),
            })
        }
        RepairActionCode::EndExecution => Some(AdviserResponse::EndPlan { is_abort: false }),
        RepairActionCode::Abort => Some(AdviserResponse::EndPlan { is_abort: true }),
        RepairActionCode::MarkAsFailure | RepairActionCode::Rollback => None,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use pipeline_contracts::{AdviserObtainment, PayloadType};

    fn with_advisers(obtainments: Vec<AdviserObtainment>) -> PlanNode {
        let mut node = plan_node();
        node.adviser_obtainments = obtainments;
        node
    }

    fn params<T: PayloadType>(value: &T) -> Payload {
        Payload::encode(value).unwrap()
    }

    #[test]
    fn test_first_matching_adviser_wins() {
        let registry = default_advisers().unwrap();
        let node = with_advisers(vec![
            AdviserObtainment::new(
                AdviserType::Ignore,
                params(&IgnoreAdviserParameters {
                    failure_types: [FailureType::Connectivity].into_iter().collect(),
                    next_node_id: None,
                }),
            ),
            AdviserObtainment::new(
                AdviserType::Retry,
                params(&RetryAdviserParameters {
                    retry_count: 1,
                    ..Default::default()
                }),
            ),
            AdviserObtainment::new(AdviserType::Ignore, Payload::empty()),
        ]);
        let failed = node_execution(Status::Failed, Some(FailureInfo::timeout("slow")), 0);

        // Deterministic: repeated selection picks the same adviser
        for _ in 0..3 {
            let (adviser_type, response) = advise(&registry, &failed, &node).unwrap().unwrap();
            assert_eq!(adviser_type, AdviserType::Retry);
            assert!(matches!(response, AdviserResponse::Retry { retry_index: 1, .. }));
        }

        // Retries exhausted: falls through to the catch-all ignore
        let exhausted = node_execution(Status::Failed, Some(FailureInfo::timeout("slow")), 1);
        let (adviser_type, _) = advise(&registry, &exhausted, &node).unwrap().unwrap();
        assert_eq!(adviser_type, AdviserType::Ignore);
    }

    #[test]
    fn test_no_adviser_applies() {
        let registry = default_advisers().unwrap();
        let node = with_advisers(vec![AdviserObtainment::new(
            AdviserType::Retry,
            Payload::empty(),
        )]);
        let succeeded = node_execution(Status::Succeeded, None, 0);
        assert!(advise(&registry, &succeeded, &node).unwrap().is_none());
    }

    #[test]
    fn test_unregistered_adviser_is_configuration_error() {
        let registry = AdviserRegistry::new("adviser");
        let node = with_advisers(vec![AdviserObtainment::new(
            AdviserType::NextStage,
            Payload::empty(),
        )]);
        let err = advise(&registry, &node_execution(Status::Succeeded, None, 0), &node).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_repair_responses() {
        assert_eq!(repair_response(RepairActionCode::MarkAsFailure, None), None);
        assert_eq!(
            repair_response(RepairActionCode::MarkAsSuccess, Some("next")),
            Some(AdviserResponse::IgnoreFailure {
                next_node_id: Some("next".into())
            })
        );
        assert_eq!(
            repair_response(RepairActionCode::Abort, None),
            Some(AdviserResponse::EndPlan { is_abort: true })
        );
    }
}
