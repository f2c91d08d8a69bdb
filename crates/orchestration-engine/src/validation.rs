//! Plan validation
//!
//! Checks a plan against the engine's registries before a run starts, so
//! packaging defects surface as configuration errors instead of mid-run
//! failures.

use std::collections::HashSet;

use pipeline_contracts::{AdviserType, Plan, PlanNode};

use crate::advise::{
    AdviserRegistry, IgnoreAdviserParameters, NextStageParameters, OnFailRollbackParameters,
    RetryAdviserParameters,
};
use crate::facilitation::FacilitatorRegistry;
use crate::steps::{
    BarrierStepParameters, ChildChainParameters, ForkParameters, StepRegistry, BARRIER_STEP,
    CHILD_CHAIN_STEP, FORK_STEP,
};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The starting node is not part of the plan
    MissingStartNode { node_id: String },
    /// A node's step type has no registered implementation
    UnknownStepType { node_id: String, step_type: String },
    UnknownFacilitator {
        node_id: String,
        facilitator_type: String,
    },
    UnknownAdviser {
        node_id: String,
        adviser_type: String,
    },
    /// A facilitator selects a mode the step cannot run in
    ModeMismatch {
        node_id: String,
        step_mode: String,
        facilitator_mode: String,
    },
    /// Parameters reference a node the plan does not contain
    UnknownNodeReference { node_id: String, reference: String },
    /// A barrier step names a barrier the plan does not declare
    UndeclaredBarrier { node_id: String, identifier: String },
    /// Step or adviser parameters that cannot be decoded
    InvalidParameters { node_id: String, reason: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingStartNode { node_id } => {
                write!(f, "Starting node '{}' is not in the plan", node_id)
            }
            Self::UnknownStepType { node_id, step_type } => {
                write!(f, "Unknown step type '{}' for node '{}'", step_type, node_id)
            }
            Self::UnknownFacilitator {
                node_id,
                facilitator_type,
            } => write!(
                f,
                "Unknown facilitator '{}' for node '{}'",
                facilitator_type, node_id
            ),
            Self::UnknownAdviser {
                node_id,
                adviser_type,
            } => write!(f, "Unknown adviser '{}' for node '{}'", adviser_type, node_id),
            Self::ModeMismatch {
                node_id,
                step_mode,
                facilitator_mode,
            } => write!(
                f,
                "Node '{}' runs in {} mode but a facilitator selects {}",
                node_id, step_mode, facilitator_mode
            ),
            Self::UnknownNodeReference { node_id, reference } => {
                write!(f, "Node '{}' references unknown node '{}'", node_id, reference)
            }
            Self::UndeclaredBarrier {
                node_id,
                identifier,
            } => write!(
                f,
                "Node '{}' waits on undeclared barrier '{}'",
                node_id, identifier
            ),
            Self::InvalidParameters { node_id, reason } => {
                write!(f, "Invalid parameters on node '{}': {}", node_id, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a plan against the engine's registries
///
/// Returns all validation errors found (not just the first).
pub fn validate_plan(
    plan: &Plan,
    steps: &StepRegistry,
    facilitators: &FacilitatorRegistry,
    advisers: &AdviserRegistry,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if plan.starting_node().is_none() {
        errors.push(ValidationError::MissingStartNode {
            node_id: plan.starting_node_id.clone(),
        });
    }
    for node in plan.nodes.values() {
        validate_registrations(node, steps, facilitators, advisers, &mut errors);
        validate_node_references(plan, node, &mut errors);
    }
    validate_barriers(plan, &mut errors);

    errors
}

fn validate_registrations(
    node: &PlanNode,
    steps: &StepRegistry,
    facilitators: &FacilitatorRegistry,
    advisers: &AdviserRegistry,
    errors: &mut Vec<ValidationError>,
) {
    let step = steps.obtain(&node.step_type.type_name).ok();
    if step.is_none() {
        errors.push(ValidationError::UnknownStepType {
            node_id: node.uuid.clone(),
            step_type: node.step_type.type_name.clone(),
        });
    }

    for obtainment in &node.facilitator_obtainments {
        if !facilitators.contains(&obtainment.facilitator_type) {
            errors.push(ValidationError::UnknownFacilitator {
                node_id: node.uuid.clone(),
                facilitator_type: obtainment.facilitator_type.to_string(),
            });
        }
        if let Some(step) = &step {
            let facilitator_mode = obtainment.facilitator_type.mode();
            if facilitator_mode != step.mode() {
                errors.push(ValidationError::ModeMismatch {
                    node_id: node.uuid.clone(),
                    step_mode: step.mode().to_string(),
                    facilitator_mode: facilitator_mode.to_string(),
                });
            }
        }
    }

    for obtainment in &node.adviser_obtainments {
        if !advisers.contains(&obtainment.adviser_type) {
            errors.push(ValidationError::UnknownAdviser {
                node_id: node.uuid.clone(),
                adviser_type: obtainment.adviser_type.to_string(),
            });
        }
    }
}

/// Node ids named by built-in adviser and step parameters
fn referenced_nodes(node: &PlanNode) -> Result<Vec<String>, String> {
    let mut references = Vec::new();
    for obtainment in &node.adviser_obtainments {
        let params = &obtainment.parameters;
        match obtainment.adviser_type {
            AdviserType::NextStage => {
                let p: NextStageParameters = params.decode_or_default().map_err(|e| e.to_string())?;
                references.extend(p.next_node_id);
            }
            AdviserType::Ignore => {
                let p: IgnoreAdviserParameters =
                    params.decode_or_default().map_err(|e| e.to_string())?;
                references.extend(p.next_node_id);
            }
            AdviserType::Retry => {
                let p: RetryAdviserParameters =
                    params.decode_or_default().map_err(|e| e.to_string())?;
                references.extend(p.next_node_id);
            }
            AdviserType::OnFailRollback => {
                let p: OnFailRollbackParameters =
                    params.decode_or_default().map_err(|e| e.to_string())?;
                references.extend(p.strategy_to_node.into_values());
            }
            AdviserType::ManualIntervention => {}
        }
    }

    let params = &node.step_parameters;
    match node.step_type.type_name.as_str() {
        CHILD_CHAIN_STEP => {
            let p: ChildChainParameters = params.decode_or_default().map_err(|e| e.to_string())?;
            references.push(p.child_node_id);
        }
        FORK_STEP => {
            let p: ForkParameters = params.decode_or_default().map_err(|e| e.to_string())?;
            references.extend(p.child_node_ids);
        }
        _ => {}
    }
    Ok(references)
}

fn validate_node_references(plan: &Plan, node: &PlanNode, errors: &mut Vec<ValidationError>) {
    match referenced_nodes(node) {
        Ok(references) => {
            for reference in references {
                if plan.node(&reference).is_none() {
                    errors.push(ValidationError::UnknownNodeReference {
                        node_id: node.uuid.clone(),
                        reference,
                    });
                }
            }
        }
        Err(reason) => errors.push(ValidationError::InvalidParameters {
            node_id: node.uuid.clone(),
            reason,
        }),
    }
}

/// Barrier steps name declared barriers; declared positions name plan nodes
fn validate_barriers(plan: &Plan, errors: &mut Vec<ValidationError>) {
    let declared: HashSet<&str> = plan.barriers.iter().map(|b| b.identifier.as_str()).collect();

    for node in plan.nodes.values() {
        if node.step_type.type_name != BARRIER_STEP {
            continue;
        }
        match node.step_parameters.decode_or_default::<BarrierStepParameters>() {
            Ok(params) if !declared.contains(params.barrier_identifier.as_str()) => {
                errors.push(ValidationError::UndeclaredBarrier {
                    node_id: node.uuid.clone(),
                    identifier: params.barrier_identifier,
                });
            }
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidParameters {
                node_id: node.uuid.clone(),
                reason: e.to_string(),
            }),
        }
    }

    for barrier in &plan.barriers {
        for position in &barrier.positions {
            if plan.node(&position.setup_id).is_none() {
                errors.push(ValidationError::UnknownNodeReference {
                    node_id: barrier.identifier.clone(),
                    reference: position.setup_id.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advise::default_advisers;
    use crate::facilitation::default_facilitators;
    use crate::steps::{register_builtin_steps, Step, SyncStep, StepContext, StepResponse, StepResult};
    use async_trait::async_trait;
    use pipeline_contracts::{FacilitatorType, Payload, PlanBuilder, StepType};
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl SyncStep for Noop {
        async fn execute_sync(&self, _ctx: &StepContext<'_>) -> StepResult<StepResponse> {
            Ok(StepResponse::succeeded())
        }
    }

    fn check(plan: &Plan) -> Vec<ValidationError> {
        let mut steps = StepRegistry::new("step");
        register_builtin_steps(&mut steps).unwrap();
        steps
            .register("shell".to_string(), Arc::new(Step::Sync(Arc::new(Noop))))
            .unwrap();
        validate_plan(
            plan,
            &steps,
            &default_facilitators().unwrap(),
            &default_advisers().unwrap(),
        )
    }

    #[test]
    fn test_valid_plan() {
        let plan = PlanBuilder::new("plan")
            .add_node("a", "a", StepType::step("shell"))
            .with_facilitator(FacilitatorType::Sync)
            .with_adviser(
                AdviserType::NextStage,
                Payload::encode(&NextStageParameters {
                    next_node_id: Some("b".into()),
                })
                .unwrap(),
            )
            .add_node("b", "b", StepType::step("shell"))
            .build();
        assert!(check(&plan).is_empty());
    }

    #[test]
    fn test_reports_every_error() {
        let plan = PlanBuilder::new("plan")
            .add_node("a", "a", StepType::step("unknown"))
            .add_node("b", "b", StepType::step("shell"))
            .with_facilitator(FacilitatorType::Task)
            .with_adviser(
                AdviserType::NextStage,
                Payload::encode(&NextStageParameters {
                    next_node_id: Some("missing".into()),
                })
                .unwrap(),
            )
            .build();
        let errors = check(&plan);
        assert_eq!(errors.len(), 3, "{:?}", errors);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownStepType { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::ModeMismatch { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownNodeReference { reference, .. } if reference == "missing")));
    }

    #[test]
    fn test_barrier_must_be_declared() {
        let plan = PlanBuilder::new("plan")
            .add_node("wait", "wait", StepType::step(BARRIER_STEP))
            .with_parameters(
                Payload::encode(&BarrierStepParameters {
                    barrier_identifier: "release".into(),
                    timeout: None,
                })
                .unwrap(),
            )
            .build();
        let errors = check(&plan);
        assert_eq!(
            errors,
            vec![ValidationError::UndeclaredBarrier {
                node_id: "wait".into(),
                identifier: "release".into(),
            }]
        );
    }
}
