//! Steps the engine ships with
//!
//! Containers ([`ChildChainStep`], [`ForkStep`]) activate other plan nodes;
//! gates ([`BarrierStep`], [`ResourceRestraintStep`]) suspend their node in
//! WAITING until the barrier resolves or a restraint slot is granted. Both
//! gates wait under the node execution's own id as callback id, so a gate
//! that is already open resumes the node through the same path as one that
//! opens later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_contracts::{
    BarrierPositionType, FailureInfo, PayloadType, ResponseData, ResponseDataMap, StepCategory,
};
use serde::{Deserialize, Serialize};

use super::{
    AsyncExecutable, AsyncStep, ChildStep, ChildrenSpec, ChildrenStep, Step, StepContext,
    StepError, StepRegistry, StepResponse, StepResult,
};
use crate::barrier::Arrival;
use crate::error::Result;
use crate::restraint::{AcquireRequest, HoldingScope};

pub const CHILD_CHAIN_STEP: &str = "CHILD_CHAIN";
pub const FORK_STEP: &str = "FORK";
pub const BARRIER_STEP: &str = "BARRIER";
pub const RESOURCE_RESTRAINT_STEP: &str = "RESOURCE_RESTRAINT";

/// Register the built-in steps under their type names
pub fn register_builtin_steps(registry: &mut StepRegistry) -> Result<()> {
    registry.register(
        CHILD_CHAIN_STEP.to_string(),
        Arc::new(Step::Child(Arc::new(ChildChainStep))),
    )?;
    registry.register(
        FORK_STEP.to_string(),
        Arc::new(Step::Children(Arc::new(ForkStep))),
    )?;
    registry.register(
        BARRIER_STEP.to_string(),
        Arc::new(Step::Async(Arc::new(BarrierStep))),
    )?;
    registry.register(
        RESOURCE_RESTRAINT_STEP.to_string(),
        Arc::new(Step::Async(Arc::new(ResourceRestraintStep))),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildChainParameters {
    pub child_node_id: String,
}

impl PayloadType for ChildChainParameters {
    const KIND: &'static str = "child-chain";
}

/// Runs one child chain (a stage's or step group's first node)
pub struct ChildChainStep;

#[async_trait]
impl ChildStep for ChildChainStep {
    async fn obtain_child(&self, ctx: &StepContext<'_>) -> StepResult<String> {
        let params: ChildChainParameters = ctx.parameters()?;
        if params.child_node_id.is_empty() {
            return Err(StepError::failure(format!(
                "{} has no child node",
                ctx.node.identifier
            )));
        }
        Ok(params.child_node_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkParameters {
    pub child_node_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

impl PayloadType for ForkParameters {
    const KIND: &'static str = "fork";
}

/// Runs several child chains side by side
pub struct ForkStep;

#[async_trait]
impl ChildrenStep for ForkStep {
    async fn obtain_children(&self, ctx: &StepContext<'_>) -> StepResult<ChildrenSpec> {
        let params: ForkParameters = ctx.parameters()?;
        if params.max_concurrency == Some(0) {
            return Err(StepError::failure("max concurrency must be at least 1"));
        }
        Ok(ChildrenSpec {
            child_node_ids: params.child_node_ids,
            max_concurrency: params.max_concurrency,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierStepParameters {
    pub barrier_identifier: String,
    /// Overrides the configured barrier timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl PayloadType for BarrierStepParameters {
    const KIND: &'static str = "barrier-step";
}

fn position_type(category: StepCategory) -> BarrierPositionType {
    match category {
        StepCategory::Stage => BarrierPositionType::Stage,
        StepCategory::StepGroup => BarrierPositionType::StepGroup,
        _ => BarrierPositionType::Step,
    }
}

/// Arrives at a declared barrier and waits for it to go down
pub struct BarrierStep;

#[async_trait]
impl AsyncStep for BarrierStep {
    async fn execute_async(&self, ctx: &StepContext<'_>) -> StepResult<AsyncExecutable> {
        let params: BarrierStepParameters = ctx.parameters()?;
        ctx.services.barriers.arrive(Arrival {
            plan_execution_id: ctx.plan_execution_id(),
            identifier: &params.barrier_identifier,
            position_type: position_type(ctx.node.step_type.category),
            setup_id: &ctx.node.uuid,
            execution_id: ctx.node_execution_id,
            callback_id: ctx.node_execution_id,
            timeout: params.timeout,
        })?;
        Ok(AsyncExecutable::waiting(vec![ctx.node_execution_id.to_string()]))
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext<'_>,
        responses: &ResponseDataMap,
    ) -> StepResult<StepResponse> {
        let barrier = responses
            .values()
            .find_map(|data| match data {
                ResponseData::Barrier(barrier) => Some(barrier),
                _ => None,
            })
            .ok_or_else(|| StepError::UnexpectedResponse("no barrier response".to_string()))?;
        if barrier.timed_out {
            return Ok(StepResponse::failed(FailureInfo::timeout(format!(
                "barrier '{}' did not go down in time",
                barrier.barrier_identifier
            ))));
        }
        Ok(StepResponse::succeeded())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestraintStepParameters {
    pub resource_unit: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub holding_scope: HoldingScope,
}

fn default_capacity() -> u32 {
    1
}

impl Default for RestraintStepParameters {
    fn default() -> Self {
        Self {
            resource_unit: String::new(),
            capacity: default_capacity(),
            holding_scope: HoldingScope::default(),
        }
    }
}

impl PayloadType for RestraintStepParameters {
    const KIND: &'static str = "resource-restraint-step";
}

/// Takes a slot of a resource unit, waiting in line when all are held
///
/// The slot is given back when the holding scope ends: the plan run, or
/// the enclosing stage (the plan run when there is no stage).
pub struct ResourceRestraintStep;

#[async_trait]
impl AsyncStep for ResourceRestraintStep {
    async fn execute_async(&self, ctx: &StepContext<'_>) -> StepResult<AsyncExecutable> {
        let params: RestraintStepParameters = ctx.parameters()?;
        if params.resource_unit.is_empty() {
            return Err(StepError::failure("resource unit is required"));
        }
        let release_entity_id = match params.holding_scope {
            HoldingScope::Plan => ctx.plan_execution_id(),
            HoldingScope::Stage => ctx
                .ambiance
                .stage_runtime_id()
                .unwrap_or(ctx.plan_execution_id()),
        };
        ctx.services.restraints.acquire(AcquireRequest {
            resource_unit: params.resource_unit,
            capacity: params.capacity,
            plan_execution_id: ctx.plan_execution_id().to_string(),
            requester_id: ctx.node_execution_id.to_string(),
            release_entity_id: release_entity_id.to_string(),
            callback_id: Some(ctx.node_execution_id.to_string()),
        })?;
        Ok(AsyncExecutable::waiting(vec![ctx.node_execution_id.to_string()]))
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext<'_>,
        responses: &ResponseDataMap,
    ) -> StepResult<StepResponse> {
        let granted = responses
            .values()
            .any(|data| matches!(data, ResponseData::Restraint(_)));
        if !granted {
            return Err(StepError::UnexpectedResponse(
                "no resource restraint grant".to_string(),
            ));
        }
        Ok(StepResponse::succeeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_contracts::{BarrierResponseData, FailureType, Payload};

    #[test]
    fn test_register_builtin_steps_once() {
        let mut registry = StepRegistry::new("step");
        register_builtin_steps(&mut registry).unwrap();
        assert_eq!(registry.len(), 4);
        assert!(register_builtin_steps(&mut registry).is_err());
    }

    #[test]
    fn test_restraint_parameters_default_capacity() {
        let params: RestraintStepParameters = Payload::from_json(
            RestraintStepParameters::KIND,
            &serde_json::json!({ "resourceUnit": "deploy-slot" }),
        )
        .unwrap()
        .decode()
        .unwrap();
        assert_eq!(params.capacity, 1);
        assert_eq!(params.holding_scope, HoldingScope::Plan);
    }

    #[tokio::test]
    async fn test_barrier_timeout_fails_with_timeout_type() {
        use crate::persistence::Stores;
        use crate::steps::{StepInputPackage, StepServices};
        use pipeline_contracts::{Ambiance, PlanBuilder, StepType};

        let stores = Stores::in_memory();
        let wait_notify = Arc::new(crate::wait_notify::WaitNotifyService::new(&stores, 4));
        let timers = Arc::new(crate::timers::TimerService::new(stores.timers.clone(), 4));
        let services = StepServices {
            outputs: Arc::new(crate::outputs::OutputService::new(stores.outputs.clone(), 1024)),
            barriers: Arc::new(crate::barrier::BarrierService::new(
                stores.barriers.clone(),
                wait_notify.clone(),
                timers,
                Duration::from_secs(60),
                4,
            )),
            restraints: Arc::new(crate::restraint::ResourceRestraintService::new(
                stores.restraint_units.clone(),
                stores.restraint_instances.clone(),
                wait_notify,
                4,
            )),
        };
        let plan = PlanBuilder::new("p")
            .add_node("gate", "gate", StepType::step(BARRIER_STEP))
            .build();
        let ambiance = Ambiance::new("exec", "p");
        let inputs = StepInputPackage::new();
        let ctx = StepContext {
            ambiance: &ambiance,
            node: plan.node("gate").unwrap(),
            node_execution_id: "ne-1",
            inputs: &inputs,
            services: &services,
        };

        let responses: ResponseDataMap = [(
            "ne-1".to_string(),
            ResponseData::Barrier(BarrierResponseData {
                barrier_identifier: "sync".into(),
                timed_out: true,
            }),
        )]
        .into_iter()
        .collect();
        let response = BarrierStep.handle_async_response(&ctx, &responses).await.unwrap();
        assert_eq!(response.status, pipeline_contracts::Status::Failed);
        assert!(response
            .failure_info
            .unwrap()
            .failure_types
            .contains(&FailureType::Timeout));
    }
}
