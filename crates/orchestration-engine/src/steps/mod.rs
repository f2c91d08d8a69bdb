//! Step executors: the domain logic a plan node runs
//!
//! A step type is registered once as a [`Step`], which names the one
//! execution mode it implements. The engine drives it through the matching
//! trait:
//!
//! - [`SyncStep`]: runs to completion inside the engine
//! - [`AsyncStep`]: starts external work and is resumed by callbacks
//! - [`TaskStep`] / [`TaskChainStep`]: hands work to the remote worker pool
//! - [`ChildStep`] / [`ChildrenStep`]: activates other plan nodes as
//!   children and folds their terminal statuses
//!
//! Steps report domain failures as [`StepError`]; the engine turns them
//! into a `FailureInfo` on the node so that advisers can act on them.

pub mod builtin;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_contracts::{
    Ambiance, ContractError, ExecutionMode, FailureInfo, Payload, PayloadType, PlanNode, RefKind,
    ResponseData, ResponseDataMap, Status, TaskResponse,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::barrier::BarrierService;
use crate::dispatch::TaskRequest;
use crate::error::EngineError;
use crate::outputs::OutputService;
use crate::registry::Registry;
use crate::restraint::ResourceRestraintService;

pub use builtin::{
    register_builtin_steps, BarrierStep, BarrierStepParameters, ChildChainParameters,
    ChildChainStep, ForkParameters, ForkStep, ResourceRestraintStep, RestraintStepParameters,
    BARRIER_STEP, CHILD_CHAIN_STEP, FORK_STEP, RESOURCE_RESTRAINT_STEP,
};

/// Result type for step executors
pub type StepResult<T> = std::result::Result<T, StepError>;

/// Why a step could not produce a response
#[derive(Debug, Error)]
pub enum StepError {
    /// A classified domain failure
    #[error("{0}")]
    Failure(FailureInfo),

    #[error("Invalid step parameters: {0}")]
    Parameters(#[from] ContractError),

    /// A resolved input the step requires is absent
    #[error("Missing input '{0}'")]
    MissingInput(String),

    /// A callback delivered data of the wrong shape
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl StepError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(FailureInfo::new(message))
    }

    /// The failure recorded on the node execution
    pub fn into_failure_info(self) -> FailureInfo {
        match self {
            Self::Failure(info) => info,
            other => FailureInfo::unexpected(other.to_string()),
        }
    }
}

/// An output or outcome published with a step response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub name: String,
    pub kind: RefKind,
    pub value: Payload,
    /// Level group to publish into instead of the node's own level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Terminal result of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: Vec<StepOutcome>,
}

impl StepResponse {
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outcomes: Vec::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::with_status(Status::Succeeded)
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcomes: Vec::new(),
        }
    }

    pub fn skipped() -> Self {
        Self::with_status(Status::Skipped)
    }

    /// Publish an outcome at the node's own level
    pub fn with_outcome(mut self, name: impl Into<String>, value: Payload) -> Self {
        self.outcomes.push(StepOutcome {
            name: name.into(),
            kind: RefKind::Outcome,
            value,
            group: None,
        });
        self
    }

    /// Publish a sweeping output, optionally into an enclosing group's level
    pub fn with_output(
        mut self,
        name: impl Into<String>,
        value: Payload,
        group: Option<&str>,
    ) -> Self {
        self.outcomes.push(StepOutcome {
            name: name.into(),
            kind: RefKind::SweepingOutput,
            value,
            group: group.map(str::to_string),
        });
        self
    }

    /// Fold the terminal statuses children reported to their parent
    ///
    /// Any ABORTED wins, then ERRORED, FAILED, EXPIRED; otherwise the parent
    /// succeeded. The first broken child's failure is carried up.
    pub fn fold_children(responses: &ResponseDataMap) -> Self {
        let children: Vec<_> = responses
            .values()
            .filter_map(|data| match data {
                ResponseData::StepStatus(status) => Some(status),
                _ => None,
            })
            .collect();
        let status = Status::fold(children.iter().map(|c| c.status));
        let failure_info = children
            .iter()
            .find(|c| c.status == status && c.failure_info.is_some())
            .and_then(|c| c.failure_info.clone())
            .or_else(|| match status {
                Status::Succeeded => None,
                other => Some(FailureInfo::new(format!("a child ended {}", other))),
            });
        Self {
            status,
            failure_info,
            outcomes: Vec::new(),
        }
    }
}

/// Sweeping outputs and outcomes resolved for a node's `ref_objects`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepInputPackage {
    inputs: BTreeMap<String, Payload>,
}

impl StepInputPackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Payload) {
        self.inputs.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Payload> {
        self.inputs.get(name)
    }

    /// Decode a required input
    pub fn value<T: PayloadType>(&self, name: &str) -> StepResult<T> {
        let payload = self
            .get(name)
            .ok_or_else(|| StepError::MissingInput(name.to_string()))?;
        Ok(payload.decode()?)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Engine services a step may call into
#[derive(Clone)]
pub struct StepServices {
    pub outputs: Arc<OutputService>,
    pub barriers: Arc<BarrierService>,
    pub restraints: Arc<ResourceRestraintService>,
}

/// Everything a step sees of the activation it runs for
pub struct StepContext<'a> {
    pub ambiance: &'a Ambiance,
    pub node: &'a PlanNode,
    pub node_execution_id: &'a str,
    pub inputs: &'a StepInputPackage,
    pub services: &'a StepServices,
}

impl StepContext<'_> {
    /// Decode the node's step parameters, defaulting when none were given
    pub fn parameters<T: PayloadType + Default>(&self) -> StepResult<T> {
        Ok(self.node.step_parameters.decode_or_default()?)
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }
}

#[async_trait]
pub trait SyncStep: Send + Sync {
    async fn execute_sync(&self, ctx: &StepContext<'_>) -> StepResult<StepResponse>;
}

/// What an async step is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncExecutable {
    pub callback_ids: Vec<String>,
    /// RUNNING or WAITING while suspended
    pub status: Status,
    pub timeout: Option<Duration>,
}

impl AsyncExecutable {
    pub fn running(callback_ids: Vec<String>) -> Self {
        Self {
            callback_ids,
            status: Status::Running,
            timeout: None,
        }
    }

    pub fn waiting(callback_ids: Vec<String>) -> Self {
        Self {
            callback_ids,
            status: Status::Waiting,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
pub trait AsyncStep: Send + Sync {
    async fn execute_async(&self, ctx: &StepContext<'_>) -> StepResult<AsyncExecutable>;

    /// Called once every callback has been notified
    async fn handle_async_response(
        &self,
        ctx: &StepContext<'_>,
        responses: &ResponseDataMap,
    ) -> StepResult<StepResponse>;

    /// The node was aborted or expired while suspended
    async fn handle_abort(&self, _ctx: &StepContext<'_>, _callback_ids: &[String]) {}
}

#[async_trait]
pub trait TaskStep: Send + Sync {
    async fn obtain_task(&self, ctx: &StepContext<'_>) -> StepResult<TaskRequest>;

    async fn handle_task_result(
        &self,
        _ctx: &StepContext<'_>,
        response: &TaskResponse,
    ) -> StepResult<StepResponse> {
        Ok(task_response_to_step(response))
    }
}

/// Default mapping of a task result onto a step result
pub fn task_response_to_step(response: &TaskResponse) -> StepResponse {
    use pipeline_contracts::TaskStatus;
    match response.status {
        TaskStatus::Success => StepResponse::succeeded(),
        TaskStatus::Failure => StepResponse::failed(FailureInfo::new(
            response
                .error_message
                .clone()
                .unwrap_or_else(|| "task failed".to_string()),
        )),
        TaskStatus::Expired => StepResponse::failed(FailureInfo::timeout("task expired")),
    }
}

/// A task to run plus the state handed to the next link
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub task: TaskRequest,
    pub pass_through: Payload,
}

/// What follows a completed chain link
#[derive(Debug, Clone, PartialEq)]
pub enum ChainProgress {
    Next(ChainLink),
    Finalize,
}

#[async_trait]
pub trait TaskChainStep: Send + Sync {
    async fn start_chain_link(&self, ctx: &StepContext<'_>) -> StepResult<ChainLink>;

    /// Decide after link `link_index` completed with `response`
    async fn execute_next_link(
        &self,
        ctx: &StepContext<'_>,
        pass_through: &Payload,
        link_index: u32,
        response: &TaskResponse,
    ) -> StepResult<ChainProgress>;

    async fn finalize_execution(
        &self,
        ctx: &StepContext<'_>,
        pass_through: &Payload,
        response: &TaskResponse,
    ) -> StepResult<StepResponse>;
}

#[async_trait]
pub trait ChildStep: Send + Sync {
    /// Plan node to activate as the single child
    async fn obtain_child(&self, ctx: &StepContext<'_>) -> StepResult<String>;

    async fn handle_child_response(
        &self,
        _ctx: &StepContext<'_>,
        responses: &ResponseDataMap,
    ) -> StepResult<StepResponse> {
        Ok(StepResponse::fold_children(responses))
    }
}

/// Children to activate and how many may run at once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildrenSpec {
    pub child_node_ids: Vec<String>,
    pub max_concurrency: Option<u32>,
}

#[async_trait]
pub trait ChildrenStep: Send + Sync {
    async fn obtain_children(&self, ctx: &StepContext<'_>) -> StepResult<ChildrenSpec>;

    async fn handle_children_response(
        &self,
        _ctx: &StepContext<'_>,
        responses: &ResponseDataMap,
    ) -> StepResult<StepResponse> {
        Ok(StepResponse::fold_children(responses))
    }
}

/// A registered step implementation
#[derive(Clone)]
pub enum Step {
    Sync(Arc<dyn SyncStep>),
    Async(Arc<dyn AsyncStep>),
    Task(Arc<dyn TaskStep>),
    TaskChain(Arc<dyn TaskChainStep>),
    Child(Arc<dyn ChildStep>),
    Children(Arc<dyn ChildrenStep>),
}

impl Step {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Step::Sync(_) => ExecutionMode::Sync,
            Step::Async(_) => ExecutionMode::Async,
            Step::Task(_) => ExecutionMode::Task,
            Step::TaskChain(_) => ExecutionMode::TaskChain,
            Step::Child(_) => ExecutionMode::Child,
            Step::Children(_) => ExecutionMode::Children,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Step({})", self.mode())
    }
}

/// Step implementations keyed by step type name
pub type StepRegistry = Registry<String, Step>;
