//! Starting, executing and resuming node executions

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use pipeline_contracts::{
    generate_uuid, Ambiance, FailureInfo, FailureType, Level, Payload, Plan, PlanNode,
    ResponseData, ResponseDataMap, Status, TaskResponse,
};

use super::{plan_node, OrchestrationEngine, WorkItem};
use crate::dispatch::{TaskRequest, TaskSubmission};
use crate::error::{EngineError, Result};
use crate::execution::{ChildSpawn, ExecutableResponse, NodeExecution};
use crate::facilitation::FacilitatorResponse;
use crate::steps::{
    AsyncExecutable, ChainProgress, ChildrenSpec, Step, StepContext, StepInputPackage,
    StepOutcome, StepResponse, StepResult, BARRIER_STEP, RESOURCE_RESTRAINT_STEP,
};
use crate::timers::TimerAction;
use crate::wait_notify::WaitKind;

/// Statuses a step may report as its result
const RESULT_STATUSES: &[Status] = &[
    Status::Succeeded,
    Status::Failed,
    Status::Errored,
    Status::Expired,
    Status::Skipped,
];

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a step call; a step error or panic becomes the terminal response
async fn guarded<T, F>(call: F) -> std::result::Result<T, StepResponse>
where
    F: Future<Output = StepResult<T>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StepResponse::failed(e.into_failure_info())),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            log::error!("Step executor panicked: {}", message);
            Err(StepResponse {
                status: Status::Errored,
                failure_info: Some(FailureInfo::unexpected(format!(
                    "step panicked: {}",
                    message
                ))),
                outcomes: Vec::new(),
            })
        }
    }
}

fn task_response(responses: &ResponseDataMap) -> Result<&TaskResponse> {
    responses
        .values()
        .find_map(|data| match data {
            ResponseData::Task(response) => Some(response),
            _ => None,
        })
        .ok_or_else(|| EngineError::invalid("resumed without a task response"))
}

fn wait_kind(step_type: &str) -> WaitKind {
    match step_type {
        BARRIER_STEP => WaitKind::Barrier,
        RESOURCE_RESTRAINT_STEP => WaitKind::Restraint,
        _ => WaitKind::Async,
    }
}

impl OrchestrationEngine {
    /// Skip check and facilitation of a QUEUED node
    pub(super) fn start_node(&self, id: &str) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if node.status != Status::Queued || self.plan_is_paused(&node.plan_execution_id)? {
            return Ok(());
        }
        let plan = self.plan(&node.ambiance.plan_id)?;
        let plan_node = plan_node(&plan, &node.node_id)?;

        if let Some(condition) = &plan_node.skip_condition {
            if self
                .skip_conditions
                .evaluate(&node.ambiance, &condition.expression)?
            {
                log::info!(
                    "Skipping '{}': condition '{}' holds",
                    node.identifier,
                    condition.expression
                );
                let reason = format!("skip condition '{}' is true", condition.expression);
                match self.node_executions.update_status(
                    id,
                    &[Status::Queued],
                    Status::Skipped,
                    |n| {
                        n.executable_responses.push(ExecutableResponse::Skip {
                            reason: reason.clone(),
                        })
                    },
                ) {
                    Ok(_) => self.enqueue(&node.plan_execution_id, WorkItem::Conclude(id.to_string())),
                    Err(e) if e.is_stale() => {}
                    Err(e) => return Err(e),
                }
                return Ok(());
            }
        }

        let inputs = self.resolve_inputs(&node.ambiance, plan_node)?;
        let facilitated = self.facilitate(&node.ambiance, plan_node, &inputs)?;
        self.node_executions
            .update(id, |n| n.mode = Some(facilitated.mode))?;

        if facilitated.initial_wait.is_zero() {
            self.enqueue(&node.plan_execution_id, WorkItem::Execute(id.to_string()));
        } else {
            log::debug!(
                "Delaying '{}' by {:?} before execution",
                node.identifier,
                facilitated.initial_wait
            );
            self.timers.schedule_after(
                &node.plan_execution_id,
                facilitated.initial_wait,
                TimerAction::ExecuteNode {
                    node_execution_id: id.to_string(),
                },
            )?;
        }
        Ok(())
    }

    /// The first obtainment that responds picks the mode; without
    /// obtainments the step runs in its own mode right away
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        plan_node: &PlanNode,
        inputs: &StepInputPackage,
    ) -> Result<FacilitatorResponse> {
        for obtainment in &plan_node.facilitator_obtainments {
            let facilitator = self.facilitators.obtain(&obtainment.facilitator_type)?;
            if let Some(response) = facilitator.facilitate(
                ambiance,
                &plan_node.step_parameters,
                &obtainment.parameters,
                inputs,
            )? {
                return Ok(response);
            }
        }
        let step = self.steps.obtain(&plan_node.step_type.type_name)?;
        Ok(FacilitatorResponse {
            mode: step.mode(),
            initial_wait: Duration::ZERO,
        })
    }

    /// Resolve the node's `ref_objects`; unresolved references are left out
    fn resolve_inputs(&self, ambiance: &Ambiance, plan_node: &PlanNode) -> Result<StepInputPackage> {
        let mut inputs = StepInputPackage::new();
        for reference in &plan_node.ref_objects {
            match self
                .services
                .outputs
                .resolve_optional(reference.kind, ambiance, &reference.name)?
            {
                Some(value) => inputs.insert(reference.name.clone(), value),
                None => log::debug!(
                    "Input '{}' of '{}' is not available",
                    reference.name,
                    plan_node.identifier
                ),
            }
        }
        Ok(inputs)
    }

    /// QUEUED -> RUNNING and invoke the step in its facilitated mode
    pub(super) async fn execute_node(&self, id: &str) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if node.status != Status::Queued || self.plan_is_paused(&node.plan_execution_id)? {
            return Ok(());
        }
        let plan = self.plan(&node.ambiance.plan_id)?;
        let plan_node = plan_node(&plan, &node.node_id)?;
        let step = self.steps.obtain(&plan_node.step_type.type_name)?;
        let mode = node.mode.unwrap_or_else(|| step.mode());
        if mode != step.mode() {
            return Err(EngineError::invalid(format!(
                "step '{}' runs in {} mode, not {}",
                plan_node.step_type.type_name,
                step.mode(),
                mode
            )));
        }

        match self
            .node_executions
            .update_status(id, &[Status::Queued], Status::Running, |_| {})
        {
            Ok(_) => {}
            Err(e) if e.is_stale() => return Ok(()),
            Err(e) => return Err(e),
        }
        if let Some(timeout) = plan_node.timeout {
            self.schedule_expiry(&node, timeout)?;
        }

        let inputs = self.resolve_inputs(&node.ambiance, plan_node)?;
        let ctx = StepContext {
            ambiance: &node.ambiance,
            node: plan_node,
            node_execution_id: id,
            inputs: &inputs,
            services: &self.services,
        };
        log::debug!("Executing '{}' in {} mode", node.identifier, mode);

        match step.as_ref() {
            Step::Sync(step) => {
                let response = guarded(step.execute_sync(&ctx))
                    .await
                    .unwrap_or_else(|failure| failure);
                self.node_executions
                    .update(id, |n| n.executable_responses.push(ExecutableResponse::Sync))?;
                self.apply_step_response(id, response)
            }
            Step::Async(step) => match guarded(step.execute_async(&ctx)).await {
                Ok(executable) => {
                    self.suspend_async(&node, &plan_node.step_type.type_name, executable)
                }
                Err(failure) => self.apply_step_response(id, failure),
            },
            Step::Task(step) => match guarded(step.obtain_task(&ctx)).await {
                Ok(request) => self.dispatch_task(&node, request, None).await,
                Err(failure) => self.apply_step_response(id, failure),
            },
            Step::TaskChain(step) => match guarded(step.start_chain_link(&ctx)).await {
                Ok(link) => {
                    self.dispatch_task(&node, link.task, Some((0, link.pass_through)))
                        .await
                }
                Err(failure) => self.apply_step_response(id, failure),
            },
            Step::Child(step) => match guarded(step.obtain_child(&ctx)).await {
                Ok(child_node_id) => self.spawn_child(&node, &plan, child_node_id),
                Err(failure) => self.apply_step_response(id, failure),
            },
            Step::Children(step) => match guarded(step.obtain_children(&ctx)).await {
                Ok(spec) => self.spawn_children(&node, &plan, spec),
                Err(failure) => self.apply_step_response(id, failure),
            },
        }
    }

    fn schedule_expiry(&self, node: &NodeExecution, timeout: Duration) -> Result<()> {
        self.timers.schedule_after(
            &node.plan_execution_id,
            timeout,
            TimerAction::ExpireNode {
                node_execution_id: node.uuid.clone(),
            },
        )?;
        Ok(())
    }

    fn suspend_async(
        &self,
        node: &NodeExecution,
        step_type: &str,
        executable: AsyncExecutable,
    ) -> Result<()> {
        if !Status::IN_FLIGHT.contains(&executable.status) {
            return self.apply_step_response(
                &node.uuid,
                StepResponse {
                    status: Status::Errored,
                    failure_info: Some(FailureInfo::unexpected(format!(
                        "async step suspended as {}",
                        executable.status
                    ))),
                    outcomes: Vec::new(),
                },
            );
        }
        let record = ExecutableResponse::Async {
            callback_ids: executable.callback_ids.clone(),
            timeout: executable.timeout,
        };
        if executable.status == Status::Waiting {
            self.node_executions.update_status(
                &node.uuid,
                &[Status::Running],
                Status::Waiting,
                |n| n.executable_responses.push(record.clone()),
            )?;
        } else {
            self.node_executions
                .update(&node.uuid, |n| n.executable_responses.push(record.clone()))?;
        }
        if let Some(timeout) = executable.timeout {
            self.schedule_expiry(node, timeout)?;
        }
        self.wait_notify.wait_for(
            &node.plan_execution_id,
            &node.uuid,
            wait_kind(step_type),
            executable.callback_ids,
            false,
        )?;
        Ok(())
    }

    /// Submit one task (or chain link) and wait on its id
    ///
    /// The deadline covers the whole chain, so only the first link
    /// schedules one.
    async fn dispatch_task(
        &self,
        node: &NodeExecution,
        request: TaskRequest,
        chain: Option<(u32, Payload)>,
    ) -> Result<()> {
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.config.default_task_timeout());
        let task_type = request.task_type.clone();
        let submission = TaskSubmission {
            ambiance: node.ambiance.clone(),
            node_execution_id: node.uuid.clone(),
            request,
        };
        let task_id = match self.dispatcher.submit(submission).await {
            Ok(task_id) => task_id,
            Err(e) => {
                log::warn!(
                    "Could not dispatch {} task for '{}': {}",
                    task_type,
                    node.identifier,
                    e
                );
                let failure =
                    FailureInfo::new(e.to_string()).with_type(FailureType::DelegateProvisioning);
                return self.apply_step_response(&node.uuid, StepResponse::failed(failure));
            }
        };

        let (kind, record, first_link) = match chain {
            None => (
                WaitKind::Task,
                ExecutableResponse::Task {
                    task_id: task_id.clone(),
                },
                true,
            ),
            Some((link_index, pass_through)) => (
                WaitKind::TaskChain,
                ExecutableResponse::TaskChain {
                    task_id: task_id.clone(),
                    link_index,
                    pass_through,
                },
                link_index == 0,
            ),
        };
        self.node_executions
            .update(&node.uuid, |n| n.executable_responses.push(record.clone()))?;
        if first_link {
            self.schedule_expiry(node, timeout)?;
        }
        log::debug!(
            "Dispatched {} task '{}' for '{}'",
            task_type,
            task_id,
            node.identifier
        );
        self.wait_notify
            .wait_for(&node.plan_execution_id, &node.uuid, kind, vec![task_id], false)?;
        Ok(())
    }

    fn spawn_child(&self, node: &NodeExecution, plan: &Plan, child_node_id: String) -> Result<()> {
        plan_node(plan, &child_node_id)?;
        let spawn = ChildSpawn {
            runtime_id: generate_uuid(),
            node_id: child_node_id,
        };
        self.node_executions.update(&node.uuid, |n| {
            n.executable_responses.push(ExecutableResponse::Child {
                child: spawn.clone(),
            })
        })?;
        self.wait_notify.wait_for(
            &node.plan_execution_id,
            &node.uuid,
            WaitKind::Child,
            vec![spawn.runtime_id.clone()],
            false,
        )?;
        self.create_child(node, plan, &spawn)
    }

    /// Spawn children, starting at most `max_concurrency` at once
    fn spawn_children(&self, node: &NodeExecution, plan: &Plan, spec: ChildrenSpec) -> Result<()> {
        if spec.child_node_ids.is_empty() {
            return self.apply_step_response(&node.uuid, StepResponse::succeeded());
        }
        for child_node_id in &spec.child_node_ids {
            plan_node(plan, child_node_id)?;
        }
        let children: Vec<ChildSpawn> = spec
            .child_node_ids
            .into_iter()
            .map(|node_id| ChildSpawn {
                runtime_id: generate_uuid(),
                node_id,
            })
            .collect();
        let max_concurrency = spec.max_concurrency;
        self.node_executions.update(&node.uuid, |n| {
            n.executable_responses.push(ExecutableResponse::Children {
                children: children.clone(),
                max_concurrency,
            })
        })?;
        self.wait_notify.wait_for(
            &node.plan_execution_id,
            &node.uuid,
            WaitKind::Children,
            children.iter().map(|c| c.runtime_id.clone()).collect(),
            max_concurrency.is_some(),
        )?;

        let initial = max_concurrency.map_or(children.len(), |max| {
            (max.max(1) as usize).min(children.len())
        });
        for spawn in &children[..initial] {
            self.create_child(node, plan, spawn)?;
        }
        Ok(())
    }

    /// Create the first node execution of a child chain
    ///
    /// The chain reports its terminal status under the spawn's runtime id.
    fn create_child(&self, parent: &NodeExecution, plan: &Plan, spawn: &ChildSpawn) -> Result<()> {
        let child_node = plan_node(plan, &spawn.node_id)?;
        let uuid = generate_uuid();
        let child = NodeExecution::queued(
            &uuid,
            child_node,
            parent
                .ambiance
                .clone_for_child(Level::for_node(child_node, &uuid, 0)),
        )
        .with_parent(Some(parent.uuid.clone()))
        .with_notify(Some(spawn.runtime_id.clone()));
        self.node_executions.create(&child)?;
        self.enqueue(&parent.plan_execution_id, WorkItem::Start(uuid));
        Ok(())
    }

    /// Start pending children of a concurrency-limited fork as slots free up
    pub(super) fn top_up_children(&self, id: &str) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if !Status::IN_FLIGHT.contains(&node.status) {
            return Ok(());
        }
        let Some(ExecutableResponse::Children {
            children,
            max_concurrency: Some(max),
        }) = node.last_executable_response()
        else {
            return Ok(());
        };

        let started = self.node_executions.children(&node)?;
        let mut open = 0;
        let mut pending = Vec::new();
        for spawn in children {
            let is_started = started
                .iter()
                .any(|c| c.notify_id.as_deref() == Some(spawn.runtime_id.as_str()));
            if !is_started {
                pending.push(spawn);
            } else if self.wait_notify.response(&spawn.runtime_id)?.is_none() {
                open += 1;
            }
        }
        let free = ((*max).max(1) as usize).saturating_sub(open);
        if free == 0 || pending.is_empty() {
            return Ok(());
        }
        let plan = self.plan(&node.ambiance.plan_id)?;
        for spawn in pending.into_iter().take(free) {
            self.create_child(&node, &plan, spawn)?;
        }
        Ok(())
    }

    /// Hand a completed wait back to the step
    pub(super) async fn resume_node(&self, id: &str, responses: ResponseDataMap) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if node.status == Status::Paused {
            self.node_executions
                .update(id, |n| n.pending_resume = Some(responses.clone()))?;
            return Ok(());
        }
        if !Status::IN_FLIGHT.contains(&node.status) {
            log::debug!(
                "Ignoring resumption of node execution '{}' in {}",
                id,
                node.status
            );
            return Ok(());
        }

        let plan = self.plan(&node.ambiance.plan_id)?;
        let plan_node = plan_node(&plan, &node.node_id)?;
        let step = self.steps.obtain(&plan_node.step_type.type_name)?;
        let inputs = self.resolve_inputs(&node.ambiance, plan_node)?;
        let ctx = StepContext {
            ambiance: &node.ambiance,
            node: plan_node,
            node_execution_id: id,
            inputs: &inputs,
            services: &self.services,
        };

        let response = match step.as_ref() {
            Step::Sync(_) => {
                return Err(EngineError::invalid(format!(
                    "sync node execution '{}' cannot be resumed",
                    id
                )))
            }
            Step::Async(step) => guarded(step.handle_async_response(&ctx, &responses))
                .await
                .unwrap_or_else(|failure| failure),
            Step::Task(step) => {
                let task = task_response(&responses)?;
                guarded(step.handle_task_result(&ctx, task))
                    .await
                    .unwrap_or_else(|failure| failure)
            }
            Step::TaskChain(step) => {
                let Some(ExecutableResponse::TaskChain {
                    link_index,
                    pass_through,
                    ..
                }) = node.last_executable_response().cloned()
                else {
                    return Err(EngineError::invalid(format!(
                        "node execution '{}' has no running chain link",
                        id
                    )));
                };
                let task = task_response(&responses)?;
                match guarded(step.execute_next_link(&ctx, &pass_through, link_index, task)).await
                {
                    Ok(ChainProgress::Next(link)) => {
                        let next_index = link_index + 1;
                        if next_index >= self.config.max_task_chain_length {
                            StepResponse::failed(FailureInfo::new(format!(
                                "task chain exceeded {} links",
                                self.config.max_task_chain_length
                            )))
                        } else {
                            return self
                                .dispatch_task(&node, link.task, Some((next_index, link.pass_through)))
                                .await;
                        }
                    }
                    Ok(ChainProgress::Finalize) => {
                        guarded(step.finalize_execution(&ctx, &pass_through, task))
                            .await
                            .unwrap_or_else(|failure| failure)
                    }
                    Err(failure) => failure,
                }
            }
            Step::Child(step) => guarded(step.handle_child_response(&ctx, &responses))
                .await
                .unwrap_or_else(|failure| failure),
            Step::Children(step) => guarded(step.handle_children_response(&ctx, &responses))
                .await
                .unwrap_or_else(|failure| failure),
        };
        self.apply_step_response(id, response)
    }

    /// Publish outcomes and move an in-flight node to the step's result
    ///
    /// A node paused in the meantime keeps the response until it resumes.
    pub(super) fn apply_step_response(&self, id: &str, response: StepResponse) -> Result<()> {
        let response = if RESULT_STATUSES.contains(&response.status) {
            response
        } else {
            StepResponse {
                status: Status::Errored,
                failure_info: Some(FailureInfo::unexpected(format!(
                    "step reported {} as its result",
                    response.status
                ))),
                outcomes: Vec::new(),
            }
        };

        let node = self.node_executions.require(id)?;
        if Status::IN_FLIGHT.contains(&node.status) {
            self.publish_outcomes(&node, &response.outcomes)?;
        }

        let failure_info = response.failure_info.clone();
        match self.node_executions.update_status(
            id,
            Status::IN_FLIGHT,
            response.status,
            |n| n.failure_info = failure_info.clone(),
        ) {
            Ok(_) => {
                self.enqueue(&node.plan_execution_id, WorkItem::Conclude(id.to_string()));
                Ok(())
            }
            Err(e) if e.is_stale() => {
                let current = self.node_executions.require(id)?;
                if current.status == Status::Paused {
                    self.node_executions
                        .update(id, |n| n.pending_response = Some(response.clone()))?;
                } else {
                    log::warn!(
                        "Dropping {} result of node execution '{}', which is already {}",
                        response.status,
                        id,
                        current.status
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn publish_outcomes(&self, node: &NodeExecution, outcomes: &[StepOutcome]) -> Result<()> {
        for outcome in outcomes {
            let stored = self.services.outputs.consume_optional(
                outcome.kind,
                &node.ambiance,
                &outcome.name,
                outcome.value.clone(),
                outcome.group.as_deref(),
            )?;
            if stored.is_none() {
                log::warn!(
                    "'{}' published '{}' more than once; keeping the first value",
                    node.identifier,
                    outcome.name
                );
            }
        }
        Ok(())
    }
}
