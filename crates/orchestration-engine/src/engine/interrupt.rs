//! Interrupt handling: abort, pause and resume, manual intervention

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use pipeline_contracts::{FailureInfo, Status};

use super::{plan_node, OrchestrationEngine, WorkItem};
use crate::error::{EngineError, Result};
use crate::events::OrchestrationEvent;
use crate::execution::{ExecutableResponse, NodeExecution};
use crate::interrupts::{Interrupt, InterruptRequest, InterruptType};
use crate::steps::{Step, StepContext, StepInputPackage};

/// How a node held for manual intervention is released
#[derive(Debug, Clone)]
pub(super) enum Resolution {
    /// Run the node again as a new attempt
    Retry,
    /// Let the failure stand; `None` keeps the recorded failure
    MarkFailed(Option<FailureInfo>),
    MarkSuccess,
    Ignore,
}

impl OrchestrationEngine {
    /// Register an interrupt and apply it
    ///
    /// The returned record tells whether it was processed successfully.
    pub async fn register_interrupt(&self, request: InterruptRequest) -> Result<Interrupt> {
        self.plan_executions.require(&request.plan_execution_id)?;
        let interrupt = self.interrupts.register(request)?;
        self.process_interrupt(&interrupt.uuid).await?;
        self.drain(Some(interrupt.plan_execution_id.as_str())).await?;
        self.interrupts
            .get(&interrupt.uuid)?
            .ok_or_else(|| EngineError::not_found("interrupts", &interrupt.uuid))
    }

    pub(super) async fn process_interrupt(&self, uuid: &str) -> Result<()> {
        let Some(interrupt) = self.interrupts.claim(uuid)? else {
            return Ok(());
        };
        let error = match self.apply_interrupt(&interrupt).await {
            Ok(()) => None,
            Err(e) => {
                log::warn!(
                    "{} interrupt '{}' could not be applied: {}",
                    interrupt.interrupt_type,
                    uuid,
                    e
                );
                Some(e.to_string())
            }
        };
        let processed = self.interrupts.complete(uuid, error)?;
        self.publish(OrchestrationEvent::InterruptProcessed {
            plan_execution_id: processed.plan_execution_id,
            interrupt_id: processed.uuid,
            interrupt_type: processed.interrupt_type,
            state: processed.state,
        });
        Ok(())
    }

    async fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<()> {
        let plan_execution_id = interrupt.plan_execution_id.as_str();
        let Some(node_execution_id) = &interrupt.node_execution_id else {
            return match interrupt.interrupt_type {
                InterruptType::Abort => self.abort_plan(plan_execution_id).await,
                InterruptType::Pause => self.pause_plan(plan_execution_id),
                InterruptType::Resume => self.resume_plan(plan_execution_id),
                other => Err(EngineError::invalid(format!(
                    "{} interrupt needs a target node",
                    other
                ))),
            };
        };

        let node = self.node_executions.require(node_execution_id)?;
        if node.plan_execution_id != plan_execution_id {
            return Err(EngineError::invalid(format!(
                "node execution '{}' does not belong to plan execution '{}'",
                node_execution_id, plan_execution_id
            )));
        }
        match interrupt.interrupt_type {
            InterruptType::Abort => {
                if node.status.is_final() {
                    Ok(())
                } else {
                    self.abort_tree(&node).await
                }
            }
            InterruptType::Pause => self.pause_node(&node),
            InterruptType::Resume => self.unpause_node(&node),
            InterruptType::Retry => self.resolve_intervention(&node, Resolution::Retry),
            InterruptType::MarkFailed => {
                let failure = interrupt
                    .failure_info
                    .clone()
                    .unwrap_or_else(|| FailureInfo::user_marked("marked failed by user"));
                self.resolve_intervention(&node, Resolution::MarkFailed(Some(failure)))
            }
            InterruptType::MarkSuccess => self.resolve_intervention(&node, Resolution::MarkSuccess),
            InterruptType::Ignore => self.resolve_intervention(&node, Resolution::Ignore),
            InterruptType::CustomFailure => {
                self.fail_node(&node, interrupt.failure_info.clone()).await
            }
        }
    }

    async fn abort_plan(&self, plan_execution_id: &str) -> Result<()> {
        let execution = self.plan_executions.require(plan_execution_id)?;
        if execution.status.is_final() {
            return Ok(());
        }
        log::info!("Aborting plan execution '{}'", plan_execution_id);
        for top in self.node_executions.top_level(plan_execution_id)? {
            if top.status.is_active() {
                self.abort_tree(&top).await?;
            }
        }
        self.conclude_plan(plan_execution_id, Status::Aborted)
    }

    fn pause_plan(&self, plan_execution_id: &str) -> Result<()> {
        let execution = self
            .plan_executions
            .update_status(plan_execution_id, &[Status::Running], Status::Paused)
            .map_err(|e| match e {
                EngineError::StaleState { .. } => EngineError::invalid(format!(
                    "plan execution '{}' is not running",
                    plan_execution_id
                )),
                other => other,
            })?;
        self.publish(OrchestrationEvent::PlanStatusChanged {
            plan_execution_id: execution.uuid,
            plan_id: execution.plan_id,
            status: Status::Paused,
        });
        Ok(())
    }

    /// Paused -> Running and pick up the nodes that queued up meanwhile
    fn resume_plan(&self, plan_execution_id: &str) -> Result<()> {
        let execution = self
            .plan_executions
            .update_status(plan_execution_id, &[Status::Paused], Status::Running)
            .map_err(|e| match e {
                EngineError::StaleState { .. } => EngineError::invalid(format!(
                    "plan execution '{}' is not paused",
                    plan_execution_id
                )),
                other => other,
            })?;
        self.publish(OrchestrationEvent::PlanStatusChanged {
            plan_execution_id: execution.uuid,
            plan_id: execution.plan_id,
            status: Status::Running,
        });
        for node in self.node_executions.find_by_plan_execution(plan_execution_id)? {
            if node.status == Status::Queued {
                self.requeue_queued(&node)?;
            }
        }
        Ok(())
    }

    fn pause_node(&self, node: &NodeExecution) -> Result<()> {
        let from = node.status;
        if !matches!(from, Status::Queued | Status::Running | Status::Waiting) {
            return Err(EngineError::invalid(format!(
                "cannot pause node execution '{}' in {}",
                node.uuid, from
            )));
        }
        self.node_executions
            .update_status(&node.uuid, &[from], Status::Paused, |n| {
                n.paused_from = Some(from)
            })?;
        log::info!("Paused '{}'", node.identifier);
        Ok(())
    }

    /// Restore the status a node was paused from and replay what arrived
    /// while it was paused
    fn unpause_node(&self, node: &NodeExecution) -> Result<()> {
        if node.status != Status::Paused {
            return Err(EngineError::invalid(format!(
                "node execution '{}' is {}, not paused",
                node.uuid, node.status
            )));
        }
        let to = node.paused_from.unwrap_or(Status::Queued);
        let resumed = self
            .node_executions
            .update_status(&node.uuid, &[Status::Paused], to, |n| {
                n.paused_from = None;
                n.pending_response = None;
                n.pending_resume = None;
            })?;
        log::info!("Resumed '{}' as {}", node.identifier, to);

        if to == Status::Queued {
            self.requeue_queued(&resumed)?;
        } else if let Some(response) = node.pending_response.clone() {
            self.apply_step_response(&node.uuid, response)?;
        } else if let Some(responses) = node.pending_resume.clone() {
            self.enqueue(
                &node.plan_execution_id,
                WorkItem::Resume {
                    node_execution_id: node.uuid.clone(),
                    responses,
                },
            );
        } else {
            self.enqueue(&node.plan_execution_id, WorkItem::TopUp(node.uuid.clone()));
        }
        Ok(())
    }

    /// Release a node held in INTERVENTION_WAITING
    pub(super) fn resolve_intervention(
        &self,
        node: &NodeExecution,
        resolution: Resolution,
    ) -> Result<()> {
        if node.status != Status::InterventionWaiting {
            return Err(EngineError::invalid(format!(
                "node execution '{}' is {}, not waiting for intervention",
                node.uuid, node.status
            )));
        }
        self.timers
            .cancel_for_node(&node.plan_execution_id, &node.uuid)?;
        log::info!("Resolving intervention on '{}': {:?}", node.identifier, resolution);

        let id = node.uuid.as_str();
        let held = &[Status::InterventionWaiting];
        match resolution {
            Resolution::Retry => {
                let failed_as = node
                    .intervention_from
                    .filter(|s| s.is_broken())
                    .unwrap_or(Status::Failed);
                self.node_executions
                    .update_status(id, held, failed_as, |_| {})?;
                let plan = self.plan(&node.ambiance.plan_id)?;
                self.retry(node, &plan, Duration::ZERO, node.retry_index() + 1)
            }
            Resolution::MarkFailed(failure) => {
                self.node_executions
                    .update_status(id, held, Status::Failed, |n| match &failure {
                        Some(failure) => n.failure_info = Some(failure.clone()),
                        None => {
                            if n.failure_info.is_none() {
                                n.failure_info =
                                    Some(FailureInfo::user_marked("marked failed"));
                            }
                        }
                    })?;
                self.enqueue(&node.plan_execution_id, WorkItem::End(id.to_string()));
                Ok(())
            }
            Resolution::MarkSuccess => {
                self.node_executions
                    .update_status(id, held, Status::Succeeded, |n| {
                        n.failure_info = None;
                        n.adviser_response = None;
                    })?;
                self.enqueue(&node.plan_execution_id, WorkItem::Conclude(id.to_string()));
                Ok(())
            }
            Resolution::Ignore => {
                self.node_executions
                    .update_status(id, held, Status::IgnoreFailed, |n| {
                        n.adviser_response = None
                    })?;
                self.enqueue(&node.plan_execution_id, WorkItem::Conclude(id.to_string()));
                Ok(())
            }
        }
    }

    /// Fail an in-flight node with caller-given failure info
    async fn fail_node(&self, node: &NodeExecution, failure: Option<FailureInfo>) -> Result<()> {
        if !Status::IN_FLIGHT.contains(&node.status) {
            return Err(EngineError::invalid(format!(
                "node execution '{}' is {}, not running",
                node.uuid, node.status
            )));
        }
        self.abort_descendants(node).await?;
        self.stop_outstanding_work(node).await?;
        let failure = failure.unwrap_or_else(|| FailureInfo::user_marked("failed by user"));
        self.node_executions
            .update_status(&node.uuid, Status::IN_FLIGHT, Status::Failed, |n| {
                n.failure_info = Some(failure.clone())
            })?;
        self.enqueue(&node.plan_execution_id, WorkItem::Conclude(node.uuid.clone()));
        Ok(())
    }

    /// Abort a node and every active descendant, leaves first
    pub(super) async fn abort_tree(&self, node: &NodeExecution) -> Result<()> {
        let current = self.node_executions.require(&node.uuid)?;
        if current.status.is_final() {
            return Ok(());
        }
        if matches!(
            current.status,
            Status::Queued | Status::Running | Status::Waiting | Status::Paused
        ) {
            match self.node_executions.update_status(
                &current.uuid,
                &[current.status],
                Status::Discontinuing,
                |_| {},
            ) {
                Ok(_) => {}
                Err(e) if e.is_stale() => {}
                Err(e) => return Err(e),
            }
        }
        self.abort_descendants(&current).await?;
        if self.discontinue(&current.uuid, Status::Aborted, None).await? {
            log::info!("Aborted '{}'", current.identifier);
        }
        self.enqueue(&current.plan_execution_id, WorkItem::Conclude(current.uuid));
        Ok(())
    }

    pub(super) async fn abort_descendants(&self, node: &NodeExecution) -> Result<()> {
        let mut descendants = self.node_executions.descendants(node)?;
        descendants.reverse();
        for descendant in descendants {
            if descendant.status.is_active()
                && self
                    .discontinue(&descendant.uuid, Status::Aborted, None)
                    .await?
            {
                self.enqueue(&descendant.plan_execution_id, WorkItem::Conclude(descendant.uuid));
            }
        }
        Ok(())
    }

    /// Stop a node's work and move it to `to`
    ///
    /// Returns `false` when the node was already terminal.
    pub(super) async fn discontinue(
        &self,
        id: &str,
        to: Status,
        failure: Option<FailureInfo>,
    ) -> Result<bool> {
        let node = self.node_executions.require(id)?;
        if node.status.is_final() {
            return Ok(false);
        }
        self.stop_outstanding_work(&node).await?;

        let mut from = node.status;
        if to == Status::Aborted
            && !matches!(from, Status::Discontinuing | Status::InterventionWaiting)
        {
            self.node_executions
                .update_status(id, &[from], Status::Discontinuing, |_| {})?;
            from = Status::Discontinuing;
        }
        self.node_executions.update_status(id, &[from], to, |n| {
            if let Some(failure) = &failure {
                n.failure_info = Some(failure.clone());
            }
        })?;
        self.services
            .restraints
            .finish_for_release_entity(&node.plan_execution_id, id)?;
        Ok(true)
    }

    /// Cancel a node's waits and timers and tell its external work to stop
    async fn stop_outstanding_work(&self, node: &NodeExecution) -> Result<()> {
        let plan_execution_id = node.plan_execution_id.as_str();
        self.timers.cancel_for_node(plan_execution_id, &node.uuid)?;
        self.services
            .restraints
            .cancel_blocked_for_requester(plan_execution_id, &node.uuid)?;
        let cancelled = self
            .wait_notify
            .cancel_for_node(plan_execution_id, &node.uuid)?;
        if cancelled.is_empty() {
            return Ok(());
        }

        match node.last_executable_response() {
            Some(ExecutableResponse::Task { task_id })
            | Some(ExecutableResponse::TaskChain { task_id, .. }) => {
                if let Err(e) = self.dispatcher.abort(task_id).await {
                    log::warn!("Could not abort task '{}': {}", task_id, e);
                }
            }
            Some(ExecutableResponse::Async { callback_ids, .. }) => {
                let plan = self.plan(&node.ambiance.plan_id)?;
                let plan_node = plan_node(&plan, &node.node_id)?;
                let step = self.steps.obtain(&plan_node.step_type.type_name)?;
                if let Step::Async(step) = step.as_ref() {
                    let inputs = StepInputPackage::new();
                    let ctx = StepContext {
                        ambiance: &node.ambiance,
                        node: plan_node,
                        node_execution_id: &node.uuid,
                        inputs: &inputs,
                        services: &self.services,
                    };
                    let aborted = AssertUnwindSafe(step.handle_abort(&ctx, callback_ids))
                        .catch_unwind()
                        .await;
                    if aborted.is_err() {
                        log::error!("Abort handler of '{}' panicked", node.identifier);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
