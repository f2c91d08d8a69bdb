//! What happens after a node reaches a terminal status
//!
//! Concluding asks the node's advisers for the next control-flow action
//! (advance, retry, roll back, hold for a human, end the plan). Ending a
//! node reports its chain's folded status to whoever waits on it: the
//! parent step, or the plan run itself for top-level chains.

use std::time::Duration;

use pipeline_contracts::{
    generate_uuid, AdviserResponse, FailureInfo, Level, Plan, RepairActionCode, ResponseData,
    Status, StepStatusData,
};

use super::{plan_node, OrchestrationEngine, WorkItem};
use crate::advise::advise;
use crate::error::Result;
use crate::events::OrchestrationEvent;
use crate::execution::NodeExecution;
use crate::timers::TimerAction;

impl OrchestrationEngine {
    pub(super) async fn conclude_node(&self, id: &str) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if !node.status.is_final() || node.adviser_response.is_some() {
            return Ok(());
        }
        self.release_node(&node)?;
        if node.status == Status::Aborted {
            self.enqueue(&node.plan_execution_id, WorkItem::End(node.uuid.clone()));
            return Ok(());
        }

        let plan = self.plan(&node.ambiance.plan_id)?;
        let advice = match advise(&self.advisers, &node, plan_node(&plan, &node.node_id)?)? {
            Some((adviser_type, response)) => {
                log::debug!(
                    "'{}' ended {}; {} adviser chose {:?}",
                    node.identifier,
                    node.status,
                    adviser_type,
                    response
                );
                response
            }
            None => AdviserResponse::NextStep { next_node_id: None },
        };
        if !self.node_executions.record_advice(id, &advice)? {
            return Ok(());
        }
        self.apply_advice(&node, &plan, advice).await
    }

    /// Give back everything the node held while it ran
    fn release_node(&self, node: &NodeExecution) -> Result<()> {
        let plan_execution_id = node.plan_execution_id.as_str();
        self.timers.cancel_for_node(plan_execution_id, &node.uuid)?;
        self.wait_notify
            .cancel_for_node(plan_execution_id, &node.uuid)?;
        self.services
            .restraints
            .cancel_blocked_for_requester(plan_execution_id, &node.uuid)?;
        self.services
            .restraints
            .finish_for_release_entity(plan_execution_id, &node.uuid)?;
        Ok(())
    }

    async fn apply_advice(
        &self,
        node: &NodeExecution,
        plan: &Plan,
        advice: AdviserResponse,
    ) -> Result<()> {
        match advice {
            AdviserResponse::NextStep { next_node_id } => {
                self.advance(node, plan, next_node_id.as_deref())
            }
            AdviserResponse::IgnoreFailure { next_node_id } => {
                if node.status.is_broken() {
                    self.node_executions.update_status(
                        &node.uuid,
                        Status::BROKEN,
                        Status::IgnoreFailed,
                        |_| {},
                    )?;
                }
                self.advance(node, plan, next_node_id.as_deref())
            }
            AdviserResponse::Retry {
                wait_interval,
                retry_index,
            } => self.retry(node, plan, wait_interval, retry_index),
            AdviserResponse::Rollback {
                strategy,
                rollback_node_id,
            } => {
                log::info!(
                    "Rolling back after '{}' ({:?})",
                    node.identifier,
                    strategy
                );
                self.advance(node, plan, rollback_node_id.as_deref())
            }
            AdviserResponse::ManualIntervention {
                timeout,
                timeout_action,
            } => self.hold_for_intervention(node, timeout, timeout_action),
            AdviserResponse::InterventionWait {
                timeout,
                timeout_action,
            } => self.hold_for_intervention(node, Some(timeout), timeout_action),
            AdviserResponse::EndPlan { is_abort } => self.end_plan(node, is_abort).await,
        }
    }

    /// Continue the chain with `next`, or end it when there is none
    fn advance(&self, node: &NodeExecution, plan: &Plan, next: Option<&str>) -> Result<()> {
        let Some(next_node_id) = next else {
            self.enqueue(&node.plan_execution_id, WorkItem::End(node.uuid.clone()));
            return Ok(());
        };
        let next_node = plan_node(plan, next_node_id)?;
        let uuid = generate_uuid();
        let successor = NodeExecution::queued(
            &uuid,
            next_node,
            node.ambiance
                .clone_for_finish()
                .clone_for_child(Level::for_node(next_node, &uuid, 0)),
        )
        .with_parent(node.parent_id.clone())
        .with_notify(node.notify_id.clone())
        .with_previous(Some(node.uuid.clone()));
        self.node_executions.create(&successor)?;
        self.node_executions
            .update(&node.uuid, |n| n.next_id = Some(uuid.clone()))?;
        log::debug!("'{}' hands over to '{}'", node.identifier, next_node.identifier);
        self.enqueue(&node.plan_execution_id, WorkItem::Start(uuid));
        Ok(())
    }

    /// Replace `node` with a fresh attempt in the same chain position
    pub(super) fn retry(
        &self,
        node: &NodeExecution,
        plan: &Plan,
        wait_interval: Duration,
        retry_index: u32,
    ) -> Result<()> {
        let plan_node = plan_node(plan, &node.node_id)?;
        let uuid = generate_uuid();
        let attempt = NodeExecution::queued(
            &uuid,
            plan_node,
            node.ambiance
                .clone_for_finish()
                .clone_for_child(Level::for_node(plan_node, &uuid, retry_index)),
        )
        .with_parent(node.parent_id.clone())
        .with_notify(node.notify_id.clone())
        .with_previous(node.previous_id.clone());
        self.node_executions.create(&attempt)?;
        self.node_executions.mark_retried(&node.uuid, &uuid)?;
        if let Some(previous_id) = &node.previous_id {
            self.node_executions
                .update(previous_id, |n| n.next_id = Some(uuid.clone()))?;
        }
        log::info!(
            "Retrying '{}' as attempt {} in {:?}",
            node.identifier,
            retry_index,
            wait_interval
        );

        if wait_interval.is_zero() {
            self.enqueue(&node.plan_execution_id, WorkItem::Start(uuid));
        } else {
            self.timers.schedule_after(
                &node.plan_execution_id,
                wait_interval,
                TimerAction::StartNode {
                    node_execution_id: uuid,
                },
            )?;
        }
        Ok(())
    }

    fn hold_for_intervention(
        &self,
        node: &NodeExecution,
        timeout: Option<Duration>,
        timeout_action: RepairActionCode,
    ) -> Result<()> {
        if !node.status.is_broken() {
            self.enqueue(&node.plan_execution_id, WorkItem::End(node.uuid.clone()));
            return Ok(());
        }
        let failed_as = node.status;
        self.node_executions.update_status(
            &node.uuid,
            Status::BROKEN,
            Status::InterventionWaiting,
            |n| n.intervention_from = Some(failed_as),
        )?;
        log::warn!(
            "'{}' ended {} and is waiting for manual intervention",
            node.identifier,
            failed_as
        );
        if let Some(timeout) = timeout {
            self.timers.schedule_after(
                &node.plan_execution_id,
                timeout,
                TimerAction::InterventionTimeout {
                    node_execution_id: node.uuid.clone(),
                    action: timeout_action,
                },
            )?;
        }
        Ok(())
    }

    /// Report the chain ending at `id` to its parent or the plan run
    pub(super) fn end_node(&self, id: &str) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if !node.status.is_final() {
            return Ok(());
        }
        self.timers.cancel_for_node(&node.plan_execution_id, &node.uuid)?;
        self.services
            .restraints
            .cancel_blocked_for_requester(&node.plan_execution_id, &node.uuid)?;

        if let Some(notify_id) = &node.notify_id {
            let (status, failure_info) = self.chain_outcome(&node)?;
            self.wait_notify.notify(
                notify_id,
                ResponseData::StepStatus(StepStatusData {
                    node_execution_id: node.uuid.clone(),
                    status,
                    failure_info,
                }),
            )?;
        } else if node.parent_id.is_none() {
            self.conclude_plan_if_done(&node.plan_execution_id)?;
        }
        Ok(())
    }

    /// Folded status of the chain ending at `last`
    ///
    /// The failure carried up is the earliest broken node's.
    fn chain_outcome(&self, last: &NodeExecution) -> Result<(Status, Option<FailureInfo>)> {
        let mut chain = vec![last.clone()];
        let mut previous = last.previous_id.clone();
        while let Some(id) = previous {
            let node = self.node_executions.require(&id)?;
            previous = node.previous_id.clone();
            chain.push(node);
        }
        let status = Status::fold(chain.iter().map(|n| n.status));
        let failure_info = if status.is_broken() {
            chain
                .iter()
                .rev()
                .find(|n| n.status.is_broken())
                .and_then(|n| n.failure_info.clone())
        } else {
            None
        };
        Ok((status, failure_info))
    }

    fn conclude_plan_if_done(&self, plan_execution_id: &str) -> Result<()> {
        let top_level = self.node_executions.top_level(plan_execution_id)?;
        if top_level.iter().any(|n| n.status.is_active()) {
            return Ok(());
        }
        let status = Status::fold(top_level.iter().map(|n| n.status));
        self.conclude_plan(plan_execution_id, status)
    }

    /// Move the plan run to its final status and release plan-wide holds
    pub(super) fn conclude_plan(&self, plan_execution_id: &str, status: Status) -> Result<()> {
        let execution = match self.plan_executions.update_status(
            plan_execution_id,
            &[Status::Running, Status::Paused],
            status,
        ) {
            Ok(execution) => execution,
            Err(e) if e.is_stale() => return Ok(()),
            Err(e) => return Err(e),
        };
        self.services.barriers.error_out_for_plan(plan_execution_id)?;
        self.services
            .restraints
            .finish_for_release_entity(plan_execution_id, plan_execution_id)?;
        self.timers.cancel(plan_execution_id, |_| true)?;
        log::info!(
            "Plan execution '{}' of plan '{}' finished {}",
            plan_execution_id,
            execution.plan_id,
            status
        );
        self.publish(OrchestrationEvent::PlanStatusChanged {
            plan_execution_id: plan_execution_id.to_string(),
            plan_id: execution.plan_id,
            status,
        });
        Ok(())
    }

    /// Stop the whole plan run because of `node`
    pub(super) async fn end_plan(&self, node: &NodeExecution, is_abort: bool) -> Result<()> {
        let status = if is_abort {
            Status::Aborted
        } else if node.status.is_broken() {
            node.status
        } else {
            Status::Failed
        };
        log::warn!(
            "'{}' ends plan execution '{}' as {}",
            node.identifier,
            node.plan_execution_id,
            status
        );
        for top in self.node_executions.top_level(&node.plan_execution_id)? {
            if top.status.is_active() {
                self.abort_tree(&top).await?;
            }
        }
        self.conclude_plan(&node.plan_execution_id, status)
    }
}
