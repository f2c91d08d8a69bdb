//! Firing scheduled timers: delayed starts, deadlines, intervention timeouts

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_contracts::{FailureInfo, RepairActionCode, Status};
use tokio::task::JoinHandle;

use super::interrupt::Resolution;
use super::{OrchestrationEngine, WorkItem};
use crate::error::Result;
use crate::timers::{ScheduledTimer, TimerAction};

impl OrchestrationEngine {
    /// Fire every timer due at `now`, returning how many fired
    ///
    /// Each timer is claimed first, so with several engines sharing a
    /// store only one of them fires it.
    pub async fn run_due_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for timer in self.timers.due(now)? {
            if !self.timers.claim(&timer.uuid)? {
                continue;
            }
            fired += 1;
            if let Err(e) = self.fire_timer(&timer).await {
                log::error!("Timer {:?} failed: {}", timer.action, e);
            }
        }
        self.drain(None).await?;
        Ok(fired)
    }

    /// Poll for due timers in the background every `timer_poll_interval`
    pub fn spawn_timer_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.timer_poll_interval());
            loop {
                interval.tick().await;
                if let Err(e) = engine.run_due_timers(Utc::now()).await {
                    log::error!("Timer loop iteration failed: {}", e);
                }
            }
        })
    }

    async fn fire_timer(&self, timer: &ScheduledTimer) -> Result<()> {
        log::debug!("Timer '{}' fired: {:?}", timer.uuid, timer.action);
        match &timer.action {
            TimerAction::StartNode { node_execution_id } => {
                self.enqueue(&timer.plan_execution_id, WorkItem::Start(node_execution_id.clone()))
            }
            TimerAction::ExecuteNode { node_execution_id } => {
                self.enqueue(&timer.plan_execution_id, WorkItem::Execute(node_execution_id.clone()))
            }
            TimerAction::ExpireNode { node_execution_id } => {
                self.expire_node(node_execution_id).await?
            }
            TimerAction::ExpireBarrier { barrier_id } => {
                self.services.barriers.time_out(barrier_id)?;
            }
            TimerAction::InterventionTimeout {
                node_execution_id,
                action,
            } => self.on_intervention_timeout(node_execution_id, *action).await?,
        }
        Ok(())
    }

    async fn expire_node(&self, id: &str) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if node.status.is_final() || node.status == Status::InterventionWaiting {
            return Ok(());
        }
        log::warn!("'{}' timed out in {}", node.identifier, node.status);
        self.abort_descendants(&node).await?;
        let failure = FailureInfo::timeout(format!("'{}' exceeded its deadline", node.identifier));
        if self.discontinue(id, Status::Expired, Some(failure)).await? {
            self.enqueue(&node.plan_execution_id, WorkItem::Conclude(id.to_string()));
        }
        Ok(())
    }

    async fn on_intervention_timeout(&self, id: &str, action: RepairActionCode) -> Result<()> {
        let node = self.node_executions.require(id)?;
        if node.status != Status::InterventionWaiting {
            return Ok(());
        }
        log::warn!(
            "No decision on '{}' before the intervention timeout; applying {:?}",
            node.identifier,
            action
        );
        match action {
            RepairActionCode::ManualIntervention => Ok(()),
            RepairActionCode::MarkAsFailure | RepairActionCode::Rollback => {
                self.resolve_intervention(&node, Resolution::MarkFailed(None))
            }
            RepairActionCode::Ignore => self.resolve_intervention(&node, Resolution::Ignore),
            RepairActionCode::MarkAsSuccess => {
                self.resolve_intervention(&node, Resolution::MarkSuccess)
            }
            RepairActionCode::EndExecution | RepairActionCode::Abort => {
                let is_abort = action == RepairActionCode::Abort;
                let to = if is_abort {
                    Status::Aborted
                } else {
                    node.intervention_from.unwrap_or(Status::Failed)
                };
                let ended = self.node_executions.update_status(
                    id,
                    &[Status::InterventionWaiting],
                    to,
                    |_| {},
                )?;
                self.end_plan(&ended, is_abort).await
            }
        }
    }
}
