//! Persisted deadlines
//!
//! Delayed starts, retry waits, node and task expiry, barrier timeouts and
//! manual-intervention timeouts are all [`ScheduledTimer`]s. Firing a timer
//! is a compare-and-swap from `Scheduled` to `Fired`, so when several
//! engine processes poll the same store each timer is acted on once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipeline_contracts::{generate_uuid, RepairActionCode};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persistence::{impl_entity, modify, Modification, Repository};

/// What to do when a timer fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerAction {
    /// Run the start path (skip check, facilitation) of a queued node
    #[serde(rename_all = "camelCase")]
    StartNode { node_execution_id: String },
    /// Run the executor of a facilitated node after its initial wait
    #[serde(rename_all = "camelCase")]
    ExecuteNode { node_execution_id: String },
    /// Node or task deadline
    #[serde(rename_all = "camelCase")]
    ExpireNode { node_execution_id: String },
    #[serde(rename_all = "camelCase")]
    ExpireBarrier { barrier_id: String },
    /// Apply the timeout action of a manual intervention
    #[serde(rename_all = "camelCase")]
    InterventionTimeout {
        node_execution_id: String,
        action: RepairActionCode,
    },
}

impl TimerAction {
    /// Node execution the action targets, if any
    pub fn node_execution_id(&self) -> Option<&str> {
        match self {
            Self::StartNode { node_execution_id }
            | Self::ExecuteNode { node_execution_id }
            | Self::ExpireNode { node_execution_id }
            | Self::InterventionTimeout {
                node_execution_id, ..
            } => Some(node_execution_id),
            Self::ExpireBarrier { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerState {
    Scheduled,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTimer {
    pub uuid: String,
    pub plan_execution_id: String,
    pub fire_at: DateTime<Utc>,
    pub action: TimerAction,
    pub state: TimerState,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(ScheduledTimer, "timers");

/// `now + delay`, saturating instead of overflowing
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct TimerService {
    repo: Arc<dyn Repository<ScheduledTimer>>,
    max_cas_retries: u32,
}

impl TimerService {
    pub fn new(repo: Arc<dyn Repository<ScheduledTimer>>, max_cas_retries: u32) -> Self {
        Self {
            repo,
            max_cas_retries,
        }
    }

    pub fn schedule(
        &self,
        plan_execution_id: &str,
        fire_at: DateTime<Utc>,
        action: TimerAction,
    ) -> Result<ScheduledTimer> {
        let timer = ScheduledTimer {
            uuid: generate_uuid(),
            plan_execution_id: plan_execution_id.to_string(),
            fire_at,
            action,
            state: TimerState::Scheduled,
            version: 0,
        };
        log::debug!("Scheduled timer {:?} at {}", timer.action, timer.fire_at);
        self.repo.insert(&timer)
    }

    /// Schedule `action` to fire `delay` from now
    pub fn schedule_after(
        &self,
        plan_execution_id: &str,
        delay: Duration,
        action: TimerAction,
    ) -> Result<ScheduledTimer> {
        self.schedule(plan_execution_id, deadline_after(Utc::now(), delay), action)
    }

    /// Scheduled timers due at `now`, earliest first
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTimer>> {
        let mut due: Vec<ScheduledTimer> = self
            .repo
            .list()?
            .into_iter()
            .filter(|t| t.state == TimerState::Scheduled && t.fire_at <= now)
            .collect();
        due.sort_by_key(|t| t.fire_at);
        Ok(due)
    }

    /// Claim a timer for firing; `false` if another poller got it first
    pub fn claim(&self, timer_id: &str) -> Result<bool> {
        let (_, claimed) = modify(
            self.repo.as_ref(),
            timer_id,
            self.max_cas_retries,
            |timer: &mut ScheduledTimer| {
                if timer.state != TimerState::Scheduled {
                    return Ok(Modification::Keep(false));
                }
                timer.state = TimerState::Fired;
                Ok(Modification::Write(true))
            },
        )?;
        Ok(claimed)
    }

    /// Scheduled timers of a plan run matching `filter`
    pub fn pending(
        &self,
        plan_execution_id: &str,
        filter: impl Fn(&TimerAction) -> bool,
    ) -> Result<Vec<ScheduledTimer>> {
        Ok(self
            .repo
            .find_by_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|t| t.state == TimerState::Scheduled && filter(&t.action))
            .collect())
    }

    /// Cancel scheduled timers of a plan run matching `filter`
    pub fn cancel(
        &self,
        plan_execution_id: &str,
        filter: impl Fn(&TimerAction) -> bool,
    ) -> Result<usize> {
        let mut cancelled = 0;
        for timer in self.pending(plan_execution_id, filter)? {
            let (_, changed) = modify(
                self.repo.as_ref(),
                &timer.uuid,
                self.max_cas_retries,
                |timer: &mut ScheduledTimer| {
                    if timer.state != TimerState::Scheduled {
                        return Ok(Modification::Keep(false));
                    }
                    timer.state = TimerState::Cancelled;
                    Ok(Modification::Write(true))
                },
            )?;
            if changed {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Cancel every scheduled timer targeting a node execution
    pub fn cancel_for_node(&self, plan_execution_id: &str, node_execution_id: &str) -> Result<usize> {
        self.cancel(plan_execution_id, |action| {
            action.node_execution_id() == Some(node_execution_id)
        })
    }

    pub fn delete_for_plan(&self, plan_execution_id: &str) -> Result<usize> {
        self.repo.delete_by_plan_execution(plan_execution_id)
    }
}
