//! NodeExecution record and its compare-and-swap state machine

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipeline_contracts::{
    AdviserResponse, Ambiance, ExecutionMode, FailureInfo, Payload, PlanNode, ResponseDataMap,
    Status,
};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::event_log::EventLogService;
use crate::persistence::{impl_entity, modify, Modification, Repository};
use crate::steps::StepResponse;

/// A spawned child: its runtime id and the plan node it activates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSpawn {
    pub runtime_id: String,
    pub node_id: String,
}

/// What the step executor did for this activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    #[serde(rename_all = "camelCase")]
    Async {
        callback_ids: Vec<String>,
        timeout: Option<Duration>,
    },
    #[serde(rename_all = "camelCase")]
    Task { task_id: String },
    /// One link of a task chain; `pass_through` carries state between links
    #[serde(rename_all = "camelCase")]
    TaskChain {
        task_id: String,
        link_index: u32,
        pass_through: Payload,
    },
    #[serde(rename_all = "camelCase")]
    Child { child: ChildSpawn },
    #[serde(rename_all = "camelCase")]
    Children {
        children: Vec<ChildSpawn>,
        max_concurrency: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Skip { reason: String },
}

/// One activation of a plan node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub uuid: String,
    pub plan_execution_id: String,
    pub ambiance: Ambiance,
    /// PlanNode uuid
    pub node_id: String,
    pub identifier: String,
    pub status: Status,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Callback id notified with this chain's terminal status
    #[serde(default)]
    pub notify_id: Option<String>,
    #[serde(default)]
    pub previous_id: Option<String>,
    #[serde(default)]
    pub next_id: Option<String>,
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// Superseded by a retry attempt
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub adviser_response: Option<AdviserResponse>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    /// Status to restore on RESUME
    #[serde(default)]
    pub paused_from: Option<Status>,
    /// Status the node failed with before entering INTERVENTION_WAITING
    #[serde(default)]
    pub intervention_from: Option<Status>,
    /// Step response that arrived while paused
    #[serde(default)]
    pub pending_response: Option<StepResponse>,
    /// Wait completion that arrived while paused
    #[serde(default)]
    pub pending_resume: Option<ResponseDataMap>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(NodeExecution, "node_executions");

impl NodeExecution {
    /// A fresh QUEUED activation of `node`; `ambiance` already carries its level
    pub fn queued(uuid: impl Into<String>, node: &PlanNode, ambiance: Ambiance) -> Self {
        Self {
            uuid: uuid.into(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            ambiance,
            node_id: node.uuid.clone(),
            identifier: node.identifier.clone(),
            status: Status::Queued,
            mode: None,
            parent_id: None,
            notify_id: None,
            previous_id: None,
            next_id: None,
            retry_ids: Vec::new(),
            old_retry: false,
            failure_info: None,
            adviser_response: None,
            executable_responses: Vec::new(),
            paused_from: None,
            intervention_from: None,
            pending_response: None,
            pending_resume: None,
            created_at: Utc::now(),
            start_ts: None,
            end_ts: None,
            version: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_notify(mut self, notify_id: Option<String>) -> Self {
        self.notify_id = notify_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<String>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn retry_index(&self) -> u32 {
        self.ambiance.retry_index()
    }

    /// The latest executable response recorded
    pub fn last_executable_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }
}

/// Store operations and status transitions for node executions
pub struct NodeExecutionService {
    repo: Arc<dyn Repository<NodeExecution>>,
    event_log: Arc<EventLogService>,
    max_cas_retries: u32,
}

impl NodeExecutionService {
    pub fn new(
        repo: Arc<dyn Repository<NodeExecution>>,
        event_log: Arc<EventLogService>,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            repo,
            event_log,
            max_cas_retries,
        }
    }

    /// Persist a new activation; it must be QUEUED
    pub fn create(&self, node: &NodeExecution) -> Result<NodeExecution> {
        if node.status != Status::Queued {
            return Err(EngineError::invalid(format!(
                "node execution '{}' must be created QUEUED, not {}",
                node.uuid, node.status
            )));
        }
        let stored = self.repo.insert(node)?;
        log::debug!(
            "Created node execution '{}' ({}) for plan execution '{}'",
            stored.uuid,
            stored.identifier,
            stored.plan_execution_id
        );
        Ok(stored)
    }

    pub fn get(&self, uuid: &str) -> Result<Option<NodeExecution>> {
        self.repo.get(uuid)
    }

    pub fn require(&self, uuid: &str) -> Result<NodeExecution> {
        self.repo.require(uuid)
    }

    /// Compare-and-swap status transition
    ///
    /// Fails with `StaleState`, writing nothing, when the stored status is
    /// not in `from`; fails with `IllegalTransition` when the table forbids
    /// `stored -> to`. A version conflict re-reads and re-checks up to the
    /// configured number of times. `ops` applies further field changes in
    /// the same write.
    pub fn update_status<F>(
        &self,
        uuid: &str,
        from: &[Status],
        to: Status,
        mut ops: F,
    ) -> Result<NodeExecution>
    where
        F: FnMut(&mut NodeExecution),
    {
        let mut attempt = 0;
        loop {
            let mut node = self.repo.require(uuid)?;
            let previous = node.status;
            if !from.contains(&previous) {
                log::debug!(
                    "Node execution '{}' is {}, expected one of {:?}; not moving to {}",
                    uuid,
                    previous,
                    from,
                    to
                );
                return Err(EngineError::stale("node_executions", uuid));
            }
            if !previous.can_transition_to(to) {
                return Err(EngineError::IllegalTransition {
                    collection: "node_executions",
                    uuid: uuid.to_string(),
                    from: previous,
                    to,
                });
            }

            let now = Utc::now();
            node.status = to;
            if to == Status::Running && node.start_ts.is_none() {
                node.start_ts = Some(now);
            }
            if to.is_final() {
                node.end_ts = Some(now);
            }
            ops(&mut node);

            match self.repo.update(&node) {
                Ok(stored) => {
                    log::debug!(
                        "Node execution '{}' ({}) {} -> {}",
                        uuid,
                        stored.identifier,
                        previous,
                        to
                    );
                    self.event_log.record_node_transition(&stored, previous)?;
                    return Ok(stored);
                }
                Err(e) if e.is_stale() && attempt < self.max_cas_retries => {
                    attempt += 1;
                    log::debug!("Version conflict on node execution '{}', re-reading", uuid);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compare-and-swap update of fields other than status
    pub fn update<F>(&self, uuid: &str, mut ops: F) -> Result<NodeExecution>
    where
        F: FnMut(&mut NodeExecution),
    {
        let mut attempt = 0;
        loop {
            let mut node = self.repo.require(uuid)?;
            let status = node.status;
            ops(&mut node);
            node.status = status;
            match self.repo.update(&node) {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_stale() && attempt < self.max_cas_retries => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Record the advice for the node's current terminal status
    ///
    /// Returns `false`, writing nothing, when advice was already recorded;
    /// only the caller that records it may act on it.
    pub fn record_advice(&self, uuid: &str, response: &AdviserResponse) -> Result<bool> {
        let (_, recorded) = modify(
            self.repo.as_ref(),
            uuid,
            self.max_cas_retries,
            |node: &mut NodeExecution| {
                if node.adviser_response.is_some() {
                    return Ok(Modification::Keep(false));
                }
                node.adviser_response = Some(response.clone());
                Ok(Modification::Write(true))
            },
        )?;
        Ok(recorded)
    }

    pub fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.repo.find_by_plan_execution(plan_execution_id)
    }

    /// Direct children of `parent`, in creation order
    pub fn children(&self, parent: &NodeExecution) -> Result<Vec<NodeExecution>> {
        Ok(self
            .repo
            .find_by_plan_execution(&parent.plan_execution_id)?
            .into_iter()
            .filter(|n| n.parent_id.as_deref() == Some(parent.uuid.as_str()))
            .collect())
    }

    /// All descendants of `root`, breadth first
    pub fn descendants(&self, root: &NodeExecution) -> Result<Vec<NodeExecution>> {
        let all = self.repo.find_by_plan_execution(&root.plan_execution_id)?;
        let mut found = Vec::new();
        let mut frontier = VecDeque::from([root.uuid.clone()]);
        while let Some(parent_id) = frontier.pop_front() {
            for node in all
                .iter()
                .filter(|n| n.parent_id.as_deref() == Some(parent_id.as_str()))
            {
                frontier.push_back(node.uuid.clone());
                found.push(node.clone());
            }
        }
        Ok(found)
    }

    /// Top-level activations of a plan run that were not superseded by a retry
    pub fn top_level(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self
            .repo
            .find_by_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|n| n.parent_id.is_none() && !n.old_retry)
            .collect())
    }

    /// Active nodes without active children
    pub fn active_leaves(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let all = self.repo.find_by_plan_execution(plan_execution_id)?;
        Ok(all
            .iter()
            .filter(|n| n.status.is_active())
            .filter(|n| {
                !all.iter().any(|c| {
                    c.parent_id.as_deref() == Some(n.uuid.as_str()) && c.status.is_active()
                })
            })
            .cloned()
            .collect())
    }

    pub fn count_by_parent_and_status(
        &self,
        parent: &NodeExecution,
        statuses: &[Status],
    ) -> Result<usize> {
        Ok(self
            .children(parent)?
            .iter()
            .filter(|n| statuses.contains(&n.status))
            .count())
    }

    /// Move every active node of a plan run to ERRORED where the table allows
    pub fn error_out_active_nodes(&self, plan_execution_id: &str) -> Result<usize> {
        let mut errored = 0;
        for node in self.repo.find_by_plan_execution(plan_execution_id)? {
            if !node.status.is_active() || !node.status.can_transition_to(Status::Errored) {
                continue;
            }
            match self.update_status(&node.uuid, Status::ACTIVE, Status::Errored, |_| {}) {
                Ok(_) => errored += 1,
                Err(e) if e.is_stale() => {
                    log::warn!("Node execution '{}' moved on while erroring out", node.uuid)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(errored)
    }

    /// Mark `uuid` superseded by the retry attempt `retry_id`
    pub fn mark_retried(&self, uuid: &str, retry_id: &str) -> Result<NodeExecution> {
        self.update(uuid, |node| {
            node.old_retry = true;
            if !node.retry_ids.iter().any(|id| id == retry_id) {
                node.retry_ids.push(retry_id.to_string());
            }
        })
    }

    /// Remove every node execution of an archived plan run
    pub fn delete_for_plan(&self, plan_execution_id: &str) -> Result<usize> {
        self.repo.delete_by_plan_execution(plan_execution_id)
    }
}
