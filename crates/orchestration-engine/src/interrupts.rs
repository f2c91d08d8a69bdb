//! Interrupts: external control commands against a plan run or node
//!
//! An interrupt is persisted REGISTERED, claimed into PROCESSING by
//! compare-and-swap (so only one engine process applies it), and closed as
//! PROCESSED_SUCCESSFULLY or PROCESSED_UNSUCCESSFULLY with the error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_contracts::{generate_uuid, FailureInfo};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persistence::{impl_entity, modify, Modification, Repository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    /// Abort the target and every active descendant
    Abort,
    Pause,
    Resume,
    /// Re-run a node held for manual intervention
    Retry,
    MarkFailed,
    /// Fail an active node with caller-given failure info
    CustomFailure,
    MarkSuccess,
    Ignore,
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InterruptType::Abort => "ABORT",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::Retry => "RETRY",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::CustomFailure => "CUSTOM_FAILURE",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::Ignore => "IGNORE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    pub uuid: String,
    pub plan_execution_id: String,
    /// Target node; `None` targets the whole plan run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    pub interrupt_type: InterruptType,
    pub state: InterruptState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(Interrupt, "interrupts");

/// A control command as submitted by a caller
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptRequest {
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub failure_info: Option<FailureInfo>,
}

impl InterruptRequest {
    /// Target the whole plan run
    pub fn for_plan(interrupt_type: InterruptType, plan_execution_id: impl Into<String>) -> Self {
        Self {
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
            failure_info: None,
        }
    }

    /// Target one node execution
    pub fn for_node(
        interrupt_type: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: impl Into<String>,
    ) -> Self {
        Self {
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: Some(node_execution_id.into()),
            failure_info: None,
        }
    }

    pub fn with_failure_info(mut self, failure_info: FailureInfo) -> Self {
        self.failure_info = Some(failure_info);
        self
    }
}

pub struct InterruptService {
    repo: Arc<dyn Repository<Interrupt>>,
    max_cas_retries: u32,
}

impl InterruptService {
    pub fn new(repo: Arc<dyn Repository<Interrupt>>, max_cas_retries: u32) -> Self {
        Self {
            repo,
            max_cas_retries,
        }
    }

    pub fn register(&self, request: InterruptRequest) -> Result<Interrupt> {
        let interrupt = Interrupt {
            uuid: generate_uuid(),
            plan_execution_id: request.plan_execution_id,
            node_execution_id: request.node_execution_id,
            interrupt_type: request.interrupt_type,
            state: InterruptState::Registered,
            failure_info: request.failure_info,
            error: None,
            created_at: Utc::now(),
            version: 0,
        };
        log::info!(
            "Registered {} interrupt '{}' for plan execution '{}'{}",
            interrupt.interrupt_type,
            interrupt.uuid,
            interrupt.plan_execution_id,
            interrupt
                .node_execution_id
                .as_deref()
                .map(|id| format!(" node '{}'", id))
                .unwrap_or_default()
        );
        self.repo.insert(&interrupt)
    }

    /// REGISTERED -> PROCESSING; `None` if someone else claimed it
    pub fn claim(&self, uuid: &str) -> Result<Option<Interrupt>> {
        let (interrupt, claimed) = modify(
            self.repo.as_ref(),
            uuid,
            self.max_cas_retries,
            |interrupt: &mut Interrupt| {
                if interrupt.state != InterruptState::Registered {
                    return Ok(Modification::Keep(false));
                }
                interrupt.state = InterruptState::Processing;
                Ok(Modification::Write(true))
            },
        )?;
        Ok(claimed.then_some(interrupt))
    }

    /// PROCESSING -> PROCESSED_*; `error` marks it unsuccessful
    pub fn complete(&self, uuid: &str, error: Option<String>) -> Result<Interrupt> {
        let (interrupt, _) = modify(
            self.repo.as_ref(),
            uuid,
            self.max_cas_retries,
            |interrupt: &mut Interrupt| {
                if interrupt.state != InterruptState::Processing {
                    return Ok(Modification::Keep(()));
                }
                interrupt.state = match error {
                    None => InterruptState::ProcessedSuccessfully,
                    Some(_) => InterruptState::ProcessedUnsuccessfully,
                };
                interrupt.error = error.clone();
                Ok(Modification::Write(()))
            },
        )?;
        Ok(interrupt)
    }

    pub fn get(&self, uuid: &str) -> Result<Option<Interrupt>> {
        self.repo.get(uuid)
    }

    pub fn list_for_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.repo.find_by_plan_execution(plan_execution_id)
    }

    /// Interrupts left REGISTERED, e.g. by a process that stopped
    pub fn unprocessed(&self) -> Result<Vec<Interrupt>> {
        Ok(self
            .repo
            .list()?
            .into_iter()
            .filter(|i| i.state == InterruptState::Registered)
            .collect())
    }

    pub fn delete_for_plan(&self, plan_execution_id: &str) -> Result<usize> {
        self.repo.delete_by_plan_execution(plan_execution_id)
    }
}
