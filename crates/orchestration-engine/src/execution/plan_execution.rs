//! PlanExecution record and service

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_contracts::Status;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::persistence::{impl_entity, modify, Modification, Repository};

/// Account scope of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
}

/// One run of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub status: Status,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
    pub start_ts: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
    /// Always equal to `uuid`; lets plan-scoped listing find the record
    pub plan_execution_id: String,
}

impl_entity!(PlanExecution, "plan_executions");

impl PlanExecution {
    pub fn running(uuid: impl Into<String>, plan_id: impl Into<String>, metadata: ExecutionMetadata) -> Self {
        let uuid = uuid.into();
        Self {
            plan_execution_id: uuid.clone(),
            uuid,
            plan_id: plan_id.into(),
            status: Status::Running,
            metadata,
            start_ts: Utc::now(),
            end_ts: None,
            version: 0,
        }
    }
}

/// Store operations for plan executions
pub struct PlanExecutionService {
    repo: Arc<dyn Repository<PlanExecution>>,
    max_cas_retries: u32,
}

impl PlanExecutionService {
    pub fn new(repo: Arc<dyn Repository<PlanExecution>>, max_cas_retries: u32) -> Self {
        Self {
            repo,
            max_cas_retries,
        }
    }

    pub fn create(&self, execution: &PlanExecution) -> Result<PlanExecution> {
        self.repo.insert(execution)
    }

    pub fn get(&self, uuid: &str) -> Result<Option<PlanExecution>> {
        self.repo.get(uuid)
    }

    pub fn require(&self, uuid: &str) -> Result<PlanExecution> {
        self.repo.require(uuid)
    }

    pub fn list(&self) -> Result<Vec<PlanExecution>> {
        self.repo.list()
    }

    /// Compare-and-swap status change; `StaleState` when the stored status
    /// is not in `from`
    pub fn update_status(&self, uuid: &str, from: &[Status], to: Status) -> Result<PlanExecution> {
        let (stored, previous) = modify(
            self.repo.as_ref(),
            uuid,
            self.max_cas_retries,
            |execution: &mut PlanExecution| {
                if !from.contains(&execution.status) {
                    return Err(EngineError::stale("plan_executions", uuid));
                }
                let previous = execution.status;
                execution.status = to;
                if to.is_final() {
                    execution.end_ts = Some(Utc::now());
                }
                Ok(Modification::Write(previous))
            },
        )?;
        log::info!("Plan execution '{}' {} -> {}", uuid, previous, to);
        Ok(stored)
    }

    pub fn delete(&self, uuid: &str) -> Result<bool> {
        self.repo.delete(uuid)
    }
}
