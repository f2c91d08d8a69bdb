//! Data delivered to a suspended node when it is resumed
//!
//! Every suspension (async callback, remote task, child completion, barrier,
//! resource restraint) is resumed with a map from correlation id to the
//! [`ResponseData`] notified under that id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::failure::FailureInfo;
use crate::payload::Payload;
use crate::status::Status;

/// Terminal status of a child chain, reported to the parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatusData {
    pub node_execution_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

/// Outcome of a remote task as reported by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
    Expired,
}

/// Completion of a remote task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskResponse {
    pub fn success(payload: Payload) -> Self {
        Self {
            status: TaskStatus::Success,
            payload,
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            payload: Payload::empty(),
            error_message: Some(message.into()),
        }
    }
}

/// A barrier a node waited on reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierResponseData {
    pub barrier_identifier: String,
    pub timed_out: bool,
}

/// A resource restraint instance became active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestraintResponseData {
    pub resource_unit: String,
    pub instance_id: String,
}

/// Data notified under one correlation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseData {
    StepStatus(StepStatusData),
    Task(TaskResponse),
    Barrier(BarrierResponseData),
    Restraint(RestraintResponseData),
    /// Free-form data from an async step's external completer
    Payload(Payload),
}

/// Responses keyed by correlation id (ordered for deterministic handling)
pub type ResponseDataMap = BTreeMap<String, ResponseData>;
