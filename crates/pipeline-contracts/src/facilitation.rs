//! Facilitator obtainments and execution modes

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// How a step executor is invoked. Chosen once per node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Child,
    Children,
    Task,
    TaskChain,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
            ExecutionMode::Task => "TASK",
            ExecutionMode::TaskChain => "TASK_CHAIN",
        };
        f.write_str(name)
    }
}

/// Registry key of a facilitator implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Sync,
    Async,
    Child,
    Children,
    Task,
    TaskChain,
}

impl FacilitatorType {
    /// The mode this facilitator type selects
    pub fn mode(self) -> ExecutionMode {
        match self {
            FacilitatorType::Sync => ExecutionMode::Sync,
            FacilitatorType::Async => ExecutionMode::Async,
            FacilitatorType::Child => ExecutionMode::Child,
            FacilitatorType::Children => ExecutionMode::Children,
            FacilitatorType::Task => ExecutionMode::Task,
            FacilitatorType::TaskChain => ExecutionMode::TaskChain,
        }
    }
}

impl std::fmt::Display for FacilitatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.mode().fmt(f)
    }
}

/// A facilitator declared on a plan node, with its encoded parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorObtainment {
    pub facilitator_type: FacilitatorType,
    #[serde(default)]
    pub parameters: Payload,
}

impl FacilitatorObtainment {
    pub fn new(facilitator_type: FacilitatorType) -> Self {
        Self {
            facilitator_type,
            parameters: Payload::empty(),
        }
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }
}
