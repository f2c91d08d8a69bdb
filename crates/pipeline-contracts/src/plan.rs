//! Execution graph types
//!
//! A [`Plan`] is the immutable, acyclic graph of [`PlanNode`]s produced by
//! the external plan builder. Nodes reference each other by id only; the
//! engine looks them up by id for every activation so that executions can
//! be resumed from persisted state after a restart.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::advise::AdviserObtainment;
use crate::facilitation::FacilitatorObtainment;
use crate::payload::Payload;

/// Structural role of a node in the pipeline tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    StepGroup,
    Step,
    Fork,
    Section,
}

/// Step type: the registry key of the domain logic a node runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepType {
    #[serde(rename = "type")]
    pub type_name: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(type_name: impl Into<String>, category: StepCategory) -> Self {
        Self {
            type_name: type_name.into(),
            category,
        }
    }

    pub fn step(type_name: impl Into<String>) -> Self {
        Self::new(type_name, StepCategory::Step)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.type_name)
    }
}

/// Condition under which a node is skipped instead of run
///
/// The expression is evaluated by an external evaluator; the engine only
/// understands the literals `true` and `false` on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipCondition {
    pub expression: String,
}

impl SkipCondition {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }
}

/// Which output store a reference points into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefKind {
    SweepingOutput,
    Outcome,
}

/// A named output a step wants resolved into its inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefObject {
    pub name: String,
    pub kind: RefKind,
}

impl RefObject {
    pub fn sweeping_output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RefKind::SweepingOutput,
        }
    }

    pub fn outcome(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RefKind::Outcome,
        }
    }
}

/// A node of the execution graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub uuid: String,
    pub name: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default)]
    pub step_parameters: Payload,
    #[serde(default)]
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<SkipCondition>,
    /// Deadline for the whole node once it starts running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Level group name used to scope sweeping outputs (e.g. `STAGE`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub ref_objects: Vec<RefObject>,
}

/// Kind of graph position a barrier waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierPositionType {
    Stage,
    StepGroup,
    Step,
}

/// One expected arrival at a barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierPositionDeclaration {
    pub position_type: BarrierPositionType,
    pub setup_id: String,
}

/// A barrier declared by the plan, instantiated once per plan execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierDeclaration {
    pub identifier: String,
    pub positions: Vec<BarrierPositionDeclaration>,
}

/// The pre-compiled execution graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub uuid: String,
    pub starting_node_id: String,
    pub nodes: BTreeMap<String, PlanNode>,
    #[serde(default)]
    pub barriers: Vec<BarrierDeclaration>,
    #[serde(default)]
    pub version: u64,
}

impl Plan {
    /// Look up a node by uuid
    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.get(node_id)
    }

    /// The node the run starts from
    pub fn starting_node(&self) -> Option<&PlanNode> {
        self.nodes.get(&self.starting_node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
