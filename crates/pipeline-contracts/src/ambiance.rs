//! Execution context propagated to every node
//!
//! An [`Ambiance`] identifies the run (plan execution, account, org,
//! project) and the position of the current node in the execution tree as
//! a stack of [`Level`]s, one per depth. It is never mutated in place:
//! descending into a child derives a new value with one more level.

use serde::{Deserialize, Serialize};

use crate::plan::{PlanNode, StepCategory, StepType};

/// One depth of the execution tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// PlanNode uuid
    pub setup_id: String,
    /// NodeExecution uuid of this activation
    pub runtime_id: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default)]
    pub retry_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Level {
    /// Level for an activation of `node`
    pub fn for_node(node: &PlanNode, runtime_id: impl Into<String>, retry_index: u32) -> Self {
        Self {
            setup_id: node.uuid.clone(),
            runtime_id: runtime_id.into(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            retry_index,
            group: node.group.clone(),
        }
    }
}

/// Immutable execution context
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub levels: Vec<Level>,
}

impl Ambiance {
    /// Root ambiance for a plan execution (no levels yet)
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            ..Default::default()
        }
    }

    /// Set account/org/project scope
    pub fn with_scope(
        mut self,
        account_id: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        self.account_id = account_id.into();
        self.org_id = org_id.into();
        self.project_id = project_id.into();
        self
    }

    /// Derive the ambiance of a child by appending a level
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Derive the ambiance of the enclosing scope by dropping the last level
    pub fn clone_for_finish(&self) -> Self {
        let mut parent = self.clone();
        parent.levels.pop();
        parent
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    /// Runtime id of the level directly above the current one
    pub fn parent_runtime_id(&self) -> Option<&str> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id.as_str())
    }

    pub fn retry_index(&self) -> u32 {
        self.current_level().map_or(0, |l| l.retry_index)
    }

    pub fn is_retry(&self) -> bool {
        self.retry_index() > 0
    }

    /// Innermost level of the given category
    pub fn level_of_category(&self, category: StepCategory) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == category)
    }

    pub fn stage_level(&self) -> Option<&Level> {
        self.level_of_category(StepCategory::Stage)
    }

    pub fn stage_runtime_id(&self) -> Option<&str> {
        self.stage_level().map(|l| l.runtime_id.as_str())
    }

    pub fn step_group_identifier(&self) -> Option<&str> {
        self.level_of_category(StepCategory::StepGroup)
            .map(|l| l.identifier.as_str())
    }

    /// Innermost level tagged with `group`
    pub fn level_in_group(&self, group: &str) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.group.as_deref() == Some(group))
    }

    /// Fully qualified name of the current position: identifiers joined by `.`
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}
