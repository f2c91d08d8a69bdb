//! Fluent builder for execution plans
//!
//! The real plan builder lives outside the engine; this builder exists for
//! hosts and tests that assemble small plans programmatically.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::advise::{AdviserObtainment, AdviserType};
use crate::facilitation::{FacilitatorObtainment, FacilitatorType};
use crate::payload::Payload;
use crate::plan::{
    BarrierDeclaration, BarrierPositionDeclaration, BarrierPositionType, Plan, PlanNode,
    RefObject, SkipCondition, StepType,
};

/// Fluent builder for [`Plan`]s
///
/// # Example
///
/// ```ignore
/// let plan = PlanBuilder::new("plan-1")
///     .add_node("a", "step_a", StepType::step("shell"))
///     .with_facilitator(FacilitatorType::Sync)
///     .with_adviser(AdviserType::NextStage, next_stage_params("b"))
///     .add_node("b", "step_b", StepType::step("shell"))
///     .with_facilitator(FacilitatorType::Sync)
///     .build();
/// ```
pub struct PlanBuilder {
    uuid: String,
    starting_node_id: Option<String>,
    nodes: Vec<PlanNode>,
    barriers: Vec<BarrierDeclaration>,
}

impl PlanBuilder {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            starting_node_id: None,
            nodes: Vec::new(),
            barriers: Vec::new(),
        }
    }

    /// Add a node; its name defaults to the identifier
    pub fn add_node(
        mut self,
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        let identifier = identifier.into();
        self.nodes.push(PlanNode {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            step_type,
            step_parameters: Payload::empty(),
            facilitator_obtainments: Vec::new(),
            adviser_obtainments: Vec::new(),
            skip_condition: None,
            timeout: None,
            group: None,
            ref_objects: Vec::new(),
        });
        self
    }

    /// Set step parameters on the most recently added node
    pub fn with_parameters(self, parameters: Payload) -> Self {
        self.update_last(|node| node.step_parameters = parameters)
    }

    pub fn with_facilitator(self, facilitator_type: FacilitatorType) -> Self {
        self.update_last(|node| {
            node.facilitator_obtainments
                .push(FacilitatorObtainment::new(facilitator_type))
        })
    }

    pub fn with_facilitator_obtainment(self, obtainment: FacilitatorObtainment) -> Self {
        self.update_last(|node| node.facilitator_obtainments.push(obtainment))
    }

    /// Append an adviser; declaration order is selection order
    pub fn with_adviser(self, adviser_type: AdviserType, parameters: Payload) -> Self {
        self.update_last(|node| {
            node.adviser_obtainments
                .push(AdviserObtainment::new(adviser_type, parameters))
        })
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.update_last(|node| node.timeout = Some(timeout))
    }

    pub fn with_group(self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.update_last(|node| node.group = Some(group))
    }

    pub fn with_skip_condition(self, expression: impl Into<String>) -> Self {
        let condition = SkipCondition::new(expression);
        self.update_last(|node| node.skip_condition = Some(condition))
    }

    pub fn with_ref_object(self, ref_object: RefObject) -> Self {
        self.update_last(|node| node.ref_objects.push(ref_object))
    }

    /// Override the starting node (defaults to the first node added)
    pub fn starting_at(mut self, node_id: impl Into<String>) -> Self {
        self.starting_node_id = Some(node_id.into());
        self
    }

    /// Declare a barrier whose expected positions are the given step nodes
    pub fn add_barrier<I, S>(mut self, identifier: impl Into<String>, step_setup_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.barriers.push(BarrierDeclaration {
            identifier: identifier.into(),
            positions: step_setup_ids
                .into_iter()
                .map(|setup_id| BarrierPositionDeclaration {
                    position_type: BarrierPositionType::Step,
                    setup_id: setup_id.into(),
                })
                .collect(),
        });
        self
    }

    pub fn build(self) -> Plan {
        let starting_node_id = self
            .starting_node_id
            .or_else(|| self.nodes.first().map(|n| n.uuid.clone()))
            .unwrap_or_default();
        let nodes: BTreeMap<String, PlanNode> = self
            .nodes
            .into_iter()
            .map(|n| (n.uuid.clone(), n))
            .collect();
        Plan {
            uuid: self.uuid,
            starting_node_id,
            nodes,
            barriers: self.barriers,
            version: 0,
        }
    }

    fn update_last(mut self, f: impl FnOnce(&mut PlanNode)) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            f(node);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_start_to_first_node() {
        let plan = PlanBuilder::new("p")
            .add_node("a", "first", StepType::step("noop"))
            .with_facilitator(FacilitatorType::Sync)
            .add_node("b", "second", StepType::step("noop"))
            .with_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(plan.starting_node_id, "a");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.node("a").unwrap().facilitator_obtainments.len(), 1);
        assert_eq!(plan.node("b").unwrap().timeout, Some(Duration::from_secs(5)));
        assert!(plan.node("b").unwrap().facilitator_obtainments.is_empty());
    }

    #[test]
    fn test_barrier_declaration() {
        let plan = PlanBuilder::new("p")
            .add_node("a", "a", StepType::step("barrier"))
            .add_barrier("sync-point", ["a", "b"])
            .build();
        assert_eq!(plan.barriers.len(), 1);
        assert_eq!(plan.barriers[0].positions.len(), 2);
        assert_eq!(
            plan.barriers[0].positions[1].position_type,
            BarrierPositionType::Step
        );
    }
}
