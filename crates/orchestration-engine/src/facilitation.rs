//! Facilitation: choosing how a node's step runs
//!
//! Facilitators are pure: given the node's context they return the
//! execution mode and an optional initial wait, or decline. The engine
//! consults the node's obtainments in declaration order and the first
//! response wins.

use std::sync::Arc;
use std::time::Duration;

use pipeline_contracts::{Ambiance, ExecutionMode, FacilitatorType, Payload, PayloadType};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::registry::Registry;
use crate::steps::StepInputPackage;

/// Mode chosen for one node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacilitatorResponse {
    pub mode: ExecutionMode,
    /// Delay before the executor runs
    pub initial_wait: Duration,
}

pub trait Facilitator: Send + Sync {
    /// `None` declines, leaving the choice to the next obtainment
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Payload,
        facilitator_parameters: &Payload,
        inputs: &StepInputPackage,
    ) -> Result<Option<FacilitatorResponse>>;
}

/// Parameters every built-in facilitator understands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_wait: Option<Duration>,
}

impl PayloadType for FacilitatorParameters {
    const KIND: &'static str = "facilitator";
}

/// Selects a fixed mode, honouring a configured initial wait
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

impl Facilitator for ModeFacilitator {
    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        _step_parameters: &Payload,
        facilitator_parameters: &Payload,
        _inputs: &StepInputPackage,
    ) -> Result<Option<FacilitatorResponse>> {
        let params: FacilitatorParameters = facilitator_parameters.decode_or_default()?;
        Ok(Some(FacilitatorResponse {
            mode: self.mode,
            initial_wait: params.initial_wait.unwrap_or_default(),
        }))
    }
}

pub type FacilitatorRegistry = Registry<FacilitatorType, dyn Facilitator>;

/// A registry with a [`ModeFacilitator`] for every facilitator type
pub fn default_facilitators() -> Result<FacilitatorRegistry> {
    let mut registry = FacilitatorRegistry::new("facilitator");
    for facilitator_type in [
        FacilitatorType::Sync,
        FacilitatorType::Async,
        FacilitatorType::Child,
        FacilitatorType::Children,
        FacilitatorType::Task,
        FacilitatorType::TaskChain,
    ] {
        registry.register(
            facilitator_type,
            Arc::new(ModeFacilitator::new(facilitator_type.mode())),
        )?;
    }
    Ok(registry)
}

/// Evaluates a node's skip condition
pub trait SkipConditionEvaluator: Send + Sync {
    fn evaluate(&self, ambiance: &Ambiance, expression: &str) -> Result<bool>;
}

/// Understands only the literals `true` and `false`
pub struct LiteralSkipConditionEvaluator;

impl SkipConditionEvaluator for LiteralSkipConditionEvaluator {
    fn evaluate(&self, _ambiance: &Ambiance, expression: &str) -> Result<bool> {
        match expression.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(EngineError::invalid(format!(
                "cannot evaluate skip condition '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_facilitators_cover_every_type() {
        let registry = default_facilitators().unwrap();
        assert_eq!(registry.len(), 6);
        let response = registry
            .obtain(&FacilitatorType::Children)
            .unwrap()
            .facilitate(
                &Ambiance::default(),
                &Payload::empty(),
                &Payload::empty(),
                &StepInputPackage::new(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(response.mode, ExecutionMode::Children);
        assert_eq!(response.initial_wait, Duration::ZERO);
    }

    #[test]
    fn test_initial_wait_parameter() {
        let params = Payload::encode(&FacilitatorParameters {
            initial_wait: Some(Duration::from_secs(30)),
        })
        .unwrap();
        let response = ModeFacilitator::new(ExecutionMode::Sync)
            .facilitate(
                &Ambiance::default(),
                &Payload::empty(),
                &params,
                &StepInputPackage::new(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(response.initial_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_literal_skip_conditions() {
        let evaluator = LiteralSkipConditionEvaluator;
        let ambiance = Ambiance::default();
        assert!(evaluator.evaluate(&ambiance, " TRUE ").unwrap());
        assert!(!evaluator.evaluate(&ambiance, "false").unwrap());
        assert!(evaluator.evaluate(&ambiance, "<+pipeline.stage>").is_err());
    }
}
