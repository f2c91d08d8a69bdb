//! Pipeline Contracts - shared data model for pipeline orchestration
//!
//! This crate holds the types that cross the boundary between the
//! orchestration engine and its collaborators:
//!
//! - [`ambiance`]: the execution context propagated to every node
//! - [`plan`]: the pre-compiled execution graph (`Plan` / `PlanNode`)
//! - [`status`]: node and plan statuses with the legal transition table
//! - [`payload`]: versioned, opaque byte payloads with an explicit codec
//! - [`failure`]: failure classification handed to advisers
//! - [`advise`] / [`facilitation`]: obtainments and responses of the
//!   adviser and facilitator subsystems
//! - [`response`]: data delivered to a waiting node on resumption
//!
//! Plans are produced by an external plan builder; the engine consumes them
//! as-is and never mutates them.

pub mod advise;
pub mod ambiance;
pub mod builder;
pub mod error;
pub mod facilitation;
pub mod failure;
pub mod payload;
pub mod plan;
pub mod response;
pub mod status;

pub use advise::{AdviserObtainment, AdviserResponse, AdviserType, RepairActionCode, RollbackStrategy};
pub use ambiance::{Ambiance, Level};
pub use builder::PlanBuilder;
pub use error::{ContractError, Result};
pub use facilitation::{ExecutionMode, FacilitatorObtainment, FacilitatorType};
pub use failure::{FailureInfo, FailureType};
pub use payload::{Payload, PayloadEncoding, PayloadType};
pub use plan::{
    BarrierDeclaration, BarrierPositionDeclaration, BarrierPositionType, Plan, PlanNode, RefKind,
    RefObject, SkipCondition, StepCategory, StepType,
};
pub use response::{
    BarrierResponseData, ResponseData, ResponseDataMap, RestraintResponseData, StepStatusData,
    TaskResponse, TaskStatus,
};
pub use status::Status;

/// Generate a fresh identifier for plans, executions, and correlation keys.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
