//! Runtime execution records
//!
//! A [`PlanExecution`] is one run of a plan; a [`NodeExecution`] is one
//! activation of a plan node within that run. Records reference each
//! other by id only (parent, notify target, previous/next, retries) so that
//! every relationship survives a restart and is looked up from the store.

mod node_execution;
mod plan_execution;

pub use node_execution::{ChildSpawn, ExecutableResponse, NodeExecution, NodeExecutionService};
pub use plan_execution::{ExecutionMetadata, PlanExecution, PlanExecutionService};
