//! Orchestration Engine - callback-driven execution of pipeline plans
//!
//! Given a [`Plan`](pipeline_contracts::Plan) compiled elsewhere, the engine
//! runs it node by node and records every activation as a persisted
//! [`NodeExecution`]. Nothing blocks on external work: asynchronous steps,
//! remote tasks and child nodes park the node in a wait instance, and the
//! engine resumes it once every callback it waits on has been answered.
//!
//! # Architecture
//!
//! - [`facilitation`]: picks the execution mode of a node before it runs
//! - [`steps`]: the step executors, one trait per execution mode
//! - [`advise`]: decides what follows a terminal node (next, retry,
//!   rollback, manual intervention, end the plan)
//! - [`interrupts`]: external control of a running plan (abort, pause,
//!   resume, and resolution of nodes held for intervention)
//! - [`barrier`] / [`restraint`]: cross-branch synchronisation and
//!   concurrency limits on shared resources
//! - [`wait_notify`] / [`timers`]: the persisted waits and deadlines that
//!   let a plan survive a restart
//! - [`event_log`] / [`events`]: ordered status history and the live
//!   event stream
//! - [`persistence`]: in-memory and SQLite stores behind one repository
//!   trait
//!
//! # Example
//!
//! ```ignore
//! use orchestration_engine::{EngineConfig, ExecutionMetadata, OrchestrationEngine};
//!
//! let engine = OrchestrationEngine::builder(EngineConfig::default())
//!     .register_step("SHELL", shell_step)?
//!     .build()?;
//! let execution = engine
//!     .start_plan_execution(plan, ExecutionMetadata::default())
//!     .await?;
//! ```

pub mod advise;
pub mod barrier;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod events;
pub mod execution;
pub mod facilitation;
pub mod interrupts;
pub mod outputs;
pub mod persistence;
pub mod registry;
pub mod restraint;
pub mod steps;
pub mod timers;
pub mod validation;
pub mod wait_notify;

// Re-export key types
pub use config::{EngineConfig, StoreConfig};
pub use dispatch::{DispatchedTask, QueuedTaskDispatcher, TaskDispatcher, TaskRequest};
pub use engine::{EngineBuilder, OrchestrationEngine};
pub use error::{EngineError, Result};
pub use event_log::{EventLogEntry, OrchestrationEventHandler};
pub use events::{ChannelEventSink, EventSink, NullEventSink, OrchestrationEvent, VecEventSink};
pub use execution::{ExecutionMetadata, NodeExecution, PlanExecution};
pub use interrupts::{Interrupt, InterruptRequest, InterruptType};
pub use persistence::Stores;
pub use steps::{
    AsyncExecutable, AsyncStep, ChainLink, ChainProgress, ChildStep, ChildrenSpec, ChildrenStep,
    Step, StepContext, StepError, StepInputPackage, StepResponse, StepResult, SyncStep,
    TaskChainStep, TaskStep,
};
