//! Hand-off of remote work to the worker pool
//!
//! The engine only submits and aborts; the worker reports completion back
//! through `OrchestrationEngine::handle_task_response` with the task id it
//! was given.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_contracts::{generate_uuid, Ambiance, Payload};
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};

/// Work for a remote worker
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_type: String,
    pub payload: Payload,
    /// Selectors a worker must match
    pub capabilities: Vec<String>,
    /// Overrides the configured task timeout
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            capabilities: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A request together with the activation it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSubmission {
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    pub request: TaskRequest,
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Submit a task; the returned id is the task's callback id
    async fn submit(&self, submission: TaskSubmission) -> Result<String>;

    /// Best-effort cancellation of a submitted task
    async fn abort(&self, task_id: &str) -> Result<()>;
}

/// Dispatcher used when the host configured none
pub struct UnconfiguredTaskDispatcher;

#[async_trait]
impl TaskDispatcher for UnconfiguredTaskDispatcher {
    async fn submit(&self, submission: TaskSubmission) -> Result<String> {
        Err(EngineError::Dispatch(format!(
            "no task dispatcher configured for task type '{}'",
            submission.request.task_type
        )))
    }

    async fn abort(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }
}

/// A submitted task as seen by the consumer
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedTask {
    pub task_id: String,
    pub submission: TaskSubmission,
}

/// Dispatcher that queues tasks on a channel for an external consumer
pub struct QueuedTaskDispatcher {
    sender: mpsc::UnboundedSender<DispatchedTask>,
    aborted: Mutex<HashSet<String>>,
}

impl QueuedTaskDispatcher {
    /// Create a dispatcher and the receiving end workers pull from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchedTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                aborted: Mutex::new(HashSet::new()),
            },
            receiver,
        )
    }

    /// Whether the engine asked to abort this task
    pub fn is_aborted(&self, task_id: &str) -> bool {
        self.aborted.lock().contains(task_id)
    }
}

#[async_trait]
impl TaskDispatcher for QueuedTaskDispatcher {
    async fn submit(&self, submission: TaskSubmission) -> Result<String> {
        let task_id = generate_uuid();
        log::debug!(
            "Queueing task '{}' ({}) for node execution '{}'",
            task_id,
            submission.request.task_type,
            submission.node_execution_id
        );
        self.sender
            .send(DispatchedTask {
                task_id: task_id.clone(),
                submission,
            })
            .map_err(|_| EngineError::Dispatch("task queue closed".to_string()))?;
        Ok(task_id)
    }

    async fn abort(&self, task_id: &str) -> Result<()> {
        log::debug!("Aborting task '{}'", task_id);
        self.aborted.lock().insert(task_id.to_string());
        Ok(())
    }
}
