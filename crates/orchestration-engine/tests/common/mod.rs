//! Steps and helpers shared by the engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use orchestration_engine::advise::{NextStageParameters, RetryAdviserParameters};
use orchestration_engine::{
    AsyncExecutable, AsyncStep, EngineBuilder, EngineConfig, NodeExecution, OrchestrationEngine,
    Step, StepContext, StepError, StepResponse, StepResult, SyncStep,
};
use parking_lot::Mutex;
use pipeline_contracts::{Payload, PayloadType, ResponseData, ResponseDataMap};
use serde::{Deserialize, Serialize};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn builder() -> EngineBuilder {
    init_logging();
    OrchestrationEngine::builder(EngineConfig::default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub size: u64,
}

impl PayloadType for Artifact {
    const KIND: &'static str = "artifact";
}

pub fn next_stage(next_node_id: &str) -> Payload {
    Payload::encode(&NextStageParameters {
        next_node_id: Some(next_node_id.to_string()),
    })
    .unwrap()
}

pub fn retries(retry_count: u32) -> RetryAdviserParameters {
    RetryAdviserParameters {
        retry_count,
        ..Default::default()
    }
}

/// Succeeds and counts its calls
#[derive(Default)]
pub struct CountingStep {
    pub calls: AtomicUsize,
}

impl CountingStep {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncStep for CountingStep {
    async fn execute_sync(&self, _ctx: &StepContext<'_>) -> StepResult<StepResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepResponse::succeeded())
    }
}

/// Fails its first `failures` calls, then succeeds
pub struct FlakyStep {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyStep {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncStep for FlakyStep {
    async fn execute_sync(&self, ctx: &StepContext<'_>) -> StepResult<StepResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StepError::failure(format!(
                "{} failed on call {}",
                ctx.node.identifier,
                call + 1
            )));
        }
        Ok(StepResponse::succeeded())
    }
}

pub struct PanickingStep;

#[async_trait]
impl SyncStep for PanickingStep {
    async fn execute_sync(&self, _ctx: &StepContext<'_>) -> StepResult<StepResponse> {
        panic!("disk on fire");
    }
}

/// Publishes an artifact into the enclosing `STAGE` group
pub struct PublishStep;

#[async_trait]
impl SyncStep for PublishStep {
    async fn execute_sync(&self, _ctx: &StepContext<'_>) -> StepResult<StepResponse> {
        let artifact = Artifact {
            name: "app.tar.gz".to_string(),
            size: 2048,
        };
        Ok(StepResponse::succeeded().with_output(
            "artifact",
            Payload::encode(&artifact)?,
            Some("STAGE"),
        ))
    }
}

/// Reads the `artifact` input and remembers it
#[derive(Default)]
pub struct ConsumeStep {
    pub seen: Mutex<Vec<Artifact>>,
}

#[async_trait]
impl SyncStep for ConsumeStep {
    async fn execute_sync(&self, ctx: &StepContext<'_>) -> StepResult<StepResponse> {
        let artifact: Artifact = ctx.inputs.value("artifact")?;
        self.seen.lock().push(artifact);
        Ok(StepResponse::succeeded())
    }
}

/// Waits for one callback under its own node execution id
#[derive(Default)]
pub struct ExternalStep {
    pub aborts: AtomicUsize,
}

impl ExternalStep {
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsyncStep for ExternalStep {
    async fn execute_async(&self, ctx: &StepContext<'_>) -> StepResult<AsyncExecutable> {
        Ok(AsyncExecutable::running(vec![ctx.node_execution_id.to_string()]))
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext<'_>,
        responses: &ResponseDataMap,
    ) -> StepResult<StepResponse> {
        if responses.is_empty() {
            return Err(StepError::UnexpectedResponse("no callback data".to_string()));
        }
        Ok(StepResponse::succeeded())
    }

    async fn handle_abort(&self, _ctx: &StepContext<'_>, _callback_ids: &[String]) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn sync_step<S: SyncStep + 'static>(step: &Arc<S>) -> Step {
    Step::Sync(step.clone())
}

pub fn async_step<S: AsyncStep + 'static>(step: &Arc<S>) -> Step {
    Step::Async(step.clone())
}

pub fn callback_data() -> ResponseData {
    ResponseData::Payload(Payload::empty())
}

/// Node executions of a plan run activating the plan node `identifier`
pub fn executions_of(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
    identifier: &str,
) -> Vec<NodeExecution> {
    engine
        .node_executions(plan_execution_id)
        .unwrap()
        .into_iter()
        .filter(|n| n.identifier == identifier)
        .collect()
}

/// The single current (not retried) activation of `identifier`
pub fn current(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
    identifier: &str,
) -> NodeExecution {
    let mut current: Vec<_> = executions_of(engine, plan_execution_id, identifier)
        .into_iter()
        .filter(|n| !n.old_retry)
        .collect();
    assert_eq!(current.len(), 1, "expected one current '{}'", identifier);
    current.remove(0)
}
