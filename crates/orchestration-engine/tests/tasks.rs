mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use orchestration_engine::{
    ChainLink, ChainProgress, DispatchedTask, EngineConfig, ExecutionMetadata, InterruptRequest,
    InterruptType, OrchestrationEngine, QueuedTaskDispatcher, Step, StepContext, StepResponse,
    StepResult, TaskChainStep, TaskRequest, TaskStep,
};
use pipeline_contracts::{
    FailureType, Payload, PayloadType, Plan, PlanBuilder, StepType, Status, TaskResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Script {
    command: String,
}

impl PayloadType for Script {
    const KIND: &'static str = "script";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Progress {
    done: u32,
}

impl PayloadType for Progress {
    const KIND: &'static str = "progress";
}

/// Runs one shell command on a worker
struct ShellStep {
    timeout: Option<Duration>,
}

#[async_trait]
impl TaskStep for ShellStep {
    async fn obtain_task(&self, ctx: &StepContext<'_>) -> StepResult<TaskRequest> {
        let script = Script {
            command: format!("make {}", ctx.node.identifier),
        };
        let request = TaskRequest::new("shell", Payload::encode(&script)?);
        Ok(match self.timeout {
            Some(timeout) => request.with_timeout(timeout),
            None => request,
        })
    }
}

/// Uploads in `parts` sequential tasks
struct UploadStep {
    parts: u32,
}

fn upload_part(part: u32) -> StepResult<TaskRequest> {
    Ok(TaskRequest::new(
        "upload",
        Payload::encode(&Script {
            command: format!("upload part {}", part),
        })?,
    ))
}

#[async_trait]
impl TaskChainStep for UploadStep {
    async fn start_chain_link(&self, _ctx: &StepContext<'_>) -> StepResult<ChainLink> {
        Ok(ChainLink {
            task: upload_part(1)?,
            pass_through: Payload::encode(&Progress::default())?,
        })
    }

    async fn execute_next_link(
        &self,
        _ctx: &StepContext<'_>,
        pass_through: &Payload,
        _link_index: u32,
        _response: &TaskResponse,
    ) -> StepResult<ChainProgress> {
        let mut progress: Progress = pass_through.decode()?;
        progress.done += 1;
        if progress.done >= self.parts {
            return Ok(ChainProgress::Finalize);
        }
        Ok(ChainProgress::Next(ChainLink {
            task: upload_part(progress.done + 1)?,
            pass_through: Payload::encode(&progress)?,
        }))
    }

    async fn finalize_execution(
        &self,
        _ctx: &StepContext<'_>,
        _pass_through: &Payload,
        response: &TaskResponse,
    ) -> StepResult<StepResponse> {
        Ok(StepResponse::succeeded().with_outcome("upload", response.payload.clone()))
    }
}

struct Harness {
    engine: Arc<OrchestrationEngine>,
    dispatcher: Arc<QueuedTaskDispatcher>,
    tasks: UnboundedReceiver<DispatchedTask>,
}

impl Harness {
    fn new(config: EngineConfig, step_type: &str, step: Step) -> Self {
        init_logging();
        let (dispatcher, tasks) = QueuedTaskDispatcher::channel();
        let dispatcher = Arc::new(dispatcher);
        let engine = OrchestrationEngine::builder(config)
            .with_dispatcher(dispatcher.clone())
            .register_step(step_type, step)
            .unwrap()
            .build()
            .unwrap();
        Self {
            engine,
            dispatcher,
            tasks,
        }
    }

    fn next_task(&mut self) -> DispatchedTask {
        self.tasks.try_recv().expect("a dispatched task")
    }
}

fn single_node(step_type: &str) -> Plan {
    PlanBuilder::new("tasks")
        .add_node("build", "build", StepType::step(step_type))
        .build()
}

fn shell(timeout: Option<Duration>) -> Step {
    Step::Task(Arc::new(ShellStep { timeout }))
}

#[tokio::test]
async fn test_task_result_completes_node() {
    let mut harness = Harness::new(EngineConfig::default(), "SHELL", shell(None));
    let execution = harness
        .engine
        .start_plan_execution(single_node("SHELL"), ExecutionMetadata::default())
        .await
        .unwrap();
    let build = current(&harness.engine, &execution.uuid, "build");
    assert_eq!(build.status, Status::Running);

    let task = harness.next_task();
    assert_eq!(task.submission.node_execution_id, build.uuid);
    assert_eq!(task.submission.request.task_type, "shell");
    let script: Script = task.submission.request.payload.decode().unwrap();
    assert_eq!(script.command, "make build");
    assert_eq!(task.submission.ambiance.plan_execution_id, execution.uuid);

    assert!(harness
        .engine
        .handle_task_response(&task.task_id, TaskResponse::success(Payload::empty()))
        .await
        .unwrap());

    let execution = harness
        .engine
        .plan_execution(&execution.uuid)
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, Status::Succeeded);

    // A second delivery of the same result changes nothing
    assert!(!harness
        .engine
        .handle_task_response(&task.task_id, TaskResponse::success(Payload::empty()))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_task_failure_fails_node() {
    let mut harness = Harness::new(EngineConfig::default(), "SHELL", shell(None));
    let execution = harness
        .engine
        .start_plan_execution(single_node("SHELL"), ExecutionMetadata::default())
        .await
        .unwrap();
    let task = harness.next_task();

    harness
        .engine
        .handle_task_response(&task.task_id, TaskResponse::failure("exit code 2"))
        .await
        .unwrap();

    let build = current(&harness.engine, &execution.uuid, "build");
    assert_eq!(build.status, Status::Failed);
    assert_eq!(build.failure_info.unwrap().message, "exit code 2");
    assert_eq!(
        harness
            .engine
            .plan_execution(&execution.uuid)
            .unwrap()
            .unwrap()
            .status,
        Status::Failed
    );
}

#[tokio::test]
async fn test_missing_dispatcher_fails_with_provisioning_error() {
    let engine = builder()
        .register_step("SHELL", shell(None))
        .unwrap()
        .build()
        .unwrap();

    let execution = engine
        .start_plan_execution(single_node("SHELL"), ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Failed);
    let failure = current(&engine, &execution.uuid, "build")
        .failure_info
        .unwrap();
    assert!(failure
        .failure_types
        .contains(&FailureType::DelegateProvisioning));
    assert!(failure.message.contains("no task dispatcher configured"));
}

#[tokio::test]
async fn test_task_chain_runs_links_in_order() {
    let mut harness = Harness::new(
        EngineConfig::default(),
        "UPLOAD",
        Step::TaskChain(Arc::new(UploadStep { parts: 3 })),
    );
    let execution = harness
        .engine
        .start_plan_execution(single_node("UPLOAD"), ExecutionMetadata::default())
        .await
        .unwrap();

    let mut commands = Vec::new();
    for _ in 0..3 {
        let task = harness.next_task();
        let script: Script = task.submission.request.payload.decode().unwrap();
        commands.push(script.command);
        harness
            .engine
            .handle_task_response(&task.task_id, TaskResponse::success(Payload::empty()))
            .await
            .unwrap();
    }

    assert_eq!(
        commands,
        vec!["upload part 1", "upload part 2", "upload part 3"]
    );
    assert!(harness.tasks.try_recv().is_err());
    assert_eq!(
        harness
            .engine
            .plan_execution(&execution.uuid)
            .unwrap()
            .unwrap()
            .status,
        Status::Succeeded
    );
}

#[tokio::test]
async fn test_task_chain_length_is_capped() {
    let config = EngineConfig {
        max_task_chain_length: 2,
        ..Default::default()
    };
    let mut harness = Harness::new(
        config,
        "UPLOAD",
        Step::TaskChain(Arc::new(UploadStep { parts: 5 })),
    );
    let execution = harness
        .engine
        .start_plan_execution(single_node("UPLOAD"), ExecutionMetadata::default())
        .await
        .unwrap();

    for _ in 0..2 {
        let task = harness.next_task();
        harness
            .engine
            .handle_task_response(&task.task_id, TaskResponse::success(Payload::empty()))
            .await
            .unwrap();
    }

    let upload = current(&harness.engine, &execution.uuid, "build");
    assert_eq!(upload.status, Status::Failed);
    assert_eq!(
        upload.failure_info.unwrap().message,
        "task chain exceeded 2 links"
    );
    assert!(harness.tasks.try_recv().is_err());
}

#[tokio::test]
async fn test_abort_cancels_dispatched_task() {
    let mut harness = Harness::new(EngineConfig::default(), "SHELL", shell(None));
    let execution = harness
        .engine
        .start_plan_execution(single_node("SHELL"), ExecutionMetadata::default())
        .await
        .unwrap();
    let task = harness.next_task();
    assert!(!harness.dispatcher.is_aborted(&task.task_id));

    harness
        .engine
        .register_interrupt(InterruptRequest::for_plan(
            InterruptType::Abort,
            &execution.uuid,
        ))
        .await
        .unwrap();

    assert!(harness.dispatcher.is_aborted(&task.task_id));
    assert_eq!(
        current(&harness.engine, &execution.uuid, "build").status,
        Status::Aborted
    );
}

#[tokio::test]
async fn test_task_deadline_expires_node() {
    let mut harness = Harness::new(
        EngineConfig::default(),
        "SHELL",
        shell(Some(Duration::from_secs(30))),
    );
    let execution = harness
        .engine
        .start_plan_execution(single_node("SHELL"), ExecutionMetadata::default())
        .await
        .unwrap();
    let task = harness.next_task();
    assert_eq!(
        task.submission.request.timeout,
        Some(Duration::from_secs(30))
    );

    let fired = harness
        .engine
        .run_due_timers(Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();

    assert_eq!(fired, 1);
    let build = current(&harness.engine, &execution.uuid, "build");
    assert_eq!(build.status, Status::Expired);
    assert!(build
        .failure_info
        .unwrap()
        .failure_types
        .contains(&FailureType::Timeout));
    assert!(harness.dispatcher.is_aborted(&task.task_id));
    assert_eq!(
        harness
            .engine
            .plan_execution(&execution.uuid)
            .unwrap()
            .unwrap()
            .status,
        Status::Expired
    );

    let late = harness
        .engine
        .handle_task_response(&task.task_id, TaskResponse::success(Payload::empty()))
        .await
        .unwrap();
    assert!(!late);
}
