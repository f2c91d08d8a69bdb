mod common;

use std::sync::Arc;

use common::*;
use orchestration_engine::advise::{IgnoreAdviserParameters, RetryAdviserParameters};
use orchestration_engine::steps::{ChildChainParameters, ForkParameters, CHILD_CHAIN_STEP, FORK_STEP};
use orchestration_engine::{
    EngineError, ExecutionMetadata, OrchestrationEvent, VecEventSink,
};
use pipeline_contracts::{
    AdviserType, FailureType, Payload, PlanBuilder, RefKind, RefObject, RepairActionCode,
    StepCategory, StepType, Status,
};

#[tokio::test]
async fn test_linear_chain_runs_to_success() {
    let record = Arc::new(CountingStep::default());
    let engine = builder()
        .register_step("RECORD", sync_step(&record))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("linear")
        .add_node("a", "checkout", StepType::step("RECORD"))
        .with_adviser(AdviserType::NextStage, next_stage("b"))
        .add_node("b", "compile", StepType::step("RECORD"))
        .with_adviser(AdviserType::NextStage, next_stage("c"))
        .add_node("c", "package", StepType::step("RECORD"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Succeeded);
    assert!(execution.end_ts.is_some());
    assert_eq!(record.calls(), 3);

    let checkout = current(&engine, &execution.uuid, "checkout");
    let compile = current(&engine, &execution.uuid, "compile");
    let package = current(&engine, &execution.uuid, "package");
    assert_eq!(checkout.next_id.as_deref(), Some(compile.uuid.as_str()));
    assert_eq!(compile.previous_id.as_deref(), Some(checkout.uuid.as_str()));
    assert_eq!(package.previous_id.as_deref(), Some(compile.uuid.as_str()));
    assert!(package.next_id.is_none());
    for node in [&checkout, &compile, &package] {
        assert_eq!(node.status, Status::Succeeded);
        assert!(node.start_ts.is_some() && node.end_ts.is_some());
        assert!(node.parent_id.is_none());
    }
}

#[tokio::test]
async fn test_outputs_are_shared_within_a_stage() {
    let consume = Arc::new(ConsumeStep::default());
    let engine = builder()
        .register_step("PUBLISH", sync_step(&Arc::new(PublishStep)))
        .unwrap()
        .register_step("CONSUME", sync_step(&consume))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("stage-outputs")
        .add_node(
            "stage",
            "build-stage",
            StepType::new(CHILD_CHAIN_STEP, StepCategory::Stage),
        )
        .with_group("STAGE")
        .with_parameters(
            Payload::encode(&ChildChainParameters {
                child_node_id: "build".into(),
            })
            .unwrap(),
        )
        .add_node("build", "build", StepType::step("PUBLISH"))
        .with_adviser(AdviserType::NextStage, next_stage("test"))
        .add_node("test", "test", StepType::step("CONSUME"))
        .with_ref_object(RefObject::sweeping_output("artifact"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Succeeded);
    let seen = consume.seen.lock().clone();
    assert_eq!(
        seen,
        vec![Artifact {
            name: "app.tar.gz".into(),
            size: 2048
        }]
    );

    let stage = current(&engine, &execution.uuid, "build-stage");
    let test = current(&engine, &execution.uuid, "test");
    assert_eq!(test.parent_id.as_deref(), Some(stage.uuid.as_str()));
    assert_eq!(test.ambiance.fqn(), "build-stage.test");

    let outputs = engine.outputs().list_for_plan(&execution.uuid).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].kind, RefKind::SweepingOutput);
    assert_eq!(outputs[0].scope, stage.uuid);
}

#[tokio::test]
async fn test_retry_adviser_reruns_failed_node() {
    let flaky = Arc::new(FlakyStep::new(2));
    let engine = builder()
        .register_step("FLAKY", sync_step(&flaky))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("retry")
        .add_node("deploy", "deploy", StepType::step("FLAKY"))
        .with_adviser(AdviserType::Retry, Payload::encode(&retries(3)).unwrap())
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Succeeded);
    assert_eq!(flaky.calls(), 3);

    let attempts = executions_of(&engine, &execution.uuid, "deploy");
    assert_eq!(attempts.len(), 3);
    let retried: Vec<_> = attempts.iter().filter(|n| n.old_retry).collect();
    assert_eq!(retried.len(), 2);
    for attempt in &retried {
        assert_eq!(attempt.status, Status::Failed);
        assert_eq!(attempt.retry_ids.len(), 1);
    }

    let last = current(&engine, &execution.uuid, "deploy");
    assert_eq!(last.status, Status::Succeeded);
    assert_eq!(last.retry_index(), 2);

    let started = engine
        .event_log(&execution.uuid)
        .unwrap()
        .into_iter()
        .filter(|e| e.payload.to == Status::Running)
        .count();
    assert_eq!(started, 3);
}

#[tokio::test]
async fn test_exhausted_retries_can_ignore_and_continue() {
    let broken = Arc::new(FlakyStep::new(usize::MAX));
    let notify = Arc::new(CountingStep::default());
    let engine = builder()
        .register_step("BROKEN", sync_step(&broken))
        .unwrap()
        .register_step("NOTIFY", sync_step(&notify))
        .unwrap()
        .build()
        .unwrap();
    let params = RetryAdviserParameters {
        retry_count: 1,
        repair_action_on_exhaustion: RepairActionCode::Ignore,
        next_node_id: Some("notify".into()),
        ..Default::default()
    };
    let plan = PlanBuilder::new("exhausted")
        .add_node("deploy", "deploy", StepType::step("BROKEN"))
        .with_adviser(AdviserType::Retry, Payload::encode(&params).unwrap())
        .add_node("notify", "notify", StepType::step("NOTIFY"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Succeeded);
    assert_eq!(broken.calls(), 2);
    assert_eq!(notify.calls(), 1);
    let deploy = current(&engine, &execution.uuid, "deploy");
    assert_eq!(deploy.status, Status::IgnoreFailed);
    assert!(deploy.failure_info.is_some());
}

#[tokio::test]
async fn test_unadvised_failure_fails_the_plan() {
    let broken = Arc::new(FlakyStep::new(usize::MAX));
    let engine = builder()
        .register_step("BROKEN", sync_step(&broken))
        .unwrap()
        .register_step("RECORD", sync_step(&Arc::new(CountingStep::default())))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("fails")
        .add_node("lint", "lint", StepType::step("BROKEN"))
        .with_adviser(AdviserType::NextStage, next_stage("publish"))
        .add_node("publish", "publish", StepType::step("RECORD"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Failed);
    let lint = current(&engine, &execution.uuid, "lint");
    assert_eq!(lint.status, Status::Failed);
    assert_eq!(
        lint.failure_info.unwrap().message,
        "lint failed on call 1"
    );
    assert!(executions_of(&engine, &execution.uuid, "publish").is_empty());
}

#[tokio::test]
async fn test_ignore_adviser_matches_failure_types() {
    let engine = builder()
        .register_step("BROKEN", sync_step(&Arc::new(FlakyStep::new(usize::MAX))))
        .unwrap()
        .build()
        .unwrap();
    let only_timeouts = IgnoreAdviserParameters {
        failure_types: [FailureType::Timeout].into_iter().collect(),
        next_node_id: None,
    };
    let plan = PlanBuilder::new("ignore-types")
        .add_node("scan", "scan", StepType::step("BROKEN"))
        .with_adviser(AdviserType::Ignore, Payload::encode(&only_timeouts).unwrap())
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    // An untyped failure only matches an adviser listing UNKNOWN
    assert_eq!(execution.status, Status::Failed);
}

#[tokio::test]
async fn test_fork_limits_concurrent_children() {
    let external = Arc::new(ExternalStep::default());
    let engine = builder()
        .register_step("EXTERNAL", async_step(&external))
        .unwrap()
        .build()
        .unwrap();
    let fork = ForkParameters {
        child_node_ids: vec!["us".into(), "eu".into(), "ap".into()],
        max_concurrency: Some(2),
    };
    let plan = PlanBuilder::new("fork")
        .add_node("regions", "regions", StepType::new(FORK_STEP, StepCategory::Fork))
        .with_parameters(Payload::encode(&fork).unwrap())
        .add_node("us", "deploy-us", StepType::step("EXTERNAL"))
        .add_node("eu", "deploy-eu", StepType::step("EXTERNAL"))
        .add_node("ap", "deploy-ap", StepType::step("EXTERNAL"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();
    assert_eq!(execution.status, Status::Running);

    let regions = current(&engine, &execution.uuid, "regions");
    let children = || {
        engine
            .node_executions(&execution.uuid)
            .unwrap()
            .into_iter()
            .filter(|n| n.parent_id.as_deref() == Some(regions.uuid.as_str()))
            .collect::<Vec<_>>()
    };

    let started = children();
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|c| c.status == Status::Running));

    assert!(engine
        .handle_async_response(&started[0].uuid, callback_data())
        .await
        .unwrap());
    let started = children();
    assert_eq!(started.len(), 3);
    assert_eq!(
        started.iter().filter(|c| c.status == Status::Running).count(),
        2
    );

    for child in started.iter().filter(|c| c.status == Status::Running) {
        engine
            .handle_async_response(&child.uuid, callback_data())
            .await
            .unwrap();
    }

    let execution = engine.plan_execution(&execution.uuid).unwrap().unwrap();
    assert_eq!(execution.status, Status::Succeeded);
    assert_eq!(
        current(&engine, &execution.uuid, "regions").status,
        Status::Succeeded
    );
}

#[tokio::test]
async fn test_fork_folds_child_failure() {
    let engine = builder()
        .register_step("RECORD", sync_step(&Arc::new(CountingStep::default())))
        .unwrap()
        .register_step("BROKEN", sync_step(&Arc::new(FlakyStep::new(usize::MAX))))
        .unwrap()
        .build()
        .unwrap();
    let fork = ForkParameters {
        child_node_ids: vec!["unit".into(), "e2e".into()],
        max_concurrency: None,
    };
    let plan = PlanBuilder::new("fork-failure")
        .add_node("tests", "tests", StepType::new(FORK_STEP, StepCategory::Fork))
        .with_parameters(Payload::encode(&fork).unwrap())
        .add_node("unit", "unit", StepType::step("RECORD"))
        .add_node("e2e", "e2e", StepType::step("BROKEN"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Failed);
    let tests = current(&engine, &execution.uuid, "tests");
    assert_eq!(tests.status, Status::Failed);
    assert_eq!(
        tests.failure_info.unwrap().message,
        "e2e failed on call 1"
    );
    assert_eq!(current(&engine, &execution.uuid, "unit").status, Status::Succeeded);
}

#[tokio::test]
async fn test_skip_condition_skips_and_advances() {
    let record = Arc::new(CountingStep::default());
    let engine = builder()
        .register_step("RECORD", sync_step(&record))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("skip")
        .add_node("approve", "approve", StepType::step("RECORD"))
        .with_skip_condition("true")
        .with_adviser(AdviserType::NextStage, next_stage("ship"))
        .add_node("ship", "ship", StepType::step("RECORD"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Succeeded);
    assert_eq!(record.calls(), 1);
    let approve = current(&engine, &execution.uuid, "approve");
    assert_eq!(approve.status, Status::Skipped);
    assert!(approve.start_ts.is_none());
    assert_eq!(current(&engine, &execution.uuid, "ship").status, Status::Succeeded);
}

#[tokio::test]
async fn test_panicking_step_is_errored() {
    let engine = builder()
        .register_step("PANIC", sync_step(&Arc::new(PanickingStep)))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("panic")
        .add_node("explode", "explode", StepType::step("PANIC"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Errored);
    let node = current(&engine, &execution.uuid, "explode");
    assert_eq!(node.status, Status::Errored);
    let failure = node.failure_info.unwrap();
    assert!(failure.message.contains("disk on fire"));
    assert!(failure.failure_types.contains(&FailureType::Unknown));
}

#[tokio::test]
async fn test_invalid_plan_is_rejected_before_running() {
    let engine = builder().build().unwrap();
    let plan = PlanBuilder::new("invalid")
        .add_node("a", "a", StepType::step("NOT_REGISTERED"))
        .with_adviser(AdviserType::NextStage, next_stage("missing"))
        .build();

    let err = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap_err();

    match err {
        EngineError::Validation(message) => {
            assert!(message.contains("NOT_REGISTERED"));
            assert!(message.contains("missing"));
        }
        other => panic!("expected a validation error, got {}", other),
    }
    assert!(engine.plan_executions().unwrap().is_empty());
}

#[tokio::test]
async fn test_status_changes_reach_the_event_sink() {
    let sink = Arc::new(VecEventSink::new());
    let engine = builder()
        .with_event_sink(sink.clone())
        .register_step("RECORD", sync_step(&Arc::new(CountingStep::default())))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("events")
        .add_node("a", "a", StepType::step("RECORD"))
        .with_adviser(AdviserType::NextStage, next_stage("b"))
        .add_node("b", "b", StepType::step("RECORD"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    let events = sink.events();
    let plan_statuses: Vec<Status> = events
        .iter()
        .filter_map(|e| match e {
            OrchestrationEvent::PlanStatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(plan_statuses, vec![Status::Running, Status::Succeeded]);

    let node_changes: Vec<(String, Status, u64)> = events
        .iter()
        .filter_map(|e| match e {
            OrchestrationEvent::NodeStatusChanged {
                identifier,
                to,
                sequence,
                ..
            } => Some((identifier.clone(), *to, *sequence)),
            _ => None,
        })
        .collect();
    assert_eq!(
        node_changes
            .iter()
            .map(|(id, to, _)| (id.as_str(), *to))
            .collect::<Vec<_>>(),
        vec![
            ("a", Status::Running),
            ("a", Status::Succeeded),
            ("b", Status::Running),
            ("b", Status::Succeeded),
        ]
    );
    assert!(node_changes.windows(2).all(|w| w[0].2 < w[1].2));
    assert!(events
        .iter()
        .all(|e| e.plan_execution_id() == execution.uuid));
    assert_eq!(engine.event_log(&execution.uuid).unwrap().len(), 4);
}

#[tokio::test]
async fn test_same_plan_runs_twice() {
    let record = Arc::new(CountingStep::default());
    let engine = builder()
        .register_step("RECORD", sync_step(&record))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("repeat")
        .add_node("a", "a", StepType::step("RECORD"))
        .build();

    let first = engine
        .start_plan_execution(plan.clone(), ExecutionMetadata::default())
        .await
        .unwrap();
    let second = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_ne!(first.uuid, second.uuid);
    assert_eq!(second.status, Status::Succeeded);
    assert_eq!(record.calls(), 2);
    assert_eq!(engine.plan_executions().unwrap().len(), 2);
}
