mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use orchestration_engine::barrier::BarrierState;
use orchestration_engine::restraint::HoldingScope;
use orchestration_engine::steps::{
    BarrierStepParameters, ChildChainParameters, ForkParameters, RestraintStepParameters,
    BARRIER_STEP, CHILD_CHAIN_STEP, FORK_STEP, RESOURCE_RESTRAINT_STEP,
};
use orchestration_engine::ExecutionMetadata;
use pipeline_contracts::{
    AdviserType, FailureType, Payload, Plan, PlanBuilder, StepCategory, StepType, Status,
};

fn barrier_params(timeout: Option<Duration>) -> Payload {
    Payload::encode(&BarrierStepParameters {
        barrier_identifier: "sync".into(),
        timeout,
    })
    .unwrap()
}

fn restraint_params(holding_scope: HoldingScope) -> Payload {
    Payload::encode(&RestraintStepParameters {
        resource_unit: "deploy-slot".into(),
        capacity: 1,
        holding_scope,
    })
    .unwrap()
}

#[tokio::test]
async fn test_barrier_releases_parallel_branches() {
    let engine = builder().build().unwrap();
    let fork = ForkParameters {
        child_node_ids: vec!["left".into(), "right".into()],
        max_concurrency: None,
    };
    let plan = PlanBuilder::new("barrier")
        .add_node("branches", "branches", StepType::new(FORK_STEP, StepCategory::Fork))
        .with_parameters(Payload::encode(&fork).unwrap())
        .add_node("left", "left", StepType::step(BARRIER_STEP))
        .with_parameters(barrier_params(None))
        .add_node("right", "right", StepType::step(BARRIER_STEP))
        .with_parameters(barrier_params(None))
        .add_barrier("sync", ["left", "right"])
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();

    assert_eq!(execution.status, Status::Succeeded);
    assert_eq!(current(&engine, &execution.uuid, "left").status, Status::Succeeded);
    assert_eq!(current(&engine, &execution.uuid, "right").status, Status::Succeeded);
    let barrier = engine
        .barriers()
        .find(&execution.uuid, "sync")
        .unwrap()
        .unwrap();
    assert_eq!(barrier.state, BarrierState::Down);
    assert!(barrier.positions.iter().all(|p| p.arrived()));
}

#[tokio::test]
async fn test_barrier_times_out_without_all_arrivals() {
    let engine = builder()
        .register_step("RECORD", sync_step(&Arc::new(CountingStep::default())))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("lonely-barrier")
        .add_node("left", "left", StepType::step(BARRIER_STEP))
        .with_parameters(barrier_params(Some(Duration::from_secs(30))))
        .add_node("ghost", "ghost", StepType::step("RECORD"))
        .add_barrier("sync", ["left", "ghost"])
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();
    let left = current(&engine, &execution.uuid, "left");
    assert_eq!(left.status, Status::Waiting);

    let fired = engine
        .run_due_timers(Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();

    assert_eq!(fired, 1);
    let left = engine.node_execution(&left.uuid).unwrap().unwrap();
    assert_eq!(left.status, Status::Failed);
    let failure = left.failure_info.unwrap();
    assert!(failure.failure_types.contains(&FailureType::Timeout));
    assert!(failure.message.contains("sync"));
    let barrier = engine
        .barriers()
        .find(&execution.uuid, "sync")
        .unwrap()
        .unwrap();
    assert_eq!(barrier.state, BarrierState::TimedOut);
    assert_eq!(
        engine
            .plan_execution(&execution.uuid)
            .unwrap()
            .unwrap()
            .status,
        Status::Failed
    );
}

fn locked_deploy() -> Plan {
    PlanBuilder::new("locked-deploy")
        .add_node("lock", "lock", StepType::step(RESOURCE_RESTRAINT_STEP))
        .with_parameters(restraint_params(HoldingScope::Plan))
        .with_adviser(AdviserType::NextStage, next_stage("work"))
        .add_node("work", "work", StepType::step("EXTERNAL"))
        .build()
}

#[tokio::test]
async fn test_restraint_serialises_plan_runs() {
    let engine = builder()
        .register_step("EXTERNAL", async_step(&Arc::new(ExternalStep::default())))
        .unwrap()
        .build()
        .unwrap();

    let first = engine
        .start_plan_execution(locked_deploy(), ExecutionMetadata::default())
        .await
        .unwrap();
    let second = engine
        .start_plan_execution(locked_deploy(), ExecutionMetadata::default())
        .await
        .unwrap();

    let first_work = current(&engine, &first.uuid, "work");
    assert_eq!(first_work.status, Status::Running);
    assert_eq!(current(&engine, &second.uuid, "lock").status, Status::Waiting);
    assert!(executions_of(&engine, &second.uuid, "work").is_empty());
    assert_eq!(engine.restraints().active_count("deploy-slot").unwrap(), 1);
    let unit = engine.restraints().unit("deploy-slot").unwrap().unwrap();
    assert_eq!(unit.blocked.len(), 1);

    engine
        .handle_async_response(&first_work.uuid, callback_data())
        .await
        .unwrap();

    assert_eq!(
        engine.plan_execution(&first.uuid).unwrap().unwrap().status,
        Status::Succeeded
    );
    assert_eq!(current(&engine, &second.uuid, "lock").status, Status::Succeeded);
    assert_eq!(current(&engine, &second.uuid, "work").status, Status::Running);
    assert_eq!(engine.restraints().active_count("deploy-slot").unwrap(), 1);
    let unit = engine.restraints().unit("deploy-slot").unwrap().unwrap();
    assert!(unit.blocked.is_empty());
}

#[tokio::test]
async fn test_stage_scoped_restraint_released_with_stage() {
    let external = Arc::new(ExternalStep::default());
    let engine = builder()
        .register_step("EXTERNAL", async_step(&external))
        .unwrap()
        .build()
        .unwrap();
    let plan = PlanBuilder::new("stage-lock")
        .add_node(
            "deploy-stage",
            "deploy",
            StepType::new(CHILD_CHAIN_STEP, StepCategory::Stage),
        )
        .with_parameters(
            Payload::encode(&ChildChainParameters {
                child_node_id: "lock".into(),
            })
            .unwrap(),
        )
        .with_adviser(AdviserType::NextStage, next_stage("verify"))
        .add_node("lock", "lock", StepType::step(RESOURCE_RESTRAINT_STEP))
        .with_parameters(restraint_params(HoldingScope::Stage))
        .with_adviser(AdviserType::NextStage, next_stage("work"))
        .add_node("work", "work", StepType::step("EXTERNAL"))
        .add_node("verify", "verify", StepType::step("EXTERNAL"))
        .build();

    let execution = engine
        .start_plan_execution(plan, ExecutionMetadata::default())
        .await
        .unwrap();
    let work = current(&engine, &execution.uuid, "work");
    assert_eq!(work.status, Status::Running);
    assert_eq!(engine.restraints().active_count("deploy-slot").unwrap(), 1);

    engine
        .handle_async_response(&work.uuid, callback_data())
        .await
        .unwrap();

    assert_eq!(
        current(&engine, &execution.uuid, "deploy").status,
        Status::Succeeded
    );
    assert_eq!(engine.restraints().active_count("deploy-slot").unwrap(), 0);
    assert_eq!(
        current(&engine, &execution.uuid, "verify").status,
        Status::Running
    );
}
