//! The orchestration engine
//!
//! Drives plan executions node by node. Every unit of progress (starting,
//! executing, resuming, concluding or ending a node) is a [`WorkItem`] on
//! the work lane of its plan execution. Callers that change state (a new
//! run, a callback, an interrupt, a fired timer) apply their change and
//! then drain whichever lanes nobody else is draining. Plan executions
//! progress independently: a slow step holds up only its own lane, and
//! interrupts and callbacks for that plan still apply their transitions
//! straight away. Waiting on the outside world is always a persisted wait
//! instance that a later callback completes.
//!
//! All state lives in the [`Stores`]; status changes go through
//! compare-and-swap, so several engine processes sharing a store never
//! apply the same transition twice.

mod builder;
mod conclude;
mod execute;
mod interrupt;
mod lanes;
mod timers;

pub use builder::EngineBuilder;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use pipeline_contracts::{
    generate_uuid, Ambiance, FailureInfo, Level, Plan, PlanNode, ResponseData, ResponseDataMap,
    Status, TaskResponse,
};

use crate::advise::AdviserRegistry;
use crate::barrier::BarrierService;
use crate::config::EngineConfig;
use crate::dispatch::TaskDispatcher;
use crate::error::{EngineError, Result};
use crate::event_log::{EventLogEntry, EventLogService};
use crate::events::{EventSink, OrchestrationEvent};
use crate::execution::{
    ExecutionMetadata, NodeExecution, NodeExecutionService, PlanExecution, PlanExecutionService,
};
use crate::facilitation::{FacilitatorRegistry, SkipConditionEvaluator};
use crate::interrupts::{Interrupt, InterruptService};
use crate::outputs::OutputService;
use crate::persistence::Stores;
use crate::restraint::ResourceRestraintService;
use crate::steps::{StepRegistry, StepServices};
use crate::timers::{TimerAction, TimerService};
use crate::validation::validate_plan;
use crate::wait_notify::{WaitEvent, WaitNotifyService};
use lanes::WorkLanes;

/// One unit of progress for a node execution
#[derive(Debug, Clone)]
enum WorkItem {
    /// Skip check and facilitation of a queued node
    Start(String),
    /// Run the step executor of a facilitated node
    Execute(String),
    /// Hand a completed wait back to the step
    Resume {
        node_execution_id: String,
        responses: ResponseDataMap,
    },
    /// Start further children of a concurrency-limited fork
    TopUp(String),
    /// Ask the advisers what follows a terminal node
    Conclude(String),
    /// Report a finished chain to its parent or the plan
    End(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Execute,
    Resume,
    TopUp,
    Conclude,
    End,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::Execute => "execute",
            Stage::Resume => "resume",
            Stage::TopUp => "top up",
            Stage::Conclude => "conclude",
            Stage::End => "end",
        };
        f.write_str(name)
    }
}

impl WorkItem {
    fn stage(&self) -> Stage {
        match self {
            WorkItem::Start(_) => Stage::Start,
            WorkItem::Execute(_) => Stage::Execute,
            WorkItem::Resume { .. } => Stage::Resume,
            WorkItem::TopUp(_) => Stage::TopUp,
            WorkItem::Conclude(_) => Stage::Conclude,
            WorkItem::End(_) => Stage::End,
        }
    }

    fn node_execution_id(&self) -> &str {
        match self {
            WorkItem::Start(id)
            | WorkItem::Execute(id)
            | WorkItem::TopUp(id)
            | WorkItem::Conclude(id)
            | WorkItem::End(id) => id,
            WorkItem::Resume {
                node_execution_id, ..
            } => node_execution_id,
        }
    }
}

/// Look up a plan node, failing when the plan does not contain it
fn plan_node<'a>(plan: &'a Plan, node_id: &str) -> Result<&'a PlanNode> {
    plan.node(node_id)
        .ok_or_else(|| EngineError::not_found("plan_nodes", node_id))
}

pub struct OrchestrationEngine {
    config: EngineConfig,
    stores: Stores,
    plans: RwLock<HashMap<String, Arc<Plan>>>,
    plan_executions: PlanExecutionService,
    node_executions: NodeExecutionService,
    event_log: Arc<EventLogService>,
    wait_notify: Arc<WaitNotifyService>,
    timers: Arc<TimerService>,
    interrupts: InterruptService,
    services: StepServices,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    dispatcher: Arc<dyn TaskDispatcher>,
    skip_conditions: Arc<dyn SkipConditionEvaluator>,
    event_sink: Arc<dyn EventSink>,
    lanes: Mutex<WorkLanes>,
}

impl OrchestrationEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn outputs(&self) -> &OutputService {
        &self.services.outputs
    }

    pub fn barriers(&self) -> &BarrierService {
        &self.services.barriers
    }

    pub fn restraints(&self) -> &ResourceRestraintService {
        &self.services.restraints
    }

    pub fn wait_notify(&self) -> &WaitNotifyService {
        &self.wait_notify
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn plan_execution(&self, uuid: &str) -> Result<Option<PlanExecution>> {
        self.plan_executions.get(uuid)
    }

    pub fn plan_executions(&self) -> Result<Vec<PlanExecution>> {
        self.plan_executions.list()
    }

    pub fn node_execution(&self, uuid: &str) -> Result<Option<NodeExecution>> {
        self.node_executions.get(uuid)
    }

    /// Every node execution of a plan run, in creation order
    pub fn node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.node_executions.find_by_plan_execution(plan_execution_id)
    }

    pub fn interrupt(&self, uuid: &str) -> Result<Option<Interrupt>> {
        self.interrupts.get(uuid)
    }

    pub fn interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.interrupts.list_for_plan(plan_execution_id)
    }

    /// The plan run's status transitions in log order
    pub fn event_log(&self, plan_execution_id: &str) -> Result<Vec<EventLogEntry>> {
        self.event_log.entries(plan_execution_id)
    }

    /// Check a plan against the registered steps, facilitators and advisers
    pub fn validate_plan(&self, plan: &Plan) -> Result<()> {
        let errors = validate_plan(plan, &self.steps, &self.facilitators, &self.advisers);
        if errors.is_empty() {
            return Ok(());
        }
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(EngineError::Validation(message))
    }

    /// Validate and store `plan`, then run it from its starting node
    ///
    /// Returns the plan execution as it stands once the engine has no more
    /// work to do without outside input.
    pub async fn start_plan_execution(
        &self,
        plan: Plan,
        metadata: ExecutionMetadata,
    ) -> Result<PlanExecution> {
        self.validate_plan(&plan)?;

        let plan = self.store_plan(plan)?;
        let start = plan_node(&plan, &plan.starting_node_id)?;
        let execution = self.plan_executions.create(&PlanExecution::running(
            generate_uuid(),
            &plan.uuid,
            metadata.clone(),
        ))?;
        log::info!(
            "Starting plan execution '{}' of plan '{}' ({} nodes)",
            execution.uuid,
            plan.uuid,
            plan.len()
        );
        self.services
            .barriers
            .instantiate(&execution.uuid, &plan.barriers)?;

        let root = Ambiance::new(&execution.uuid, &plan.uuid).with_scope(
            &metadata.account_id,
            &metadata.org_id,
            &metadata.project_id,
        );
        let uuid = generate_uuid();
        let first = NodeExecution::queued(
            &uuid,
            start,
            root.clone_for_child(Level::for_node(start, &uuid, 0)),
        );
        self.node_executions.create(&first)?;
        self.publish(OrchestrationEvent::PlanStatusChanged {
            plan_execution_id: execution.uuid.clone(),
            plan_id: plan.uuid.clone(),
            status: Status::Running,
        });

        self.enqueue(&execution.uuid, WorkItem::Start(uuid));
        self.drain(Some(execution.uuid.as_str())).await?;
        self.plan_executions.require(&execution.uuid)
    }

    /// Deliver a callback response, resuming whatever waits on it
    ///
    /// Returns `false` for duplicates and callbacks nobody waits on yet.
    pub async fn handle_async_response(&self, callback_id: &str, data: ResponseData) -> Result<bool> {
        let matched = self.wait_notify.notify(callback_id, data)?;
        self.drain(None).await?;
        Ok(matched)
    }

    /// Deliver the result of a dispatched task
    pub async fn handle_task_response(&self, task_id: &str, response: TaskResponse) -> Result<bool> {
        self.handle_async_response(task_id, ResponseData::Task(response))
            .await
    }

    /// Drain queued work and ready wait events
    pub async fn pump(&self) -> Result<()> {
        self.drain(None).await
    }

    /// Pick up work left behind by a stopped process
    ///
    /// Re-queues completed waits, unprocessed interrupts, queued nodes of
    /// running plans without a pending timer, and terminal nodes that were
    /// never advised. Returns how many items were recovered.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = self.wait_notify.recover()?;

        for interrupt in self.interrupts.unprocessed()? {
            self.process_interrupt(&interrupt.uuid).await?;
            recovered += 1;
        }

        for execution in self.plan_executions.list()? {
            if execution.status != Status::Running {
                continue;
            }
            for node in self.node_executions.find_by_plan_execution(&execution.uuid)? {
                if node.status == Status::Queued {
                    if self.requeue_queued(&node)? {
                        recovered += 1;
                    }
                } else if node.status.is_final()
                    && node.status != Status::Aborted
                    && !node.old_retry
                    && node.adviser_response.is_none()
                {
                    self.enqueue(&execution.uuid, WorkItem::Conclude(node.uuid.clone()));
                    recovered += 1;
                }
            }
        }

        log::info!("Recovered {} item(s) of unfinished work", recovered);
        self.drain(None).await?;
        Ok(recovered)
    }

    /// Remove every record of a finished plan run
    pub async fn archive_plan_execution(&self, plan_execution_id: &str) -> Result<()> {
        let execution = self.plan_executions.require(plan_execution_id)?;
        if !execution.status.is_final() {
            return Err(EngineError::invalid(format!(
                "plan execution '{}' is still {}",
                plan_execution_id, execution.status
            )));
        }
        if self.lanes.lock().is_draining(plan_execution_id) {
            return Err(EngineError::invalid(format!(
                "plan execution '{}' still has work in progress",
                plan_execution_id
            )));
        }
        self.node_executions.delete_for_plan(plan_execution_id)?;
        self.wait_notify.delete_for_plan(plan_execution_id)?;
        self.timers.delete_for_plan(plan_execution_id)?;
        self.services.outputs.delete_for_plan(plan_execution_id)?;
        self.services.barriers.delete_for_plan(plan_execution_id)?;
        self.interrupts.delete_for_plan(plan_execution_id)?;
        self.plan_executions.delete(plan_execution_id)?;
        log::info!("Archived plan execution '{}'", plan_execution_id);
        Ok(())
    }

    fn store_plan(&self, plan: Plan) -> Result<Arc<Plan>> {
        let stored = match self.stores.plans.insert(&plan) {
            Ok(stored) => stored,
            Err(EngineError::DuplicateKey { .. }) => {
                let stored = self.stores.plans.require(&plan.uuid)?;
                if stored.nodes != plan.nodes || stored.barriers != plan.barriers {
                    return Err(EngineError::invalid(format!(
                        "plan '{}' is already stored with different content",
                        plan.uuid
                    )));
                }
                stored
            }
            Err(e) => return Err(e),
        };
        let stored = Arc::new(stored);
        self.plans
            .write()
            .insert(stored.uuid.clone(), stored.clone());
        Ok(stored)
    }

    fn plan(&self, plan_id: &str) -> Result<Arc<Plan>> {
        if let Some(plan) = self.plans.read().get(plan_id) {
            return Ok(plan.clone());
        }
        let plan = Arc::new(self.stores.plans.require(plan_id)?);
        self.plans
            .write()
            .insert(plan_id.to_string(), plan.clone());
        Ok(plan)
    }

    fn enqueue(&self, plan_execution_id: &str, item: WorkItem) {
        self.lanes.lock().push(plan_execution_id, item);
    }

    fn publish(&self, event: OrchestrationEvent) {
        if let Err(e) = self.event_sink.send(event) {
            log::warn!("Failed to publish orchestration event: {}", e);
        }
    }

    /// Drain every idle lane until no unclaimed work or ready wait is left
    ///
    /// Lanes another caller is draining are left to that caller.
    async fn drain(&self, preferred: Option<&str>) -> Result<()> {
        loop {
            self.collect_wait_events();
            let Some(plan_execution_id) = self.lanes.lock().claim_idle(preferred) else {
                break;
            };
            self.drain_lane(&plan_execution_id).await;
        }
        self.event_log.process_pending()?;
        Ok(())
    }

    async fn drain_lane(&self, plan_execution_id: &str) {
        log::debug!("Draining work of plan execution '{}'", plan_execution_id);
        loop {
            self.collect_wait_events();
            let Some(item) = self.lanes.lock().pop(plan_execution_id) else {
                return;
            };
            self.process(item).await;
        }
    }

    /// Move ready wait events onto the lanes of their plans
    fn collect_wait_events(&self) {
        while let Some(event) = self.wait_notify.next_event() {
            if let Err(e) = self.on_wait_event(event) {
                log::error!("Failed to handle wait event: {}", e);
            }
        }
    }

    fn on_wait_event(&self, event: WaitEvent) -> Result<()> {
        match event {
            WaitEvent::Done {
                wait_id,
                plan_execution_id,
                node_execution_id,
            } => {
                if let Some((_, responses)) = self.wait_notify.claim(&wait_id)? {
                    self.enqueue(
                        &plan_execution_id,
                        WorkItem::Resume {
                            node_execution_id,
                            responses,
                        },
                    );
                }
            }
            WaitEvent::Progress {
                plan_execution_id,
                node_execution_id,
                ..
            } => self.enqueue(&plan_execution_id, WorkItem::TopUp(node_execution_id)),
        }
        Ok(())
    }

    async fn process(&self, item: WorkItem) {
        let stage = item.stage();
        let node_execution_id = item.node_execution_id().to_string();
        let result = match item {
            WorkItem::Start(id) => self.start_node(&id),
            WorkItem::Execute(id) => self.execute_node(&id).await,
            WorkItem::Resume {
                node_execution_id,
                responses,
            } => self.resume_node(&node_execution_id, responses).await,
            WorkItem::TopUp(id) => self.top_up_children(&id),
            WorkItem::Conclude(id) => self.conclude_node(&id).await,
            WorkItem::End(id) => self.end_node(&id),
        };
        if let Err(e) = result {
            log::error!(
                "Failed to {} node execution '{}': {}",
                stage,
                node_execution_id,
                e
            );
            if let Err(e) = self.contain_failure(stage, &node_execution_id, &e) {
                log::error!(
                    "Node execution '{}' could not be errored out: {}",
                    node_execution_id,
                    e
                );
            }
        }
    }

    /// Keep a failed work item from stalling its node
    ///
    /// Before the node is terminal it moves to ERRORED and is concluded; a
    /// failed conclusion still ends the node so its parent hears of it.
    fn contain_failure(&self, stage: Stage, node_execution_id: &str, error: &EngineError) -> Result<()> {
        match stage {
            Stage::End => Ok(()),
            Stage::Conclude => {
                let Some(node) = self.node_executions.get(node_execution_id)? else {
                    return Ok(());
                };
                self.enqueue(&node.plan_execution_id, WorkItem::End(node.uuid));
                Ok(())
            }
            _ => {
                let Some(node) = self.node_executions.get(node_execution_id)? else {
                    return Ok(());
                };
                if node.status.is_final() {
                    if node.adviser_response.is_none() {
                        self.enqueue(&node.plan_execution_id, WorkItem::Conclude(node.uuid));
                    }
                    return Ok(());
                }
                if !matches!(node.status, Status::Queued | Status::Running | Status::Waiting) {
                    return Ok(());
                }
                let failure = FailureInfo::unexpected(error.to_string());
                self.node_executions.update_status(
                    node_execution_id,
                    &[node.status],
                    Status::Errored,
                    |n| n.failure_info = Some(failure.clone()),
                )?;
                self.wait_notify
                    .cancel_for_node(&node.plan_execution_id, node_execution_id)?;
                self.enqueue(&node.plan_execution_id, WorkItem::Conclude(node.uuid));
                Ok(())
            }
        }
    }

    /// Queue a QUEUED node's next step unless a timer will do it
    ///
    /// Returns whether anything was queued.
    fn requeue_queued(&self, node: &NodeExecution) -> Result<bool> {
        let id = node.uuid.as_str();
        let pending = self.timers.pending(&node.plan_execution_id, |action| {
            matches!(
                action,
                TimerAction::StartNode { .. } | TimerAction::ExecuteNode { .. }
            ) && action.node_execution_id() == Some(id)
        })?;
        if !pending.is_empty() {
            return Ok(false);
        }
        self.enqueue(
            &node.plan_execution_id,
            match node.mode {
                Some(_) => WorkItem::Execute(node.uuid.clone()),
                None => WorkItem::Start(node.uuid.clone()),
            },
        );
        Ok(true)
    }

    fn plan_is_paused(&self, plan_execution_id: &str) -> Result<bool> {
        Ok(self.plan_executions.require(plan_execution_id)?.status == Status::Paused)
    }
}
