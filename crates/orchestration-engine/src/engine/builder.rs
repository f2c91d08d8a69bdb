//! Assembling an engine from configuration and host-provided parts

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use pipeline_contracts::{AdviserType, FacilitatorType};

use super::lanes::WorkLanes;
use super::OrchestrationEngine;
use crate::advise::{default_advisers, Adviser, AdviserRegistry};
use crate::barrier::BarrierService;
use crate::config::EngineConfig;
use crate::dispatch::{TaskDispatcher, UnconfiguredTaskDispatcher};
use crate::error::Result;
use crate::event_log::{EventLogService, EventPublishingHandler, OrchestrationEventHandler};
use crate::events::{EventSink, NullEventSink};
use crate::execution::{NodeExecutionService, PlanExecutionService};
use crate::facilitation::{
    default_facilitators, Facilitator, FacilitatorRegistry, LiteralSkipConditionEvaluator,
    SkipConditionEvaluator,
};
use crate::interrupts::InterruptService;
use crate::outputs::OutputService;
use crate::persistence::Stores;
use crate::restraint::ResourceRestraintService;
use crate::steps::{register_builtin_steps, Step, StepRegistry, StepServices};
use crate::timers::TimerService;
use crate::wait_notify::WaitNotifyService;

/// Builder for [`OrchestrationEngine`]
///
/// Built-in steps, facilitators and advisers are always registered; the
/// host adds its own steps and may replace facilitators and advisers.
pub struct EngineBuilder {
    config: EngineConfig,
    stores: Option<Stores>,
    steps: StepRegistry,
    facilitators: Vec<(FacilitatorType, Arc<dyn Facilitator>)>,
    advisers: Vec<(AdviserType, Arc<dyn Adviser>)>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    event_sink: Arc<dyn EventSink>,
    skip_conditions: Arc<dyn SkipConditionEvaluator>,
    inline_handlers: Vec<Arc<dyn OrchestrationEventHandler>>,
    deferred_handlers: Vec<Arc<dyn OrchestrationEventHandler>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            stores: None,
            steps: StepRegistry::new("step"),
            facilitators: Vec::new(),
            advisers: Vec::new(),
            dispatcher: None,
            event_sink: Arc::new(NullEventSink),
            skip_conditions: Arc::new(LiteralSkipConditionEvaluator),
            inline_handlers: Vec::new(),
            deferred_handlers: Vec::new(),
        }
    }

    /// Use these stores instead of the ones the configuration names
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Register a step implementation under its step type name
    pub fn register_step(mut self, type_name: impl Into<String>, step: Step) -> Result<Self> {
        self.steps.register(type_name.into(), Arc::new(step))?;
        Ok(self)
    }

    /// Replace the built-in facilitator of `facilitator_type`
    pub fn with_facilitator(
        mut self,
        facilitator_type: FacilitatorType,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        self.facilitators.push((facilitator_type, facilitator));
        self
    }

    /// Replace the built-in adviser of `adviser_type`
    pub fn with_adviser(mut self, adviser_type: AdviserType, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.push((adviser_type, adviser));
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_skip_condition_evaluator(
        mut self,
        evaluator: Arc<dyn SkipConditionEvaluator>,
    ) -> Self {
        self.skip_conditions = evaluator;
        self
    }

    /// Run `handler` on every node transition before the transition returns
    pub fn with_inline_handler(mut self, handler: Arc<dyn OrchestrationEventHandler>) -> Self {
        self.inline_handlers.push(handler);
        self
    }

    /// Run `handler` over the event log after each drain of the work queue
    pub fn with_deferred_handler(mut self, handler: Arc<dyn OrchestrationEventHandler>) -> Self {
        self.deferred_handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<Arc<OrchestrationEngine>> {
        let config = self.config;
        let retries = config.max_cas_retries;
        let stores = match self.stores {
            Some(stores) => stores,
            None => Stores::from_config(&config.store)?,
        };

        let mut steps = self.steps;
        register_builtin_steps(&mut steps)?;

        let defaults = default_facilitators()?;
        let mut facilitators = FacilitatorRegistry::new("facilitator");
        for (facilitator_type, facilitator) in self.facilitators {
            facilitators.register(facilitator_type, facilitator)?;
        }
        for facilitator_type in defaults.keys() {
            if !facilitators.contains(facilitator_type) {
                facilitators.register(*facilitator_type, defaults.obtain(facilitator_type)?)?;
            }
        }

        let defaults = default_advisers()?;
        let mut advisers = AdviserRegistry::new("adviser");
        for (adviser_type, adviser) in self.advisers {
            advisers.register(adviser_type, adviser)?;
        }
        for adviser_type in defaults.keys() {
            if !advisers.contains(adviser_type) {
                advisers.register(*adviser_type, defaults.obtain(adviser_type)?)?;
            }
        }

        let mut event_log = EventLogService::new(&stores, retries);
        for handler in self.inline_handlers {
            event_log = event_log.with_inline_handler(handler);
        }
        for handler in self.deferred_handlers {
            event_log = event_log.with_deferred_handler(handler);
        }
        let event_log = Arc::new(event_log.with_deferred_handler(Arc::new(
            EventPublishingHandler::new(self.event_sink.clone()),
        )));

        let wait_notify = Arc::new(WaitNotifyService::new(&stores, retries));
        let timers = Arc::new(TimerService::new(stores.timers.clone(), retries));
        let services = StepServices {
            outputs: Arc::new(OutputService::new(
                stores.outputs.clone(),
                config.payload_compression_threshold,
            )),
            barriers: Arc::new(BarrierService::new(
                stores.barriers.clone(),
                wait_notify.clone(),
                timers.clone(),
                config.default_barrier_timeout(),
                retries,
            )),
            restraints: Arc::new(ResourceRestraintService::new(
                stores.restraint_units.clone(),
                stores.restraint_instances.clone(),
                wait_notify.clone(),
                retries,
            )),
        };

        log::info!(
            "Orchestration engine ready: {} step types, {} facilitators, {} advisers",
            steps.len(),
            facilitators.len(),
            advisers.len()
        );

        Ok(Arc::new(OrchestrationEngine {
            plans: RwLock::new(HashMap::new()),
            plan_executions: PlanExecutionService::new(stores.plan_executions.clone(), retries),
            node_executions: NodeExecutionService::new(
                stores.node_executions.clone(),
                event_log.clone(),
                retries,
            ),
            interrupts: InterruptService::new(stores.interrupts.clone(), retries),
            event_log,
            wait_notify,
            timers,
            services,
            steps,
            facilitators,
            advisers,
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| Arc::new(UnconfiguredTaskDispatcher)),
            skip_conditions: self.skip_conditions,
            event_sink: self.event_sink,
            lanes: Mutex::new(WorkLanes::default()),
            stores,
            config,
        }))
    }
}
