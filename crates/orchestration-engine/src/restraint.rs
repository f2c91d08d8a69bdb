//! Resource restraints: named counting semaphores
//!
//! A [`ResourceRestraintUnit`] record per resource unit is the single
//! serialization point: it holds the capacity, the ids of the ACTIVE
//! instances and the FIFO queue of BLOCKED ones, and every grant or release
//! is a compare-and-swap on it. [`ResourceRestraintInstance`] records mirror
//! the decision for each request so that holders can be found by requester
//! or release entity.
//!
//! A unit never has more than `capacity` active instances, and a freed slot
//! always goes to the oldest blocked request.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_contracts::{generate_uuid, ResponseData, RestraintResponseData};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::persistence::{impl_entity, modify, Modification, Repository};
use crate::wait_notify::WaitNotifyService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestraintState {
    Blocked,
    Active,
    Finished,
}

/// When an acquired slot is given back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    /// When the plan run concludes
    #[default]
    Plan,
    /// When the enclosing stage ends
    Stage,
}

/// Per-unit semaphore state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRestraintUnit {
    /// The resource unit name
    pub uuid: String,
    /// Units are shared across plan runs
    pub plan_execution_id: String,
    pub capacity: u32,
    pub active: Vec<String>,
    pub blocked: VecDeque<String>,
    pub next_order: u64,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(ResourceRestraintUnit, "restraint_units");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRestraintInstance {
    pub uuid: String,
    pub resource_unit: String,
    pub plan_execution_id: String,
    /// Node execution that asked for the slot
    pub requester_id: String,
    /// Entity whose end releases the slot (plan run or stage execution)
    pub release_entity_id: String,
    #[serde(default)]
    pub callback_id: Option<String>,
    pub order: u64,
    pub state: RestraintState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(ResourceRestraintInstance, "restraint_instances");

/// What a state check did to an instance placed in (or promoted into) a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Promotion {
    Granted,
    /// Finished before it could take the slot
    Withdrawn,
    Unchanged,
}

/// A request for one slot
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub resource_unit: String,
    pub capacity: u32,
    pub plan_execution_id: String,
    pub requester_id: String,
    pub release_entity_id: String,
    /// Notified when the instance becomes ACTIVE (immediately if granted now)
    pub callback_id: Option<String>,
}

pub struct ResourceRestraintService {
    units: Arc<dyn Repository<ResourceRestraintUnit>>,
    instances: Arc<dyn Repository<ResourceRestraintInstance>>,
    wait_notify: Arc<WaitNotifyService>,
    max_cas_retries: u32,
}

impl ResourceRestraintService {
    pub fn new(
        units: Arc<dyn Repository<ResourceRestraintUnit>>,
        instances: Arc<dyn Repository<ResourceRestraintInstance>>,
        wait_notify: Arc<WaitNotifyService>,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            units,
            instances,
            wait_notify,
            max_cas_retries,
        }
    }

    /// Request a slot: ACTIVE if one is free, otherwise BLOCKED in FIFO order
    pub fn acquire(&self, request: AcquireRequest) -> Result<ResourceRestraintInstance> {
        if request.capacity == 0 {
            return Err(EngineError::invalid(format!(
                "resource unit '{}' needs a capacity of at least 1",
                request.resource_unit
            )));
        }
        self.ensure_unit(&request.resource_unit, request.capacity)?;

        // The record exists before the unit lists it, so a concurrent
        // release can always promote what it finds in the queue
        let blocked = self.instances.insert(&ResourceRestraintInstance {
            uuid: generate_uuid(),
            resource_unit: request.resource_unit.clone(),
            plan_execution_id: request.plan_execution_id,
            requester_id: request.requester_id,
            release_entity_id: request.release_entity_id,
            callback_id: request.callback_id,
            order: 0,
            state: RestraintState::Blocked,
            created_at: Utc::now(),
            version: 0,
        })?;
        let instance_id = blocked.uuid.as_str();

        let (_, (order, granted)) = modify(
            self.units.as_ref(),
            &request.resource_unit,
            self.max_cas_retries,
            |unit: &mut ResourceRestraintUnit| {
                unit.capacity = request.capacity;
                let order = unit.next_order;
                unit.next_order += 1;
                let granted = (unit.active.len() as u32) < unit.capacity;
                if granted {
                    unit.active.push(instance_id.to_string());
                } else {
                    unit.blocked.push_back(instance_id.to_string());
                }
                Ok(Modification::Write((order, granted)))
            },
        )?;

        let (instance, promotion) = modify(
            self.instances.as_ref(),
            instance_id,
            self.max_cas_retries,
            |instance: &mut ResourceRestraintInstance| {
                instance.order = order;
                let promotion = match instance.state {
                    RestraintState::Blocked if granted => {
                        instance.state = RestraintState::Active;
                        Promotion::Granted
                    }
                    RestraintState::Finished => Promotion::Withdrawn,
                    _ => Promotion::Unchanged,
                };
                Ok(Modification::Write(promotion))
            },
        )?;
        log::debug!(
            "Restraint instance '{}' on '{}' is {:?} (order {})",
            instance.uuid,
            instance.resource_unit,
            instance.state,
            instance.order
        );
        match promotion {
            Promotion::Granted => self.notify_active(&instance)?,
            // Withdrawn while being placed: give the slot or queue place back
            Promotion::Withdrawn => {
                self.release(&instance.resource_unit, &instance.uuid)?;
            }
            Promotion::Unchanged => {}
        }
        Ok(instance)
    }

    fn ensure_unit(&self, resource_unit: &str, capacity: u32) -> Result<()> {
        if self.units.get(resource_unit)?.is_some() {
            return Ok(());
        }
        let unit = ResourceRestraintUnit {
            uuid: resource_unit.to_string(),
            plan_execution_id: String::new(),
            capacity,
            active: Vec::new(),
            blocked: VecDeque::new(),
            next_order: 0,
            version: 0,
        };
        match self.units.insert(&unit) {
            Ok(_) | Err(EngineError::DuplicateKey { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Release an instance's slot (or drop its queued request) and promote
    /// the oldest blocked instances into freed slots
    ///
    /// Returns the promoted instances. Finishing twice is a no-op.
    pub fn finish(&self, instance_id: &str) -> Result<Vec<ResourceRestraintInstance>> {
        let (instance, finished) = modify(
            self.instances.as_ref(),
            instance_id,
            self.max_cas_retries,
            |instance: &mut ResourceRestraintInstance| {
                if instance.state == RestraintState::Finished {
                    return Ok(Modification::Keep(false));
                }
                instance.state = RestraintState::Finished;
                Ok(Modification::Write(true))
            },
        )?;
        if !finished {
            return Ok(Vec::new());
        }
        self.release(&instance.resource_unit, instance_id)
    }

    /// Drop `instance_id` from its unit and hand freed slots to the oldest
    /// blocked instances
    ///
    /// A promoted instance that finished in the meantime gives its slot
    /// straight back.
    fn release(&self, resource_unit: &str, instance_id: &str) -> Result<Vec<ResourceRestraintInstance>> {
        let mut promoted = Vec::new();
        let mut freed = vec![instance_id.to_string()];
        while let Some(freed_id) = freed.pop() {
            let (_, promoted_ids) = modify(
                self.units.as_ref(),
                resource_unit,
                self.max_cas_retries,
                |unit: &mut ResourceRestraintUnit| {
                    unit.active.retain(|id| *id != freed_id);
                    unit.blocked.retain(|id| *id != freed_id);
                    let mut promoted = Vec::new();
                    while (unit.active.len() as u32) < unit.capacity {
                        let Some(next) = unit.blocked.pop_front() else {
                            break;
                        };
                        unit.active.push(next.clone());
                        promoted.push(next);
                    }
                    Ok(Modification::Write(promoted))
                },
            )?;
            log::debug!(
                "Restraint instance '{}' on '{}' released; promoted {:?}",
                freed_id,
                resource_unit,
                promoted_ids
            );

            for id in promoted_ids {
                let (instance, promotion) = modify(
                    self.instances.as_ref(),
                    &id,
                    self.max_cas_retries,
                    |instance: &mut ResourceRestraintInstance| match instance.state {
                        RestraintState::Blocked => {
                            instance.state = RestraintState::Active;
                            Ok(Modification::Write(Promotion::Granted))
                        }
                        RestraintState::Finished => Ok(Modification::Keep(Promotion::Withdrawn)),
                        RestraintState::Active => Ok(Modification::Keep(Promotion::Unchanged)),
                    },
                )?;
                match promotion {
                    Promotion::Granted => {
                        self.notify_active(&instance)?;
                        promoted.push(instance);
                    }
                    Promotion::Withdrawn => freed.push(id),
                    Promotion::Unchanged => {}
                }
            }
        }
        Ok(promoted)
    }

    /// Release every unfinished instance held for `release_entity_id`
    pub fn finish_for_release_entity(
        &self,
        plan_execution_id: &str,
        release_entity_id: &str,
    ) -> Result<usize> {
        let held: Vec<ResourceRestraintInstance> = self
            .instances
            .find_by_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|i| i.release_entity_id == release_entity_id && i.state != RestraintState::Finished)
            .collect();
        for instance in &held {
            self.finish(&instance.uuid)?;
        }
        if !held.is_empty() {
            log::debug!(
                "Released {} restraint instance(s) held for '{}'",
                held.len(),
                release_entity_id
            );
        }
        Ok(held.len())
    }

    /// Withdraw the queued requests of a requester that will no longer wait
    pub fn cancel_blocked_for_requester(
        &self,
        plan_execution_id: &str,
        requester_id: &str,
    ) -> Result<usize> {
        let blocked: Vec<ResourceRestraintInstance> = self
            .instances
            .find_by_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|i| i.requester_id == requester_id && i.state == RestraintState::Blocked)
            .collect();
        for instance in &blocked {
            self.finish(&instance.uuid)?;
        }
        Ok(blocked.len())
    }

    pub fn get(&self, instance_id: &str) -> Result<Option<ResourceRestraintInstance>> {
        self.instances.get(instance_id)
    }

    pub fn unit(&self, resource_unit: &str) -> Result<Option<ResourceRestraintUnit>> {
        self.units.get(resource_unit)
    }

    pub fn active_count(&self, resource_unit: &str) -> Result<usize> {
        Ok(self.units.get(resource_unit)?.map_or(0, |u| u.active.len()))
    }

    fn notify_active(&self, instance: &ResourceRestraintInstance) -> Result<()> {
        if let Some(callback_id) = &instance.callback_id {
            self.wait_notify.notify(
                callback_id,
                ResponseData::Restraint(RestraintResponseData {
                    resource_unit: instance.resource_unit.clone(),
                    instance_id: instance.uuid.clone(),
                }),
            )?;
        }
        Ok(())
    }
}
