//! Barriers: rendezvous points across concurrently running nodes
//!
//! One [`Barrier`] record per declared barrier and plan run. Its expected
//! positions are fixed at creation; arrivals are recorded on the same
//! record under compare-and-swap, and the record moves
//!
//! ```text
//! STANDING ──(all positions arrived)──> DOWN
//!     │
//!     ├──(deadline passed)────────────> TIMED_OUT
//!     └──(plan concluded)─────────────> ERRORED
//! ```
//!
//! Terminal states never change again, so a barrier can never go DOWN
//! after it timed out. Nodes waiting on the barrier registered a callback
//! with their arrival; every callback is notified when the barrier reaches
//! DOWN or TIMED_OUT, and a node arriving at a barrier that is already
//! terminal is notified straight away.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipeline_contracts::{BarrierDeclaration, BarrierPositionType, BarrierResponseData, ResponseData};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::persistence::{impl_entity, modify, Modification, Repository};
use crate::timers::{deadline_after, TimerAction, TimerService};
use crate::wait_notify::WaitNotifyService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    Standing,
    Down,
    TimedOut,
    Errored,
}

impl BarrierState {
    pub fn is_terminal(self) -> bool {
        self != BarrierState::Standing
    }
}

/// One expected arrival
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierPosition {
    pub position_type: BarrierPositionType,
    pub setup_id: String,
    /// Node execution that arrived
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Callback notified when the barrier resolves
    #[serde(default)]
    pub callback_id: Option<String>,
}

impl BarrierPosition {
    pub fn arrived(&self) -> bool {
        self.execution_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Barrier {
    pub uuid: String,
    pub identifier: String,
    pub plan_execution_id: String,
    pub state: BarrierState,
    pub positions: Vec<BarrierPosition>,
    /// Set by the first arrival
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(Barrier, "barriers");

impl Barrier {
    /// Instance of a declared barrier for one plan run
    pub fn from_declaration(plan_execution_id: &str, declaration: &BarrierDeclaration) -> Self {
        Self {
            uuid: barrier_id(plan_execution_id, &declaration.identifier),
            identifier: declaration.identifier.clone(),
            plan_execution_id: plan_execution_id.to_string(),
            state: BarrierState::Standing,
            positions: declaration
                .positions
                .iter()
                .map(|p| BarrierPosition {
                    position_type: p.position_type,
                    setup_id: p.setup_id.clone(),
                    execution_id: None,
                    callback_id: None,
                })
                .collect(),
            deadline: None,
            version: 0,
        }
    }

    pub fn all_arrived(&self) -> bool {
        self.positions.iter().all(BarrierPosition::arrived)
    }

    fn callback_ids(&self) -> Vec<String> {
        self.positions
            .iter()
            .filter_map(|p| p.callback_id.clone())
            .collect()
    }

    /// Record an arrival; `false` if the position is unknown or already arrived
    fn record_arrival(
        &mut self,
        position_type: BarrierPositionType,
        setup_id: &str,
        execution_id: &str,
        callback_id: Option<&str>,
    ) -> bool {
        let Some(position) = self.positions.iter_mut().find(|p| {
            p.position_type == position_type && p.setup_id == setup_id && !p.arrived()
        }) else {
            return false;
        };
        position.execution_id = Some(execution_id.to_string());
        position.callback_id = callback_id.map(str::to_string);
        true
    }
}

/// Deterministic id of a barrier instance
pub fn barrier_id(plan_execution_id: &str, identifier: &str) -> String {
    format!("{}/{}", plan_execution_id, identifier)
}

/// One arrival at a barrier
pub struct Arrival<'a> {
    pub plan_execution_id: &'a str,
    pub identifier: &'a str,
    pub position_type: BarrierPositionType,
    pub setup_id: &'a str,
    pub execution_id: &'a str,
    pub callback_id: &'a str,
    /// Overrides the service's default wait
    pub timeout: Option<Duration>,
}

pub struct BarrierService {
    repo: Arc<dyn Repository<Barrier>>,
    wait_notify: Arc<WaitNotifyService>,
    timers: Arc<TimerService>,
    default_timeout: Duration,
    max_cas_retries: u32,
}

impl BarrierService {
    pub fn new(
        repo: Arc<dyn Repository<Barrier>>,
        wait_notify: Arc<WaitNotifyService>,
        timers: Arc<TimerService>,
        default_timeout: Duration,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            repo,
            wait_notify,
            timers,
            default_timeout,
            max_cas_retries,
        }
    }

    pub fn save(&self, barrier: &Barrier) -> Result<Barrier> {
        self.repo.insert(barrier)
    }

    pub fn get(&self, uuid: &str) -> Result<Option<Barrier>> {
        self.repo.get(uuid)
    }

    /// Compare-and-swap write of a barrier read earlier
    pub fn update(&self, barrier: &Barrier) -> Result<Barrier> {
        self.repo.update(barrier)
    }

    pub fn find(&self, plan_execution_id: &str, identifier: &str) -> Result<Option<Barrier>> {
        self.repo.get(&barrier_id(plan_execution_id, identifier))
    }

    pub fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<Barrier>> {
        self.repo.find_by_plan_execution(plan_execution_id)
    }

    /// Create the barrier instances a plan declares
    pub fn instantiate(
        &self,
        plan_execution_id: &str,
        declarations: &[BarrierDeclaration],
    ) -> Result<Vec<Barrier>> {
        declarations
            .iter()
            .map(|d| self.save(&Barrier::from_declaration(plan_execution_id, d)))
            .collect()
    }

    /// Record that a graph position was reached, without waiting on it
    ///
    /// Applies to every standing barrier of the plan run that expects the
    /// position; the first arrival starts the default deadline. Returns the
    /// barriers that changed.
    pub fn update_position(
        &self,
        plan_execution_id: &str,
        position_type: BarrierPositionType,
        setup_id: &str,
        execution_id: &str,
    ) -> Result<Vec<Barrier>> {
        let mut changed = Vec::new();
        for barrier in self.repo.find_by_plan_execution(plan_execution_id)? {
            let expects = barrier
                .positions
                .iter()
                .any(|p| p.position_type == position_type && p.setup_id == setup_id);
            if barrier.state.is_terminal() || !expects {
                continue;
            }
            let (stored, recorded) = self.apply_arrival(
                &barrier.uuid,
                position_type,
                setup_id,
                execution_id,
                None,
                self.default_timeout,
            )?;
            if recorded {
                changed.push(stored);
            }
        }
        Ok(changed)
    }

    /// Arrive at a barrier and wait for it under `callback_id`
    ///
    /// The callback is always notified eventually: now if the barrier is
    /// already terminal or this arrival completes it, otherwise when the
    /// last position arrives or the deadline passes.
    pub fn arrive(&self, arrival: Arrival<'_>) -> Result<Barrier> {
        let uuid = barrier_id(arrival.plan_execution_id, arrival.identifier);
        if self.repo.get(&uuid)?.is_none() {
            return Err(EngineError::invalid(format!(
                "barrier '{}' is not declared by the plan",
                arrival.identifier
            )));
        }
        let (barrier, recorded) = self.apply_arrival(
            &uuid,
            arrival.position_type,
            arrival.setup_id,
            arrival.execution_id,
            Some(arrival.callback_id),
            arrival.timeout.unwrap_or(self.default_timeout),
        )?;

        if !recorded && barrier.state.is_terminal() {
            // Late or repeated arrival at a resolved barrier
            self.notify(&barrier, &[arrival.callback_id.to_string()])?;
        } else if !recorded {
            log::warn!(
                "Barrier '{}' has no open {:?} position for '{}'",
                barrier.identifier,
                arrival.position_type,
                arrival.setup_id
            );
        }
        Ok(barrier)
    }

    fn apply_arrival(
        &self,
        uuid: &str,
        position_type: BarrierPositionType,
        setup_id: &str,
        execution_id: &str,
        callback_id: Option<&str>,
        timeout: Duration,
    ) -> Result<(Barrier, bool)> {
        let now = Utc::now();
        let (barrier, (recorded, new_deadline)) = modify(
            self.repo.as_ref(),
            uuid,
            self.max_cas_retries,
            |barrier: &mut Barrier| {
                if barrier.state.is_terminal() {
                    return Ok(Modification::Keep((false, None)));
                }
                if !barrier.record_arrival(position_type, setup_id, execution_id, callback_id) {
                    return Ok(Modification::Keep((false, None)));
                }
                let mut new_deadline = None;
                if barrier.deadline.is_none() {
                    let deadline = deadline_after(now, timeout);
                    barrier.deadline = Some(deadline);
                    new_deadline = Some(deadline);
                }
                if barrier.all_arrived() {
                    barrier.state = BarrierState::Down;
                }
                Ok(Modification::Write((true, new_deadline)))
            },
        )?;

        if recorded {
            log::debug!(
                "Barrier '{}' reached at {:?} '{}' ({} positions arrived)",
                barrier.identifier,
                position_type,
                setup_id,
                barrier.positions.iter().filter(|p| p.arrived()).count()
            );
        }
        if let Some(deadline) = new_deadline {
            if barrier.state == BarrierState::Standing {
                self.timers.schedule(
                    &barrier.plan_execution_id,
                    deadline,
                    TimerAction::ExpireBarrier {
                        barrier_id: barrier.uuid.clone(),
                    },
                )?;
            }
        }
        if recorded && barrier.state == BarrierState::Down {
            log::info!("Barrier '{}' is down", barrier.identifier);
            self.notify(&barrier, &barrier.callback_ids())?;
        }
        Ok((barrier, recorded))
    }

    /// Deadline passed: STANDING -> TIMED_OUT, notifying every waiter
    ///
    /// Returns `None` if the barrier had already resolved.
    pub fn time_out(&self, uuid: &str) -> Result<Option<Barrier>> {
        let (barrier, timed_out) = modify(
            self.repo.as_ref(),
            uuid,
            self.max_cas_retries,
            |barrier: &mut Barrier| {
                if barrier.state != BarrierState::Standing {
                    return Ok(Modification::Keep(false));
                }
                barrier.state = BarrierState::TimedOut;
                Ok(Modification::Write(true))
            },
        )?;
        if !timed_out {
            return Ok(None);
        }
        log::warn!(
            "Barrier '{}' timed out with {} of {} positions arrived",
            barrier.identifier,
            barrier.positions.iter().filter(|p| p.arrived()).count(),
            barrier.positions.len()
        );
        self.notify(&barrier, &barrier.callback_ids())?;
        Ok(Some(barrier))
    }

    /// Plan run concluded: barriers still standing become ERRORED
    pub fn error_out_for_plan(&self, plan_execution_id: &str) -> Result<usize> {
        let mut errored = 0;
        for barrier in self.repo.find_by_plan_execution(plan_execution_id)? {
            if barrier.state.is_terminal() {
                continue;
            }
            let (_, changed) = modify(
                self.repo.as_ref(),
                &barrier.uuid,
                self.max_cas_retries,
                |barrier: &mut Barrier| {
                    if barrier.state.is_terminal() {
                        return Ok(Modification::Keep(false));
                    }
                    barrier.state = BarrierState::Errored;
                    Ok(Modification::Write(true))
                },
            )?;
            if changed {
                log::warn!("Barrier '{}' still standing at plan end", barrier.identifier);
                errored += 1;
            }
        }
        Ok(errored)
    }

    fn notify(&self, barrier: &Barrier, callback_ids: &[String]) -> Result<()> {
        let data = ResponseData::Barrier(BarrierResponseData {
            barrier_identifier: barrier.identifier.clone(),
            timed_out: barrier.state != BarrierState::Down,
        });
        for callback_id in callback_ids {
            self.wait_notify.notify(callback_id, data.clone())?;
        }
        Ok(())
    }

    pub fn delete_for_plan(&self, plan_execution_id: &str) -> Result<usize> {
        self.repo.delete_by_plan_execution(plan_execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Stores;
    use crate::wait_notify::{WaitEvent, WaitKind};
    use pipeline_contracts::BarrierPositionDeclaration;

    struct Fixture {
        barriers: BarrierService,
        wait_notify: Arc<WaitNotifyService>,
        timers: Arc<TimerService>,
    }

    fn fixture() -> Fixture {
        let stores = Stores::in_memory();
        let wait_notify = Arc::new(WaitNotifyService::new(&stores, 4));
        let timers = Arc::new(TimerService::new(stores.timers.clone(), 4));
        let barriers = BarrierService::new(
            stores.barriers.clone(),
            wait_notify.clone(),
            timers.clone(),
            Duration::from_secs(60),
            4,
        );
        barriers
            .instantiate(
                "exec",
                &[BarrierDeclaration {
                    identifier: "sync".into(),
                    positions: ["a", "b"]
                        .iter()
                        .map(|s| BarrierPositionDeclaration {
                            position_type: BarrierPositionType::Step,
                            setup_id: s.to_string(),
                        })
                        .collect(),
                }],
            )
            .unwrap();
        Fixture {
            barriers,
            wait_notify,
            timers,
        }
    }

    fn arrive<'a>(setup_id: &'a str, execution_id: &'a str) -> Arrival<'a> {
        Arrival {
            plan_execution_id: "exec",
            identifier: "sync",
            position_type: BarrierPositionType::Step,
            setup_id,
            execution_id,
            callback_id: execution_id,
            timeout: None,
        }
    }

    #[test]
    fn test_down_only_when_all_positions_arrive() {
        let f = fixture();
        f.wait_notify
            .wait_for("exec", "na", WaitKind::Barrier, vec!["na".into()], false)
            .unwrap();
        f.wait_notify
            .wait_for("exec", "nb", WaitKind::Barrier, vec!["nb".into()], false)
            .unwrap();

        let first = f.barriers.arrive(arrive("a", "na")).unwrap();
        assert_eq!(first.state, BarrierState::Standing);
        assert!(first.deadline.is_some());
        assert!(f.wait_notify.next_event().is_none());
        assert_eq!(f.timers.pending("exec", |_| true).unwrap().len(), 1);

        // Repeated arrival does not count twice
        let again = f.barriers.arrive(arrive("a", "na")).unwrap();
        assert_eq!(again.state, BarrierState::Standing);

        let second = f.barriers.arrive(arrive("b", "nb")).unwrap();
        assert_eq!(second.state, BarrierState::Down);
        let mut done = 0;
        while let Some(event) = f.wait_notify.next_event() {
            assert!(matches!(event, WaitEvent::Done { .. }));
            done += 1;
        }
        assert_eq!(done, 2);
    }

    #[test]
    fn test_never_down_after_timeout() {
        let f = fixture();
        f.barriers.arrive(arrive("a", "na")).unwrap();
        let barrier_uuid = barrier_id("exec", "sync");

        let timed_out = f.barriers.time_out(&barrier_uuid).unwrap().unwrap();
        assert_eq!(timed_out.state, BarrierState::TimedOut);
        assert!(f.barriers.time_out(&barrier_uuid).unwrap().is_none());

        let late = f.barriers.arrive(arrive("b", "nb")).unwrap();
        assert_eq!(late.state, BarrierState::TimedOut);
        match f.wait_notify.response("nb").unwrap() {
            Some(ResponseData::Barrier(data)) => assert!(data.timed_out),
            other => panic!("expected barrier response, got {:?}", other),
        }
    }

    #[test]
    fn test_update_position_without_callback() {
        let f = fixture();
        let changed = f
            .barriers
            .update_position("exec", BarrierPositionType::Step, "a", "na")
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert!(f
            .barriers
            .update_position("exec", BarrierPositionType::Stage, "a", "na")
            .unwrap()
            .is_empty());

        let done = f
            .barriers
            .update_position("exec", BarrierPositionType::Step, "b", "nb")
            .unwrap();
        assert_eq!(done[0].state, BarrierState::Down);
    }

    #[test]
    fn test_update_position_starts_default_deadline() {
        let f = fixture();
        let before = Utc::now();
        let changed = f
            .barriers
            .update_position("exec", BarrierPositionType::Step, "a", "na")
            .unwrap();

        let deadline = changed[0].deadline.expect("a deadline");
        assert!(deadline >= before + chrono::Duration::seconds(60));
        let pending = f.timers.pending("exec", |_| true).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fire_at, deadline);
    }

    #[test]
    fn test_error_out_standing_barriers() {
        let f = fixture();
        assert_eq!(f.barriers.error_out_for_plan("exec").unwrap(), 1);
        let barrier = f.barriers.find("exec", "sync").unwrap().unwrap();
        assert_eq!(barrier.state, BarrierState::Errored);
        assert_eq!(f.barriers.error_out_for_plan("exec").unwrap(), 0);
    }

    #[test]
    fn test_undeclared_barrier_is_rejected() {
        let f = fixture();
        let mut arrival = arrive("a", "na");
        arrival.identifier = "missing";
        assert!(f.barriers.arrive(arrival).is_err());
    }
}
