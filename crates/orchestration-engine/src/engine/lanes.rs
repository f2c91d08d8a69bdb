//! Per plan execution work queues
//!
//! Each plan execution gets its own lane. A caller claims an idle lane and
//! drains it; items pushed onto a lane some other caller is draining are
//! left to that caller. Claiming, pushing and popping all happen under the
//! engine's lane lock, which is never held while a work item runs.

use std::collections::{HashMap, VecDeque};

use super::WorkItem;

#[derive(Default)]
struct Lane {
    items: VecDeque<WorkItem>,
    draining: bool,
}

#[derive(Default)]
pub(super) struct WorkLanes {
    lanes: HashMap<String, Lane>,
}

impl WorkLanes {
    pub(super) fn push(&mut self, plan_execution_id: &str, item: WorkItem) {
        self.lanes
            .entry(plan_execution_id.to_string())
            .or_default()
            .items
            .push_back(item);
    }

    /// Claim a lane with pending work that nobody drains yet
    ///
    /// `preferred` is taken first when it qualifies.
    pub(super) fn claim_idle(&mut self, preferred: Option<&str>) -> Option<String> {
        let idle = |lane: &Lane| !lane.draining && !lane.items.is_empty();
        let id = match preferred {
            Some(id) if self.lanes.get(id).is_some_and(idle) => id.to_string(),
            _ => self
                .lanes
                .iter()
                .find(|(_, lane)| idle(lane))
                .map(|(id, _)| id.clone())?,
        };
        if let Some(lane) = self.lanes.get_mut(&id) {
            lane.draining = true;
        }
        Some(id)
    }

    /// Next item of a claimed lane
    ///
    /// An empty lane is dropped, which also releases the claim.
    pub(super) fn pop(&mut self, plan_execution_id: &str) -> Option<WorkItem> {
        let lane = self.lanes.get_mut(plan_execution_id)?;
        match lane.items.pop_front() {
            Some(item) => Some(item),
            None => {
                self.lanes.remove(plan_execution_id);
                None
            }
        }
    }

    pub(super) fn is_draining(&self, plan_execution_id: &str) -> bool {
        self.lanes
            .get(plan_execution_id)
            .is_some_and(|lane| lane.draining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(id: &str) -> WorkItem {
        WorkItem::Start(id.to_string())
    }

    #[test]
    fn test_claimed_lane_is_not_claimed_twice() {
        let mut lanes = WorkLanes::default();
        lanes.push("plan-a", start("n1"));
        lanes.push("plan-b", start("n2"));

        assert_eq!(lanes.claim_idle(Some("plan-a")).as_deref(), Some("plan-a"));
        assert_eq!(lanes.claim_idle(Some("plan-a")).as_deref(), Some("plan-b"));
        assert_eq!(lanes.claim_idle(None), None);

        // Work pushed onto a lane being drained waits for its drainer
        lanes.push("plan-a", start("n3"));
        assert!(lanes.is_draining("plan-a"));
        assert_eq!(lanes.claim_idle(None), None);
    }

    #[test]
    fn test_empty_pop_releases_claim() {
        let mut lanes = WorkLanes::default();
        lanes.push("plan-a", start("n1"));
        lanes.claim_idle(None);

        assert!(matches!(lanes.pop("plan-a"), Some(WorkItem::Start(id)) if id == "n1"));
        assert!(lanes.pop("plan-a").is_none());
        assert!(!lanes.is_draining("plan-a"));

        lanes.push("plan-a", start("n2"));
        assert_eq!(lanes.claim_idle(None).as_deref(), Some("plan-a"));
    }
}
