//! Orchestration event log
//!
//! Every successful node status transition appends one entry. Entries carry
//! a `created_at` sequence number that is strictly increasing per plan
//! execution, allocated from a per-plan counter record under
//! compare-and-swap, so that several engine processes appending to the
//! same plan still produce a total order.
//!
//! Appends are idempotent: the entry's key is
//! `(node_execution_id, to_status, node_version)`, and a second append
//! with the same key is dropped.
//!
//! Handlers come in two flavours:
//!
//! - *inline* handlers run inside `append`, before the transition returns
//! - *deferred* handlers read entries past their per-plan cursor
//!   (`find_unprocessed`) when [`EventLogService::process_pending`] runs,
//!   and advance the cursor only after handling succeeds
//!
//! Both are at-least-once, so handlers must be idempotent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use pipeline_contracts::Status;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::events::{EventSink, OrchestrationEvent};
use crate::execution::NodeExecution;
use crate::persistence::{impl_entity, modify, Modification, Repository, Stores};

/// A node status change recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusChange {
    pub node_execution_id: String,
    pub node_id: String,
    pub identifier: String,
    pub from: Status,
    pub to: Status,
    /// Node execution version written by the transition
    pub node_version: u64,
}

/// One log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    /// Idempotency key
    pub uuid: String,
    pub plan_execution_id: String,
    /// Monotonic per plan execution
    pub created_at: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: NodeStatusChange,
    pub version: u64,
}

impl_entity!(EventLogEntry, "event_log");

/// Per-plan sequence counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSequence {
    pub uuid: String,
    pub plan_execution_id: String,
    pub last: u64,
    pub version: u64,
}

impl_entity!(EventSequence, "event_sequences");

/// How far a deferred handler has read a plan's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerCursor {
    pub uuid: String,
    pub plan_execution_id: String,
    pub handler: String,
    pub processed_up_to: u64,
    pub version: u64,
}

impl_entity!(HandlerCursor, "handler_cursors");

/// Consumer of event log entries
pub trait OrchestrationEventHandler: Send + Sync {
    /// Stable name, used as the cursor key of deferred handlers
    fn name(&self) -> &str;

    fn handle(&self, entry: &EventLogEntry) -> Result<()>;
}

fn entry_key(node_execution_id: &str, to: Status, node_version: u64) -> String {
    format!("{}:{}:{}", node_execution_id, to, node_version)
}

fn cursor_key(handler: &str, plan_execution_id: &str) -> String {
    format!("{}:{}", handler, plan_execution_id)
}

/// Appends entries and fans them out to handlers
pub struct EventLogService {
    entries: Arc<dyn Repository<EventLogEntry>>,
    sequences: Arc<dyn Repository<EventSequence>>,
    cursors: Arc<dyn Repository<HandlerCursor>>,
    inline_handlers: Vec<Arc<dyn OrchestrationEventHandler>>,
    deferred_handlers: Vec<Arc<dyn OrchestrationEventHandler>>,
    dirty_plans: Mutex<BTreeSet<String>>,
    max_cas_retries: u32,
}

impl EventLogService {
    pub fn new(stores: &Stores, max_cas_retries: u32) -> Self {
        Self {
            entries: stores.event_log.clone(),
            sequences: stores.event_sequences.clone(),
            cursors: stores.handler_cursors.clone(),
            inline_handlers: Vec::new(),
            deferred_handlers: Vec::new(),
            dirty_plans: Mutex::new(BTreeSet::new()),
            max_cas_retries,
        }
    }

    /// Add a handler that runs inside every append
    pub fn with_inline_handler(mut self, handler: Arc<dyn OrchestrationEventHandler>) -> Self {
        self.inline_handlers.push(handler);
        self
    }

    /// Add a handler that runs from `process_pending`
    pub fn with_deferred_handler(mut self, handler: Arc<dyn OrchestrationEventHandler>) -> Self {
        self.deferred_handlers.push(handler);
        self
    }

    /// Record a status transition already written to `node`
    ///
    /// Returns `None` when the same transition was recorded before.
    pub fn record_node_transition(
        &self,
        node: &NodeExecution,
        from: Status,
    ) -> Result<Option<EventLogEntry>> {
        let change = NodeStatusChange {
            node_execution_id: node.uuid.clone(),
            node_id: node.node_id.clone(),
            identifier: node.identifier.clone(),
            from,
            to: node.status,
            node_version: node.version,
        };
        self.append(&node.plan_execution_id, change)
    }

    pub fn append(
        &self,
        plan_execution_id: &str,
        change: NodeStatusChange,
    ) -> Result<Option<EventLogEntry>> {
        let key = entry_key(&change.node_execution_id, change.to, change.node_version);
        if self.entries.get(&key)?.is_some() {
            log::warn!("Event log entry '{}' already recorded", key);
            return Ok(None);
        }

        let entry = EventLogEntry {
            uuid: key.clone(),
            plan_execution_id: plan_execution_id.to_string(),
            created_at: self.next_sequence(plan_execution_id)?,
            timestamp: Utc::now(),
            payload: change,
            version: 0,
        };
        match self.entries.insert(&entry) {
            Ok(_) => {}
            Err(EngineError::DuplicateKey { .. }) => {
                log::warn!("Event log entry '{}' recorded concurrently", key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        log::debug!(
            "Event log [{}#{}] {} {} -> {}",
            plan_execution_id,
            entry.created_at,
            entry.payload.identifier,
            entry.payload.from,
            entry.payload.to
        );

        for handler in &self.inline_handlers {
            if let Err(e) = handler.handle(&entry) {
                log::warn!("Inline handler '{}' failed on '{}': {}", handler.name(), key, e);
            }
        }
        if !self.deferred_handlers.is_empty() {
            self.dirty_plans.lock().insert(plan_execution_id.to_string());
        }
        Ok(Some(entry))
    }

    fn next_sequence(&self, plan_execution_id: &str) -> Result<u64> {
        if self.sequences.get(plan_execution_id)?.is_none() {
            let counter = EventSequence {
                uuid: plan_execution_id.to_string(),
                plan_execution_id: plan_execution_id.to_string(),
                last: 0,
                version: 0,
            };
            match self.sequences.insert(&counter) {
                Ok(_) | Err(EngineError::DuplicateKey { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let (_, next) = modify(
            self.sequences.as_ref(),
            plan_execution_id,
            self.max_cas_retries,
            |counter: &mut EventSequence| {
                counter.last += 1;
                Ok(Modification::Write(counter.last))
            },
        )?;
        Ok(next)
    }

    /// All entries of a plan in log order
    pub fn entries(&self, plan_execution_id: &str) -> Result<Vec<EventLogEntry>> {
        self.find_unprocessed(plan_execution_id, 0)
    }

    /// Entries of a plan with `created_at > since`, in log order
    pub fn find_unprocessed(&self, plan_execution_id: &str, since: u64) -> Result<Vec<EventLogEntry>> {
        let mut entries: Vec<EventLogEntry> = self
            .entries
            .find_by_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|e| e.created_at > since)
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    /// Run deferred handlers over every plan with new entries
    pub fn process_pending(&self) -> Result<usize> {
        let plans: Vec<String> = std::mem::take(&mut *self.dirty_plans.lock())
            .into_iter()
            .collect();
        let mut handled = 0;
        for plan_execution_id in plans {
            handled += self.process_plan(&plan_execution_id)?;
        }
        Ok(handled)
    }

    /// Run deferred handlers over one plan's unprocessed entries
    pub fn process_plan(&self, plan_execution_id: &str) -> Result<usize> {
        let mut handled = 0;
        for handler in &self.deferred_handlers {
            let key = cursor_key(handler.name(), plan_execution_id);
            let since = match self.cursors.get(&key)? {
                Some(cursor) => cursor.processed_up_to,
                None => {
                    let cursor = HandlerCursor {
                        uuid: key.clone(),
                        plan_execution_id: plan_execution_id.to_string(),
                        handler: handler.name().to_string(),
                        processed_up_to: 0,
                        version: 0,
                    };
                    match self.cursors.insert(&cursor) {
                        Ok(_) | Err(EngineError::DuplicateKey { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    0
                }
            };

            let mut reached = since;
            for entry in self.find_unprocessed(plan_execution_id, since)? {
                if let Err(e) = handler.handle(&entry) {
                    log::warn!(
                        "Deferred handler '{}' failed at {}#{}: {}",
                        handler.name(),
                        plan_execution_id,
                        entry.created_at,
                        e
                    );
                    break;
                }
                reached = entry.created_at;
                handled += 1;
            }

            if reached > since {
                modify(
                    self.cursors.as_ref(),
                    &key,
                    self.max_cas_retries,
                    |cursor: &mut HandlerCursor| {
                        if cursor.processed_up_to >= reached {
                            return Ok(Modification::Keep(()));
                        }
                        cursor.processed_up_to = reached;
                        Ok(Modification::Write(()))
                    },
                )?;
            }
        }
        Ok(handled)
    }
}

/// Publishes node status changes to an [`EventSink`]
pub struct EventPublishingHandler {
    sink: Arc<dyn EventSink>,
}

impl EventPublishingHandler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

impl OrchestrationEventHandler for EventPublishingHandler {
    fn name(&self) -> &str {
        "event-publisher"
    }

    fn handle(&self, entry: &EventLogEntry) -> Result<()> {
        let _ = self.sink.send(OrchestrationEvent::NodeStatusChanged {
            plan_execution_id: entry.plan_execution_id.clone(),
            node_execution_id: entry.payload.node_execution_id.clone(),
            node_id: entry.payload.node_id.clone(),
            identifier: entry.payload.identifier.clone(),
            from: entry.payload.from,
            to: entry.payload.to,
            sequence: entry.created_at,
        });
        Ok(())
    }
}

/// Latest known status of every node of a plan execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionSummary {
    /// node execution id -> (sequence of the change, status)
    pub node_statuses: BTreeMap<String, (u64, Status)>,
    pub last_sequence: u64,
}

impl ExecutionSummary {
    pub fn count(&self, status: Status) -> usize {
        self.node_statuses
            .values()
            .filter(|(_, s)| *s == status)
            .count()
    }
}

/// Folds log entries into per-plan summaries
///
/// Replaying an entry is harmless: a change only applies when its
/// sequence is newer than what the summary holds for that node.
#[derive(Default)]
pub struct ExecutionSummaryHandler {
    summaries: RwLock<HashMap<String, ExecutionSummary>>,
}

impl ExecutionSummaryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self, plan_execution_id: &str) -> Option<ExecutionSummary> {
        self.summaries.read().get(plan_execution_id).cloned()
    }
}

impl OrchestrationEventHandler for ExecutionSummaryHandler {
    fn name(&self) -> &str {
        "execution-summary"
    }

    fn handle(&self, entry: &EventLogEntry) -> Result<()> {
        let mut summaries = self.summaries.write();
        let summary = summaries
            .entry(entry.plan_execution_id.clone())
            .or_default();
        let current = summary
            .node_statuses
            .get(&entry.payload.node_execution_id)
            .map(|(seq, _)| *seq);
        if current.map_or(true, |seq| seq < entry.created_at) {
            summary.node_statuses.insert(
                entry.payload.node_execution_id.clone(),
                (entry.created_at, entry.payload.to),
            );
        }
        summary.last_sequence = summary.last_sequence.max(entry.created_at);
        Ok(())
    }
}
