//! Wait/notify: persisted correlation between callbacks and waiting nodes
//!
//! A suspended node registers a [`WaitInstance`] listing the callback ids it
//! needs. Anything that completes work for it (an async completer, a remote
//! task, a finished child, a barrier, a restraint slot) calls
//! [`WaitNotifyService::notify`] with a callback id and [`ResponseData`].
//!
//! Responses are stored first and matched second, so a response that
//! arrives before its wait is registered is not lost: registration checks
//! for responses already on file. When every callback of a wait has a
//! response, a [`WaitEvent::Done`] is queued for the engine; waits that
//! asked for progress also queue a [`WaitEvent::Progress`] per response.
//!
//! The ready queue is process-local. After a restart,
//! [`WaitNotifyService::recover`] rebuilds it from the persisted records.
//! Claiming a completed wait is a compare-and-swap, so a wait resumes its
//! node exactly once even if it is queued twice.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pipeline_contracts::{generate_uuid, ResponseData, ResponseDataMap};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::persistence::{impl_entity, modify, Modification, Repository, Stores};

/// What a node is suspended on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitKind {
    Async,
    Task,
    TaskChain,
    Child,
    Children,
    Barrier,
    Restraint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitState {
    Waiting,
    Done,
    Cancelled,
}

/// A node suspended until its callbacks are notified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitInstance {
    pub uuid: String,
    pub plan_execution_id: String,
    pub node_execution_id: String,
    pub kind: WaitKind,
    pub callback_ids: Vec<String>,
    /// Queue a progress event for every individual response
    #[serde(default)]
    pub progress: bool,
    pub state: WaitState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(WaitInstance, "waits");

/// callback id -> wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackIndexEntry {
    /// The callback id
    pub uuid: String,
    pub plan_execution_id: String,
    pub wait_id: String,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(CallbackIndexEntry, "callback_index");

/// A response notified under a callback id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    /// The callback id
    pub uuid: String,
    /// Empty when the response arrived before its wait was registered
    pub plan_execution_id: String,
    pub data: ResponseData,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl_entity!(NotifyResponse, "notify_responses");

/// Work for the engine produced by notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitEvent {
    /// Every callback of the wait has a response
    Done {
        wait_id: String,
        plan_execution_id: String,
        node_execution_id: String,
    },
    /// Some callback of a progress wait has a response
    Progress {
        wait_id: String,
        plan_execution_id: String,
        node_execution_id: String,
        callback_id: Option<String>,
    },
}

pub struct WaitNotifyService {
    waits: Arc<dyn Repository<WaitInstance>>,
    callbacks: Arc<dyn Repository<CallbackIndexEntry>>,
    responses: Arc<dyn Repository<NotifyResponse>>,
    ready: Mutex<VecDeque<WaitEvent>>,
    max_cas_retries: u32,
}

impl WaitNotifyService {
    pub fn new(stores: &Stores, max_cas_retries: u32) -> Self {
        Self {
            waits: stores.waits.clone(),
            callbacks: stores.callbacks.clone(),
            responses: stores.notify_responses.clone(),
            ready: Mutex::new(VecDeque::new()),
            max_cas_retries,
        }
    }

    /// Suspend `node_execution_id` until every callback is notified
    pub fn wait_for(
        &self,
        plan_execution_id: &str,
        node_execution_id: &str,
        kind: WaitKind,
        callback_ids: Vec<String>,
        progress: bool,
    ) -> Result<WaitInstance> {
        if callback_ids.is_empty() {
            return Err(EngineError::invalid(format!(
                "node execution '{}' cannot wait on zero callbacks",
                node_execution_id
            )));
        }
        let wait = WaitInstance {
            uuid: generate_uuid(),
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: node_execution_id.to_string(),
            kind,
            callback_ids,
            progress,
            state: WaitState::Waiting,
            created_at: Utc::now(),
            version: 0,
        };
        self.waits.insert(&wait)?;
        for callback_id in &wait.callback_ids {
            self.callbacks.insert(&CallbackIndexEntry {
                uuid: callback_id.clone(),
                plan_execution_id: plan_execution_id.to_string(),
                wait_id: wait.uuid.clone(),
                version: 0,
            })?;
        }
        log::debug!(
            "Node execution '{}' waiting ({:?}) on {:?}",
            node_execution_id,
            kind,
            wait.callback_ids
        );

        // Responses may have arrived before registration
        if wait.progress {
            for callback_id in &wait.callback_ids {
                if self.responses.get(callback_id)?.is_some() {
                    self.push_progress(&wait, Some(callback_id.clone()));
                }
            }
        }
        if self.is_complete(&wait)? {
            self.push_done(&wait);
        }
        Ok(wait)
    }

    /// Deliver a response under `callback_id`
    ///
    /// Returns `false` for a duplicate delivery or a callback nobody is
    /// waiting on yet; the response is kept either way.
    pub fn notify(&self, callback_id: &str, data: ResponseData) -> Result<bool> {
        let index = self.callbacks.get(callback_id)?;
        let response = NotifyResponse {
            uuid: callback_id.to_string(),
            plan_execution_id: index
                .as_ref()
                .map(|i| i.plan_execution_id.clone())
                .unwrap_or_default(),
            data,
            received_at: Utc::now(),
            version: 0,
        };
        match self.responses.insert(&response) {
            Ok(_) => {}
            Err(EngineError::DuplicateKey { .. }) => {
                log::warn!("Duplicate notification for callback '{}' ignored", callback_id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        // Re-read: the wait may have registered between the lookup and the insert
        let Some(index) = self.callbacks.get(callback_id)? else {
            log::debug!("Callback '{}' notified before its wait registered", callback_id);
            return Ok(false);
        };
        let Some(wait) = self.waits.get(&index.wait_id)? else {
            return Ok(false);
        };
        if wait.state != WaitState::Waiting {
            log::debug!(
                "Callback '{}' notified after wait '{}' was {:?}",
                callback_id,
                wait.uuid,
                wait.state
            );
            return Ok(false);
        }
        if wait.progress {
            self.push_progress(&wait, Some(callback_id.to_string()));
        }
        if self.is_complete(&wait)? {
            self.push_done(&wait);
        }
        Ok(true)
    }

    fn is_complete(&self, wait: &WaitInstance) -> Result<bool> {
        for callback_id in &wait.callback_ids {
            if self.responses.get(callback_id)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn push_done(&self, wait: &WaitInstance) {
        self.ready.lock().push_back(WaitEvent::Done {
            wait_id: wait.uuid.clone(),
            plan_execution_id: wait.plan_execution_id.clone(),
            node_execution_id: wait.node_execution_id.clone(),
        });
    }

    fn push_progress(&self, wait: &WaitInstance, callback_id: Option<String>) {
        self.ready.lock().push_back(WaitEvent::Progress {
            wait_id: wait.uuid.clone(),
            plan_execution_id: wait.plan_execution_id.clone(),
            node_execution_id: wait.node_execution_id.clone(),
            callback_id,
        });
    }

    /// Next ready event, if any
    pub fn next_event(&self) -> Option<WaitEvent> {
        self.ready.lock().pop_front()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.ready.lock().is_empty()
    }

    /// Take ownership of a completed wait
    ///
    /// Returns `None` if the wait was already claimed or cancelled.
    pub fn claim(&self, wait_id: &str) -> Result<Option<(WaitInstance, ResponseDataMap)>> {
        let (wait, claimed) = modify(
            self.waits.as_ref(),
            wait_id,
            self.max_cas_retries,
            |wait: &mut WaitInstance| {
                if wait.state != WaitState::Waiting {
                    return Ok(Modification::Keep(false));
                }
                wait.state = WaitState::Done;
                Ok(Modification::Write(true))
            },
        )?;
        if !claimed {
            return Ok(None);
        }
        let responses = self.responses_for(&wait.callback_ids)?;
        Ok(Some((wait, responses)))
    }

    /// Responses on file for the given callbacks
    pub fn responses_for(&self, callback_ids: &[String]) -> Result<ResponseDataMap> {
        let mut map = ResponseDataMap::new();
        for callback_id in callback_ids {
            if let Some(response) = self.responses.get(callback_id)? {
                map.insert(callback_id.clone(), response.data);
            }
        }
        Ok(map)
    }

    pub fn response(&self, callback_id: &str) -> Result<Option<ResponseData>> {
        Ok(self.responses.get(callback_id)?.map(|r| r.data))
    }

    pub fn get(&self, wait_id: &str) -> Result<Option<WaitInstance>> {
        self.waits.get(wait_id)
    }

    /// Waits of a node still in WAITING state
    pub fn open_waits_for_node(
        &self,
        plan_execution_id: &str,
        node_execution_id: &str,
    ) -> Result<Vec<WaitInstance>> {
        Ok(self
            .waits
            .find_by_plan_execution(plan_execution_id)?
            .into_iter()
            .filter(|w| w.node_execution_id == node_execution_id && w.state == WaitState::Waiting)
            .collect())
    }

    /// Cancel a node's open waits; late responses are then ignored
    pub fn cancel_for_node(
        &self,
        plan_execution_id: &str,
        node_execution_id: &str,
    ) -> Result<Vec<WaitInstance>> {
        let mut cancelled = Vec::new();
        for wait in self.open_waits_for_node(plan_execution_id, node_execution_id)? {
            let (stored, changed) = modify(
                self.waits.as_ref(),
                &wait.uuid,
                self.max_cas_retries,
                |wait: &mut WaitInstance| {
                    if wait.state != WaitState::Waiting {
                        return Ok(Modification::Keep(false));
                    }
                    wait.state = WaitState::Cancelled;
                    Ok(Modification::Write(true))
                },
            )?;
            if changed {
                log::debug!("Cancelled wait '{}' of node execution '{}'", stored.uuid, node_execution_id);
                cancelled.push(stored);
            }
        }
        Ok(cancelled)
    }

    /// Rebuild the ready queue from persisted waits and responses
    pub fn recover(&self) -> Result<usize> {
        let mut queued = 0;
        for wait in self.waits.list()? {
            if wait.state != WaitState::Waiting {
                continue;
            }
            if self.is_complete(&wait)? {
                self.push_done(&wait);
                queued += 1;
            } else if wait.progress {
                self.push_progress(&wait, None);
                queued += 1;
            }
        }
        if queued > 0 {
            log::info!("Recovered {} ready wait events", queued);
        }
        Ok(queued)
    }

    /// Remove all wait records of an archived plan run
    pub fn delete_for_plan(&self, plan_execution_id: &str) -> Result<()> {
        self.waits.delete_by_plan_execution(plan_execution_id)?;
        self.callbacks.delete_by_plan_execution(plan_execution_id)?;
        self.responses.delete_by_plan_execution(plan_execution_id)?;
        Ok(())
    }
}
