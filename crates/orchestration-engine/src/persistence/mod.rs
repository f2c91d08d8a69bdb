//! Repository contract and store backends
//!
//! Every piece of shared engine state (plans, executions, barriers,
//! restraints, outputs, waits, timers, the event log) goes through a
//! [`Repository`]. The contract is deliberately small: `insert`, `get`,
//! a compare-and-swap `update` on the record's `version`, and listing and
//! deletion scoped to a plan execution.
//!
//! Two backends implement it:
//!
//! - [`MemoryRepository`]: process-local maps, for tests and single-process hosts
//! - [`SqliteRepository`]: one table per collection in a shared SQLite
//!   database, safe for several engine instances writing concurrently
//!
//! Records come back from listings in insertion order.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::{SqliteDatabase, SqliteRepository};

use std::path::Path;
use std::sync::Arc;

use pipeline_contracts::Plan;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::barrier::Barrier;
use crate::config::StoreConfig;
use crate::error::{EngineError, Result};
use crate::event_log::{EventLogEntry, EventSequence, HandlerCursor};
use crate::execution::{NodeExecution, PlanExecution};
use crate::interrupts::Interrupt;
use crate::outputs::StoredOutput;
use crate::restraint::{ResourceRestraintInstance, ResourceRestraintUnit};
use crate::timers::ScheduledTimer;
use crate::wait_notify::{CallbackIndexEntry, NotifyResponse, WaitInstance};

/// A versioned record stored in a [`Repository`]
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection (table) name
    const COLLECTION: &'static str;

    fn uuid(&self) -> &str;

    /// Version checked by compare-and-swap updates
    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Plan execution the record belongs to, empty for shared records
    fn plan_execution_id(&self) -> &str;
}

/// Storage contract for one collection
pub trait Repository<T: Entity>: Send + Sync {
    /// Store a new record. Fails with `DuplicateKey` if the uuid exists.
    fn insert(&self, entity: &T) -> Result<T>;

    fn get(&self, uuid: &str) -> Result<Option<T>>;

    /// Compare-and-swap: succeeds only if the stored version equals
    /// `entity.version()`; the stored record gets the next version.
    ///
    /// Fails with `StaleState` on a version conflict and `NotFound` when
    /// the record does not exist.
    fn update(&self, entity: &T) -> Result<T>;

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<T>>;

    fn list(&self) -> Result<Vec<T>>;

    /// Delete a record, returning whether it existed
    fn delete(&self, uuid: &str) -> Result<bool>;

    /// Delete all records of a plan execution, returning how many were removed
    fn delete_by_plan_execution(&self, plan_execution_id: &str) -> Result<usize>;

    /// Get a record that must exist
    fn require(&self, uuid: &str) -> Result<T> {
        self.get(uuid)?
            .ok_or_else(|| EngineError::not_found(T::COLLECTION, uuid))
    }
}

/// Outcome of a mutation closure passed to [`modify`]
pub enum Modification<R> {
    /// Persist the mutated record
    Write(R),
    /// Leave the record as stored
    Keep(R),
}

/// Read-modify-write a record under compare-and-swap
///
/// The closure is re-run against a fresh read after each version conflict,
/// up to `max_retries` times. An error from the closure aborts without
/// writing.
pub fn modify<T, R, F>(
    repo: &dyn Repository<T>,
    uuid: &str,
    max_retries: u32,
    mut apply: F,
) -> Result<(T, R)>
where
    T: Entity,
    F: FnMut(&mut T) -> Result<Modification<R>>,
{
    let mut attempt = 0;
    loop {
        let mut entity = repo.require(uuid)?;
        match apply(&mut entity)? {
            Modification::Keep(result) => return Ok((entity, result)),
            Modification::Write(result) => match repo.update(&entity) {
                Ok(stored) => return Ok((stored, result)),
                Err(e) if e.is_stale() && attempt < max_retries => {
                    attempt += 1;
                    log::debug!(
                        "Version conflict on {} '{}', retrying ({}/{})",
                        T::COLLECTION,
                        uuid,
                        attempt,
                        max_retries
                    );
                }
                Err(e) => return Err(e),
            },
        }
    }
}

/// The full set of repositories the engine works against
#[derive(Clone)]
pub struct Stores {
    pub plans: Arc<dyn Repository<Plan>>,
    pub plan_executions: Arc<dyn Repository<PlanExecution>>,
    pub node_executions: Arc<dyn Repository<NodeExecution>>,
    pub interrupts: Arc<dyn Repository<Interrupt>>,
    pub barriers: Arc<dyn Repository<Barrier>>,
    pub restraint_units: Arc<dyn Repository<ResourceRestraintUnit>>,
    pub restraint_instances: Arc<dyn Repository<ResourceRestraintInstance>>,
    pub outputs: Arc<dyn Repository<StoredOutput>>,
    pub event_log: Arc<dyn Repository<EventLogEntry>>,
    pub event_sequences: Arc<dyn Repository<EventSequence>>,
    pub handler_cursors: Arc<dyn Repository<HandlerCursor>>,
    pub waits: Arc<dyn Repository<WaitInstance>>,
    pub callbacks: Arc<dyn Repository<CallbackIndexEntry>>,
    pub notify_responses: Arc<dyn Repository<NotifyResponse>>,
    pub timers: Arc<dyn Repository<ScheduledTimer>>,
}

impl Stores {
    /// Process-local stores
    pub fn in_memory() -> Self {
        Self {
            plans: Arc::new(MemoryRepository::new()),
            plan_executions: Arc::new(MemoryRepository::new()),
            node_executions: Arc::new(MemoryRepository::new()),
            interrupts: Arc::new(MemoryRepository::new()),
            barriers: Arc::new(MemoryRepository::new()),
            restraint_units: Arc::new(MemoryRepository::new()),
            restraint_instances: Arc::new(MemoryRepository::new()),
            outputs: Arc::new(MemoryRepository::new()),
            event_log: Arc::new(MemoryRepository::new()),
            event_sequences: Arc::new(MemoryRepository::new()),
            handler_cursors: Arc::new(MemoryRepository::new()),
            waits: Arc::new(MemoryRepository::new()),
            callbacks: Arc::new(MemoryRepository::new()),
            notify_responses: Arc::new(MemoryRepository::new()),
            timers: Arc::new(MemoryRepository::new()),
        }
    }

    /// Stores backed by a SQLite database file
    pub fn sqlite(path: impl AsRef<Path>) -> Result<Self> {
        Self::on_database(SqliteDatabase::open(path)?)
    }

    /// Stores over an already-open database
    pub fn on_database(db: SqliteDatabase) -> Result<Self> {
        Ok(Self {
            plans: Arc::new(SqliteRepository::new(db.clone())?),
            plan_executions: Arc::new(SqliteRepository::new(db.clone())?),
            node_executions: Arc::new(SqliteRepository::new(db.clone())?),
            interrupts: Arc::new(SqliteRepository::new(db.clone())?),
            barriers: Arc::new(SqliteRepository::new(db.clone())?),
            restraint_units: Arc::new(SqliteRepository::new(db.clone())?),
            restraint_instances: Arc::new(SqliteRepository::new(db.clone())?),
            outputs: Arc::new(SqliteRepository::new(db.clone())?),
            event_log: Arc::new(SqliteRepository::new(db.clone())?),
            event_sequences: Arc::new(SqliteRepository::new(db.clone())?),
            handler_cursors: Arc::new(SqliteRepository::new(db.clone())?),
            waits: Arc::new(SqliteRepository::new(db.clone())?),
            callbacks: Arc::new(SqliteRepository::new(db.clone())?),
            notify_responses: Arc::new(SqliteRepository::new(db.clone())?),
            timers: Arc::new(SqliteRepository::new(db)?),
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match config {
            StoreConfig::InMemory => Ok(Self::in_memory()),
            StoreConfig::Sqlite { path } => {
                log::info!("Opening SQLite store at {:?}", path);
                Self::sqlite(path)
            }
        }
    }
}

impl Entity for Plan {
    const COLLECTION: &'static str = "plans";

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn plan_execution_id(&self) -> &str {
        ""
    }
}

/// Implements [`Entity`] for a struct with `uuid`, `version` and
/// `plan_execution_id` fields
macro_rules! impl_entity {
    ($ty:ty, $collection:literal) => {
        impl $crate::persistence::Entity for $ty {
            const COLLECTION: &'static str = $collection;

            fn uuid(&self) -> &str {
                &self.uuid
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }

            fn plan_execution_id(&self) -> &str {
                &self.plan_execution_id
            }
        }
    };
}

pub(crate) use impl_entity;
