//! In-memory repository backend

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{Entity, Repository};
use crate::error::{EngineError, Result};

struct Row<T> {
    seq: u64,
    entity: T,
}

struct Table<T> {
    next_seq: u64,
    rows: HashMap<String, Row<T>>,
}

/// Repository over a lock-protected map
///
/// All writes take the table's write lock, so a compare-and-swap is
/// atomic with respect to every other writer in the process.
pub struct MemoryRepository<T> {
    table: RwLock<Table<T>>,
}

impl<T> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table {
                next_seq: 0,
                rows: HashMap::new(),
            }),
        }
    }
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> MemoryRepository<T> {
    fn collect_sorted(&self, filter: impl Fn(&T) -> bool) -> Vec<T> {
        let table = self.table.read();
        let mut rows: Vec<&Row<T>> = table.rows.values().filter(|r| filter(&r.entity)).collect();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.entity.clone()).collect()
    }
}

impl<T: Entity> Repository<T> for MemoryRepository<T> {
    fn insert(&self, entity: &T) -> Result<T> {
        let mut table = self.table.write();
        if table.rows.contains_key(entity.uuid()) {
            return Err(EngineError::DuplicateKey {
                collection: T::COLLECTION,
                uuid: entity.uuid().to_string(),
            });
        }
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(
            entity.uuid().to_string(),
            Row {
                seq,
                entity: entity.clone(),
            },
        );
        Ok(entity.clone())
    }

    fn get(&self, uuid: &str) -> Result<Option<T>> {
        Ok(self.table.read().rows.get(uuid).map(|r| r.entity.clone()))
    }

    fn update(&self, entity: &T) -> Result<T> {
        let mut table = self.table.write();
        let row = table
            .rows
            .get_mut(entity.uuid())
            .ok_or_else(|| EngineError::not_found(T::COLLECTION, entity.uuid()))?;
        if row.entity.version() != entity.version() {
            return Err(EngineError::stale(T::COLLECTION, entity.uuid()));
        }
        let mut stored = entity.clone();
        stored.set_version(entity.version() + 1);
        row.entity = stored.clone();
        Ok(stored)
    }

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<T>> {
        Ok(self.collect_sorted(|e| e.plan_execution_id() == plan_execution_id))
    }

    fn list(&self) -> Result<Vec<T>> {
        Ok(self.collect_sorted(|_| true))
    }

    fn delete(&self, uuid: &str) -> Result<bool> {
        Ok(self.table.write().rows.remove(uuid).is_some())
    }

    fn delete_by_plan_execution(&self, plan_execution_id: &str) -> Result<usize> {
        let mut table = self.table.write();
        let before = table.rows.len();
        table
            .rows
            .retain(|_, row| row.entity.plan_execution_id() != plan_execution_id);
        Ok(before - table.rows.len())
    }
}
