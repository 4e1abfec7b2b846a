//! Record store trait and in-memory implementation
//!
//! The in-memory store suits a single process. Stores backed by a shared
//! database can implement the same trait.

use crate::error::{DiscoveryError, Result};
use crate::matcher::{matches, RecordFilter};
use async_trait::async_trait;
use discovery_types::{JsonObject, Record, RecordId, Status};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Which statuses a query may return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusScope {
    /// Only records whose status is `UP`
    #[default]
    UpOnly,
    /// Records in any status
    All,
}

/// Storage for published records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Validate and store a record, returning the stored copy with its id
    async fn insert(&self, record: Record) -> Result<Record>;

    /// Remove a record. Removing an unknown id is a no-op.
    async fn remove(&self, id: &RecordId) -> Result<Option<Record>>;

    /// Change the status of a record, returning the previous status and the updated record
    async fn update_status(&self, id: &RecordId, status: Status) -> Result<(Status, Record)>;

    /// Merge metadata entries into a record
    async fn update_metadata(&self, id: &RecordId, metadata: JsonObject) -> Result<Record>;

    /// Get a record by id
    async fn get(&self, id: &RecordId) -> Result<Record>;

    /// Records matching the filter, in publish order
    async fn query(&self, filter: &RecordFilter, scope: StatusScope) -> Result<Vec<Record>>;

    /// Number of stored records
    async fn len(&self) -> usize;

    /// Remove every record, returning how many were removed
    async fn clear(&self) -> Result<usize>;
}

#[derive(Default)]
struct StoreState {
    records: HashMap<RecordId, (u64, Record)>,
    order: BTreeMap<u64, RecordId>,
    next_seq: u64,
}

/// In-memory record store
///
/// All records sit behind one lock, so a query sees either all or none of a
/// concurrent mutation.
pub struct InMemoryRecordStore {
    state: RwLock<StoreState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: Record) -> Result<Record> {
        let id = RecordId::generate();
        let record = record.register(id.clone())?;

        let mut state = self.state.write();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, id.clone());
        state.records.insert(id, (seq, record.clone()));

        Ok(record)
    }

    async fn remove(&self, id: &RecordId) -> Result<Option<Record>> {
        let mut state = self.state.write();
        match state.records.remove(id) {
            Some((seq, record)) => {
                state.order.remove(&seq);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: &RecordId, status: Status) -> Result<(Status, Record)> {
        let mut state = self.state.write();
        let (_, record) = state
            .records
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::RecordNotFound(id.clone()))?;
        let previous = record.status();
        record.set_status(status);
        Ok((previous, record.clone()))
    }

    async fn update_metadata(&self, id: &RecordId, metadata: JsonObject) -> Result<Record> {
        let mut state = self.state.write();
        let (_, record) = state
            .records
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::RecordNotFound(id.clone()))?;
        record.merge_metadata(metadata);
        Ok(record.clone())
    }

    async fn get(&self, id: &RecordId) -> Result<Record> {
        self.state
            .read()
            .records
            .get(id)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| DiscoveryError::RecordNotFound(id.clone()))
    }

    async fn query(&self, filter: &RecordFilter, scope: StatusScope) -> Result<Vec<Record>> {
        let up_only = scope == StatusScope::UpOnly && !filter.constrains_status();

        let state = self.state.read();
        Ok(state
            .order
            .values()
            .filter_map(|id| state.records.get(id).map(|(_, record)| record))
            .filter(|record| !up_only || record.status() == Status::Up)
            .filter(|record| matches(record, filter))
            .cloned()
            .collect())
    }

    async fn len(&self) -> usize {
        self.state.read().records.len()
    }

    async fn clear(&self) -> Result<usize> {
        let mut state = self.state.write();
        let removed = state.records.len();
        state.records.clear();
        state.order.clear();
        Ok(removed)
    }
}
