//! The external store the consumer validates against and ingests into.

use agency_stream_core::types::ContractRequestRecord;
use core::fmt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Counterparty,
    RealEstate,
    ContractRequest,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counterparty => f.write_str("counterparty"),
            Self::RealEstate => f.write_str("real_estate"),
            Self::ContractRequest => f.write_str("contract_request"),
        }
    }
}

#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum DirectoryError {
    /// A referenced entity does not exist.
    #[error("{kind} {id} does not exist")]
    NotFound { kind: EntityKind, id: i32 },

    #[error("Directory unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Existence checks and entity creation against the external store.
#[tonic::async_trait]
pub trait EntityDirectory: Send + Sync {
    async fn exists(&self, kind: EntityKind, id: i32) -> Result<bool, DirectoryError>;

    /// Stores `record` and returns its new id.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::NotFound`] if either reference does not exist at
    /// creation time.
    async fn create_contract_request(
        &self,
        record: &ContractRequestRecord,
    ) -> Result<i32, DirectoryError>;
}

#[derive(Debug, Default)]
struct Entities {
    counterparties: BTreeSet<i32>,
    real_estates: BTreeSet<i32>,
    contract_requests: BTreeMap<i32, ContractRequestRecord>,
}

/// In-process [`EntityDirectory`].
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entities: Mutex<Entities>,
}

impl MemoryDirectory {
    /// A directory holding counterparties `1..=counterparties` and real
    /// estates `101..=100 + real_estates`.
    pub fn seeded(counterparties: i32, real_estates: i32) -> Self {
        Self {
            entities: Mutex::new(Entities {
                counterparties: (1..=counterparties).collect(),
                real_estates: (101..=100 + real_estates).collect(),
                contract_requests: BTreeMap::new(),
            }),
        }
    }

    pub fn add_counterparty(&self, id: i32) {
        self.entities.lock().counterparties.insert(id);
    }

    pub fn add_real_estate(&self, id: i32) {
        self.entities.lock().real_estates.insert(id);
    }

    /// Contract requests created so far, in id order.
    pub fn created(&self) -> Vec<(i32, ContractRequestRecord)> {
        self.entities
            .lock()
            .contract_requests
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    pub fn created_count(&self) -> usize {
        self.entities.lock().contract_requests.len()
    }
}

#[tonic::async_trait]
impl EntityDirectory for MemoryDirectory {
    async fn exists(&self, kind: EntityKind, id: i32) -> Result<bool, DirectoryError> {
        let entities = self.entities.lock();
        Ok(match kind {
            EntityKind::Counterparty => entities.counterparties.contains(&id),
            EntityKind::RealEstate => entities.real_estates.contains(&id),
            EntityKind::ContractRequest => entities.contract_requests.contains_key(&id),
        })
    }

    async fn create_contract_request(
        &self,
        record: &ContractRequestRecord,
    ) -> Result<i32, DirectoryError> {
        let mut entities = self.entities.lock();

        if !entities.counterparties.contains(&record.counterparty_id) {
            return Err(DirectoryError::NotFound {
                kind: EntityKind::Counterparty,
                id: record.counterparty_id,
            });
        }
        if !entities.real_estates.contains(&record.real_estate_id) {
            return Err(DirectoryError::NotFound {
                kind: EntityKind::RealEstate,
                id: record.real_estate_id,
            });
        }

        let id = entities
            .contract_requests
            .last_key_value()
            .map_or(1, |(id, _)| id + 1);
        entities.contract_requests.insert(id, record.clone());
        Ok(id)
    }
}
