//! Transactional clinic store.
//!
//! Every multi-row mutation runs inside an atomic unit ([`ClinicStore::atomic`]).
//! A unit works against the rows loaded when it began plus a private write
//! set. Rows are locked explicitly (`lock_*`) or implicitly on write; the lock
//! trail records the version each row had when it was first locked. Commit is
//! the backend's job ([`StoreBackend`]): it takes exclusive locks on the trail
//! in acquisition order, re-validates every version and rejects the unit with
//! [`StoreError::Contention`] if any locked row moved on, so two units that
//! touch the same row can never both commit. Audit records and outbox messages
//! produced by a unit become visible only if it commits.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use shared_models::{Appointment, AuditRecord, Practitioner, QueueEntry, Room};

use crate::memory::MemoryStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Row not found: {0}")]
    NotFound(RowKey),

    #[error("Concurrent modification of {0}")]
    Contention(RowKey),

    /// Uniqueness, serialization or deadlock failure reported by the database.
    #[error("Conflicting concurrent write: {0}")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention(_) | StoreError::Conflict(_))
    }
}

/// Identity of a lockable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Appointment(Uuid),
    QueueEntry(Uuid),
    Room(Uuid),
    Practitioner(Uuid),
    QueueCounter(Uuid, NaiveDate),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Appointment(id) => write!(f, "appointment:{}", id),
            RowKey::QueueEntry(id) => write!(f, "queue_entry:{}", id),
            RowKey::Room(id) => write!(f, "room:{}", id),
            RowKey::Practitioner(id) => write!(f, "practitioner:{}", id),
            RowKey::QueueCounter(location, date) => write!(f, "queue_counter:{}:{}", location, date),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Versioned<T> {
    pub(crate) version: u64,
    pub(crate) row: T,
}

/// Rows visible to a unit, each with the version it was read at.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub(crate) appointments: HashMap<Uuid, Versioned<Appointment>>,
    pub(crate) queue_entries: HashMap<Uuid, Versioned<QueueEntry>>,
    pub(crate) rooms: HashMap<Uuid, Versioned<Room>>,
    pub(crate) practitioners: HashMap<Uuid, Versioned<Practitioner>>,
    pub(crate) queue_counters: HashMap<(Uuid, NaiveDate), Versioned<u32>>,
}

impl Tables {
    pub(crate) fn version_of(&self, key: &RowKey) -> u64 {
        let version = match key {
            RowKey::Appointment(id) => self.appointments.get(id).map(|v| v.version),
            RowKey::QueueEntry(id) => self.queue_entries.get(id).map(|v| v.version),
            RowKey::Room(id) => self.rooms.get(id).map(|v| v.version),
            RowKey::Practitioner(id) => self.practitioners.get(id).map(|v| v.version),
            RowKey::QueueCounter(location, date) => {
                self.queue_counters.get(&(*location, *date)).map(|v| v.version)
            }
        };
        version.unwrap_or(0)
    }
}

/// Side effect recorded inside a unit and released only after commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxMessage {
    pub topic: String,
    pub payload: Value,
}

/// Result of a committed unit.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    pub audit: Vec<AuditRecord>,
    pub outbox: Vec<OutboxMessage>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct WriteSet {
    pub(crate) appointments: HashMap<Uuid, Appointment>,
    pub(crate) queue_entries: HashMap<Uuid, QueueEntry>,
    pub(crate) rooms: HashMap<Uuid, Room>,
    pub(crate) practitioners: HashMap<Uuid, Practitioner>,
    pub(crate) queue_counters: HashMap<(Uuid, NaiveDate), u32>,
}

/// What a backend needs to commit a unit. The base rows are not part of it.
pub(crate) struct UnitParts {
    pub(crate) writes: WriteSet,
    pub(crate) locks: Vec<(RowKey, u64)>,
    pub(crate) audit: Vec<AuditRecord>,
    pub(crate) outbox: Vec<OutboxMessage>,
}

/// Rows a unit needs beyond the live set every backend always provides
/// (all rooms and practitioners, appointments that are not terminal, queue
/// entries that are waiting or in treatment).
#[derive(Debug, Clone, Default)]
pub struct UnitScope {
    pub appointments: Vec<Uuid>,
    pub queue_entries: Vec<Uuid>,
    /// Whole clinic-days: every entry of the day and its queue counter.
    pub days: Vec<(Uuid, NaiveDate)>,
}

impl UnitScope {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn appointment(id: Uuid) -> Self {
        Self {
            appointments: vec![id],
            ..Self::default()
        }
    }

    pub fn queue_entry(id: Uuid) -> Self {
        Self {
            queue_entries: vec![id],
            ..Self::default()
        }
    }

    pub fn day(location_id: Uuid, date: NaiveDate) -> Self {
        Self {
            days: vec![(location_id, date)],
            ..Self::default()
        }
    }

    pub fn with_day(mut self, location_id: Uuid, date: NaiveDate) -> Self {
        self.days.push((location_id, date));
        self
    }
}

/// Marker allowing part of a unit to be undone without abandoning the unit.
#[derive(Debug, Clone)]
pub struct Savepoint {
    writes: WriteSet,
    locks: usize,
    audit: usize,
    outbox: usize,
}

pub struct Transaction {
    base: Arc<Tables>,
    writes: WriteSet,
    locks: Vec<(RowKey, u64)>,
    audit: Vec<AuditRecord>,
    outbox: Vec<OutboxMessage>,
}

fn merged<T: Clone>(base: &HashMap<Uuid, Versioned<T>>, writes: &HashMap<Uuid, T>) -> Vec<T> {
    let mut rows: Vec<T> = base
        .iter()
        .filter(|(id, _)| !writes.contains_key(id))
        .map(|(_, versioned)| versioned.row.clone())
        .collect();
    rows.extend(writes.values().cloned());
    rows
}

impl Transaction {
    pub(crate) fn new(base: Arc<Tables>) -> Self {
        Self {
            base,
            writes: WriteSet::default(),
            locks: Vec::new(),
            audit: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> UnitParts {
        let Transaction {
            base,
            writes,
            locks,
            audit,
            outbox,
        } = self;
        drop(base);
        UnitParts {
            writes,
            locks,
            audit,
            outbox,
        }
    }

    fn ensure_locked(&mut self, key: RowKey) {
        if self.locks.iter().any(|(held, _)| *held == key) {
            return;
        }
        let version = self.base.version_of(&key);
        debug!("Locking {} at version {}", key, version);
        self.locks.push((key, version));
    }

    /// Rows locked so far, in acquisition order.
    pub fn lock_trail(&self) -> Vec<RowKey> {
        self.locks.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            writes: self.writes.clone(),
            locks: self.locks.len(),
            audit: self.audit.len(),
            outbox: self.outbox.len(),
        }
    }

    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.writes = savepoint.writes;
        self.locks.truncate(savepoint.locks);
        self.audit.truncate(savepoint.audit);
        self.outbox.truncate(savepoint.outbox);
    }

    // --- appointments -------------------------------------------------------

    pub fn appointment(&self, id: Uuid) -> Option<Appointment> {
        self.writes
            .appointments
            .get(&id)
            .cloned()
            .or_else(|| self.base.appointments.get(&id).map(|v| v.row.clone()))
    }

    pub fn lock_appointment(&mut self, id: Uuid) -> Result<Appointment, StoreError> {
        let row = self
            .appointment(id)
            .ok_or(StoreError::NotFound(RowKey::Appointment(id)))?;
        self.ensure_locked(RowKey::Appointment(id));
        Ok(row)
    }

    pub fn put_appointment(&mut self, row: Appointment) {
        self.ensure_locked(RowKey::Appointment(row.id));
        self.writes.appointments.insert(row.id, row);
    }

    pub fn appointments(&self) -> Vec<Appointment> {
        merged(&self.base.appointments, &self.writes.appointments)
    }

    // --- queue entries ------------------------------------------------------

    pub fn queue_entry(&self, id: Uuid) -> Option<QueueEntry> {
        self.writes
            .queue_entries
            .get(&id)
            .cloned()
            .or_else(|| self.base.queue_entries.get(&id).map(|v| v.row.clone()))
    }

    pub fn lock_queue_entry(&mut self, id: Uuid) -> Result<QueueEntry, StoreError> {
        let row = self
            .queue_entry(id)
            .ok_or(StoreError::NotFound(RowKey::QueueEntry(id)))?;
        self.ensure_locked(RowKey::QueueEntry(id));
        Ok(row)
    }

    pub fn put_queue_entry(&mut self, row: QueueEntry) {
        self.ensure_locked(RowKey::QueueEntry(row.id));
        self.writes.queue_entries.insert(row.id, row);
    }

    pub fn queue_entries(&self) -> Vec<QueueEntry> {
        merged(&self.base.queue_entries, &self.writes.queue_entries)
    }

    pub fn queue_entry_for_appointment(&self, appointment_id: Uuid) -> Option<QueueEntry> {
        self.queue_entries()
            .into_iter()
            .find(|entry| entry.appointment_id == appointment_id)
    }

    /// Entries of one clinic-day ordered by queue number.
    pub fn queue_entries_for_day(&self, location_id: Uuid, date: NaiveDate) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .queue_entries()
            .into_iter()
            .filter(|entry| entry.location_id == location_id && entry.clinic_date == date)
            .collect();
        entries.sort_by_key(|entry| entry.queue_number);
        entries
    }

    /// Entries currently in treatment at any location.
    pub fn entries_in_treatment(&self) -> Vec<QueueEntry> {
        self.queue_entries()
            .into_iter()
            .filter(|entry| entry.is_in_treatment())
            .collect()
    }

    /// Allocates the next queue number for a clinic-day. The counter row is
    /// locked, so two units allocating for the same day cannot both commit.
    pub fn next_queue_number(&mut self, location_id: Uuid, date: NaiveDate) -> u32 {
        let key = (location_id, date);
        let current = self
            .writes
            .queue_counters
            .get(&key)
            .copied()
            .or_else(|| self.base.queue_counters.get(&key).map(|v| v.row))
            .unwrap_or(0);
        let next = current + 1;
        self.ensure_locked(RowKey::QueueCounter(location_id, date));
        self.writes.queue_counters.insert(key, next);
        next
    }

    // --- rooms --------------------------------------------------------------

    pub fn room(&self, id: Uuid) -> Option<Room> {
        self.writes
            .rooms
            .get(&id)
            .cloned()
            .or_else(|| self.base.rooms.get(&id).map(|v| v.row.clone()))
    }

    pub fn lock_room(&mut self, id: Uuid) -> Result<Room, StoreError> {
        let row = self.room(id).ok_or(StoreError::NotFound(RowKey::Room(id)))?;
        self.ensure_locked(RowKey::Room(id));
        Ok(row)
    }

    pub fn put_room(&mut self, row: Room) {
        self.ensure_locked(RowKey::Room(row.id));
        self.writes.rooms.insert(row.id, row);
    }

    pub fn rooms(&self) -> Vec<Room> {
        merged(&self.base.rooms, &self.writes.rooms)
    }

    // --- practitioners ------------------------------------------------------

    pub fn practitioner(&self, id: Uuid) -> Option<Practitioner> {
        self.writes
            .practitioners
            .get(&id)
            .cloned()
            .or_else(|| self.base.practitioners.get(&id).map(|v| v.row.clone()))
    }

    pub fn lock_practitioner(&mut self, id: Uuid) -> Result<Practitioner, StoreError> {
        let row = self
            .practitioner(id)
            .ok_or(StoreError::NotFound(RowKey::Practitioner(id)))?;
        self.ensure_locked(RowKey::Practitioner(id));
        Ok(row)
    }

    pub fn put_practitioner(&mut self, row: Practitioner) {
        self.ensure_locked(RowKey::Practitioner(row.id));
        self.writes.practitioners.insert(row.id, row);
    }

    pub fn practitioners(&self) -> Vec<Practitioner> {
        merged(&self.base.practitioners, &self.writes.practitioners)
    }

    // --- audit & outbox -----------------------------------------------------

    pub fn record_audit(&mut self, record: AuditRecord) {
        self.audit.push(record);
    }

    pub fn enqueue(&mut self, topic: impl Into<String>, payload: Value) {
        self.outbox.push(OutboxMessage {
            topic: topic.into(),
            payload,
        });
    }
}

/// Where atomic units are loaded from and committed to.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Starts a unit over the live set plus whatever `scope` names.
    async fn begin(&self, scope: &UnitScope) -> Result<Transaction, StoreError>;

    /// Locks the unit's trail in acquisition order, re-validates every version
    /// and applies the write set together with the unit's audit records.
    async fn commit(&self, tx: Transaction) -> Result<(Vec<AuditRecord>, Vec<OutboxMessage>), StoreError>;
}

/// Shared clinic store. Cloning is cheap; clones share one backend.
#[derive(Clone)]
pub struct ClinicStore {
    backend: Arc<dyn StoreBackend>,
}

impl ClinicStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Store held entirely in process memory.
    pub fn in_memory() -> Self {
        Self::from(MemoryStore::new())
    }

    pub async fn begin(&self, scope: &UnitScope) -> Result<Transaction, StoreError> {
        self.backend.begin(scope).await
    }

    /// Read-only view of the last committed state.
    pub async fn snapshot(&self, scope: &UnitScope) -> Result<Transaction, StoreError> {
        self.backend.begin(scope).await
    }

    pub async fn commit(&self, tx: Transaction) -> Result<(Vec<AuditRecord>, Vec<OutboxMessage>), StoreError> {
        self.backend.commit(tx).await
    }

    /// Runs `work` as one atomic unit. An `Err` from `work` discards the unit;
    /// an `Ok` is committed, or rejected with [`StoreError::Contention`].
    pub async fn atomic<T, E, F>(&self, scope: &UnitScope, work: F) -> Result<Committed<T>, E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin(scope).await?;
        let value = work(&mut tx)?;
        let (audit, outbox) = self.commit(tx).await?;
        Ok(Committed {
            value,
            audit,
            outbox,
        })
    }
}

impl From<MemoryStore> for ClinicStore {
    fn from(store: MemoryStore) -> Self {
        Self::new(Arc::new(store))
    }
}

impl Default for ClinicStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
