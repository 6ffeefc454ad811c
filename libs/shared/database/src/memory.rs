//! In-process store backend. Holds every row in memory; used by tests and by
//! single-instance deployments without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use shared_models::AuditRecord;

use crate::store::{
    Committed, OutboxMessage, StoreBackend, StoreError, Tables, Transaction, UnitParts, UnitScope,
    Versioned,
};

fn apply_rows<T>(table: &mut HashMap<Uuid, Versioned<T>>, writes: HashMap<Uuid, T>) {
    for (id, row) in writes {
        let version = table.get(&id).map_or(1, |current| current.version + 1);
        table.insert(id, Versioned { version, row });
    }
}

/// Every row lives in one copy-on-write table set. A unit keeps the set it
/// began from alive; commit swaps in a new set only while such readers exist.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<Arc<Tables>>>,
    audit_log: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unit sees every row, so no scope is needed.
    pub fn begin(&self) -> Result<Transaction, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(Transaction::new(Arc::clone(&state)))
    }

    /// Read-only view of the last committed state.
    pub fn snapshot(&self) -> Result<Transaction, StoreError> {
        self.begin()
    }

    pub fn commit(&self, tx: Transaction) -> Result<(Vec<AuditRecord>, Vec<OutboxMessage>), StoreError> {
        let UnitParts {
            writes,
            locks,
            audit,
            outbox,
        } = tx.into_parts();
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;

        for (key, seen) in &locks {
            let current = state.version_of(key);
            if current != *seen {
                debug!("Commit rejected: {} moved from version {} to {}", key, seen, current);
                return Err(StoreError::Contention(key.clone()));
            }
        }

        let tables = Arc::make_mut(&mut *state);
        apply_rows(&mut tables.appointments, writes.appointments);
        apply_rows(&mut tables.queue_entries, writes.queue_entries);
        apply_rows(&mut tables.rooms, writes.rooms);
        apply_rows(&mut tables.practitioners, writes.practitioners);
        for (key, value) in writes.queue_counters {
            let version = tables
                .queue_counters
                .get(&key)
                .map_or(1, |current| current.version + 1);
            tables.queue_counters.insert(key, Versioned { version, row: value });
        }

        self.audit_log
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .extend(audit.iter().cloned());

        Ok((audit, outbox))
    }

    /// Runs `work` as one atomic unit. An `Err` from `work` discards the unit;
    /// an `Ok` is committed, or rejected with [`StoreError::Contention`].
    pub fn atomic<T, E, F>(&self, work: F) -> Result<Committed<T>, E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin()?;
        let value = work(&mut tx)?;
        let (audit, outbox) = self.commit(tx)?;
        Ok(Committed {
            value,
            audit,
            outbox,
        })
    }

    pub fn audit_log(&self) -> Result<Vec<AuditRecord>, StoreError> {
        let log = self.audit_log.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(log.clone())
    }

    #[cfg(test)]
    fn tables_ptr(&self) -> *const Tables {
        self.state
            .read()
            .map(|state| Arc::as_ptr(&state))
            .unwrap_or(std::ptr::null())
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn begin(&self, _scope: &UnitScope) -> Result<Transaction, StoreError> {
        MemoryStore::begin(self)
    }

    async fn commit(&self, tx: Transaction) -> Result<(Vec<AuditRecord>, Vec<OutboxMessage>), StoreError> {
        MemoryStore::commit(self, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RowKey;
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, TimeZone, Utc};
    use shared_models::{Appointment, AppointmentStatus, Room, RoomStatus};

    fn appointment() -> Appointment {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        Appointment {
            id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            patient_name: "Ada".to_string(),
            patient_contact: "ada@example.com".to_string(),
            scheduled_start: at,
            service_id: Uuid::new_v4(),
            status: AppointmentStatus::Booked,
            practitioner_id: None,
            room_label: None,
            is_late: false,
            checked_in_at: None,
            treatment_started_at: None,
            treatment_ended_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn seeded(store: &MemoryStore, row: Appointment) {
        store
            .atomic(|tx| {
                tx.put_appointment(row);
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn failed_unit_leaves_no_trace() {
        let store = MemoryStore::new();
        let row = appointment();
        let id = row.id;

        let result: Result<Committed<()>, StoreError> = store.atomic(|tx| {
            tx.put_appointment(row);
            Err(StoreError::Poisoned)
        });

        assert!(result.is_err());
        assert!(store.snapshot().unwrap().appointment(id).is_none());
    }

    #[test]
    fn second_writer_of_same_row_is_rejected() {
        let store = MemoryStore::new();
        let row = appointment();
        let id = row.id;
        seeded(&store, row);

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();

        let mut a = first.lock_appointment(id).unwrap();
        a.status = AppointmentStatus::Confirmed;
        first.put_appointment(a);

        let mut b = second.lock_appointment(id).unwrap();
        b.status = AppointmentStatus::Cancelled;
        second.put_appointment(b);

        assert!(store.commit(first).is_ok());
        assert_matches!(store.commit(second), Err(StoreError::Contention(RowKey::Appointment(_))));
        assert_eq!(
            store.snapshot().unwrap().appointment(id).unwrap().status,
            AppointmentStatus::Confirmed
        );
    }

    #[test]
    fn queue_numbers_conflict_across_units() {
        let store = MemoryStore::new();
        let location = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        assert_eq!(first.next_queue_number(location, date), 1);
        assert_eq!(second.next_queue_number(location, date), 1);

        assert!(store.commit(first).is_ok());
        assert!(store.commit(second).unwrap_err().is_contention());

        let mut third = store.begin().unwrap();
        assert_eq!(third.next_queue_number(location, date), 2);
        assert_eq!(third.next_queue_number(location, date), 3);
    }

    #[test]
    fn savepoint_discards_nested_work_only() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let room = Room {
            id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            number: 1,
            capacity: 1,
            is_active: true,
            status: RoomStatus::Available,
        };
        tx.put_room(room.clone());
        let savepoint = tx.savepoint();

        let mut occupied = room.clone();
        occupied.status = RoomStatus::Occupied;
        tx.put_room(occupied);
        tx.put_appointment(appointment());
        tx.enqueue("notification", serde_json::json!({"to": "x"}));
        tx.rollback_to(savepoint);

        assert_eq!(tx.room(room.id).unwrap().status, RoomStatus::Available);
        assert!(tx.appointments().is_empty());
        assert_eq!(tx.lock_trail(), vec![RowKey::Room(room.id)]);

        let (_, outbox) = store.commit(tx).unwrap();
        assert!(outbox.is_empty());
    }

    #[test]
    fn audit_records_commit_with_the_unit() {
        let store = MemoryStore::new();
        let row = appointment();
        let id = row.id;
        let at = row.created_at;

        let committed = store
            .atomic(|tx| {
                tx.put_appointment(row);
                tx.record_audit(AuditRecord::new("create", "appointment", id, "created", at));
                Ok::<_, StoreError>(id)
            })
            .unwrap();

        assert_eq!(committed.value, id);
        assert_eq!(committed.audit.len(), 1);
        assert_eq!(store.audit_log().unwrap().len(), 1);
    }

    #[test]
    fn commit_updates_tables_in_place_when_no_reader_holds_them() {
        let store = MemoryStore::new();
        seeded(&store, appointment());
        let before = store.tables_ptr();

        for _ in 0..3 {
            seeded(&store, appointment());
        }

        assert_eq!(store.tables_ptr(), before);
        assert_eq!(store.snapshot().unwrap().appointments().len(), 4);
    }

    #[test]
    fn open_snapshot_keeps_its_view_after_commit() {
        let store = MemoryStore::new();
        let snapshot = store.snapshot().unwrap();
        seeded(&store, appointment());

        assert!(snapshot.appointments().is_empty());
        assert_eq!(store.snapshot().unwrap().appointments().len(), 1);
    }
}
