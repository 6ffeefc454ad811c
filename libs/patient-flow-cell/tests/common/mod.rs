#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use uuid::Uuid;

use patient_flow_cell::{
    AuditSink, BookAppointmentRequest, FixedClock, FlowSettings, InMemoryServiceCatalog, Notifier,
    PatientFlowEngine,
};
use resource_cell::{CreatePractitionerRequest, CreateRoomRequest, PractitionerService, RoomService};
use shared_database::{
    ClinicStore, MemoryStore, OutboxMessage, RetryPolicy, RowKey, StoreBackend, StoreError, Transaction,
    UnitScope,
};
use shared_models::{Appointment, AppointmentStatus, AuditRecord, Practitioner, QueueEntry, Room};

pub const SERVICE_MINUTES: u32 = 30;

/// 09:00 on the clinic day every test runs on.
pub fn opening_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
}

pub fn test_settings() -> FlowSettings {
    FlowSettings {
        utc_offset: FixedOffset::east_opt(0).unwrap(),
        transaction_retry: RetryPolicy::new().with_initial_delay(StdDuration::from_millis(1)),
        notification_retry: RetryPolicy::new().with_initial_delay(StdDuration::from_millis(1)),
        ..FlowSettings::default()
    }
}

/// Notifier that hands every message to the test.
pub struct RecordingNotifier {
    sender: mpsc::UnboundedSender<(String, String)>,
}

impl RecordingNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, String)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, contact: &str, message: &str) -> Result<()> {
        self.sender
            .send((contact.to_string(), message.to_string()))
            .map_err(|_| anyhow!("test receiver dropped"))
    }
}

/// Notifier whose transport is always down.
#[derive(Default)]
pub struct FailingNotifier {
    pub attempts: AtomicU32,
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _contact: &str, _message: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("gateway timeout"))
    }
}

#[derive(Default)]
pub struct RecordingAuditSink {
    pub records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn actions(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|record| record.action.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// In-memory backend whose commits can be made to lose every race.
pub struct ContendedBackend {
    inner: MemoryStore,
    contended: AtomicBool,
    pub rejected_commits: AtomicU32,
}

impl ContendedBackend {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            contended: AtomicBool::new(false),
            rejected_commits: AtomicU32::new(0),
        }
    }

    pub fn set_contended(&self, contended: bool) {
        self.contended.store(contended, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreBackend for ContendedBackend {
    async fn begin(&self, scope: &UnitScope) -> Result<Transaction, StoreError> {
        StoreBackend::begin(&self.inner, scope).await
    }

    async fn commit(&self, tx: Transaction) -> Result<(Vec<AuditRecord>, Vec<OutboxMessage>), StoreError> {
        if self.contended.load(Ordering::SeqCst) {
            self.rejected_commits.fetch_add(1, Ordering::SeqCst);
            let key = tx.lock_trail().into_iter().next().unwrap_or(RowKey::Room(Uuid::nil()));
            return Err(StoreError::Contention(key));
        }
        StoreBackend::commit(&self.inner, tx).await
    }
}

/// One clinic location with a seeded store, a fixed clock at opening time
/// and recording collaborators.
pub struct Clinic {
    pub engine: PatientFlowEngine,
    pub store: ClinicStore,
    /// The rows behind `store`, readable without going through the engine.
    pub memory: MemoryStore,
    pub clock: FixedClock,
    pub catalog: Arc<InMemoryServiceCatalog>,
    pub audit: Arc<RecordingAuditSink>,
    pub notifications: mpsc::UnboundedReceiver<(String, String)>,
    pub location_id: Uuid,
    pub service_id: Uuid,
}

impl Clinic {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// A second clinic sharing the same store and practitioners pool.
    pub fn with_store(memory: MemoryStore) -> Self {
        let backend = Arc::new(memory.clone());
        Self::with_backend(memory, backend)
    }

    pub fn with_backend(memory: MemoryStore, backend: Arc<dyn StoreBackend>) -> Self {
        let store = ClinicStore::new(backend);
        let clock = FixedClock::new(opening_time());
        let service_id = Uuid::new_v4();
        let catalog = Arc::new(InMemoryServiceCatalog::new().with_service(service_id, SERVICE_MINUTES));
        let audit = Arc::new(RecordingAuditSink::default());
        let (notifier, notifications) = RecordingNotifier::new();

        let engine = PatientFlowEngine::new(store.clone(), test_settings())
            .with_clock(Arc::new(clock.clone()))
            .with_catalog(catalog.clone())
            .with_audit_sink(audit.clone())
            .with_notifier(Arc::new(notifier));

        Self {
            engine,
            store,
            memory,
            clock,
            catalog,
            audit,
            notifications,
            location_id: Uuid::new_v4(),
            service_id,
        }
    }

    pub async fn add_rooms(&self, count: u32) -> Vec<Room> {
        let service = RoomService::new(self.store.clone());
        let mut rooms = Vec::new();
        for number in 1..=count {
            let room = service
                .register_room(CreateRoomRequest {
                    location_id: self.location_id,
                    number,
                    capacity: None,
                })
                .await
                .unwrap();
            rooms.push(room);
        }
        rooms
    }

    pub async fn add_practitioner(&self, name: &str) -> Practitioner {
        self.add_practitioner_at(name, vec![self.location_id]).await
    }

    pub async fn add_practitioner_at(&self, name: &str, location_ids: Vec<Uuid>) -> Practitioner {
        PractitionerService::new(self.store.clone())
            .register_practitioner(CreatePractitionerRequest {
                name: name.to_string(),
                location_ids,
            })
            .await
            .unwrap()
    }

    /// Booked appointment `minutes` after the current clock reading.
    pub async fn book_in(&self, minutes: i64) -> Appointment {
        self.book_with(minutes, AppointmentStatus::Booked, self.service_id).await
    }

    pub async fn book_confirmed_in(&self, minutes: i64) -> Appointment {
        self.book_with(minutes, AppointmentStatus::Confirmed, self.service_id).await
    }

    pub async fn book_with(&self, minutes: i64, status: AppointmentStatus, service_id: Uuid) -> Appointment {
        self.engine
            .book_appointment(BookAppointmentRequest {
                location_id: self.location_id,
                patient_name: format!("Patient {}", &Uuid::new_v4().to_string()[..8]),
                patient_contact: "patient@example.com".to_string(),
                scheduled_start: self.clock_now() + Duration::minutes(minutes),
                service_id,
                status: Some(status),
                practitioner_id: None,
            })
            .await
            .unwrap()
    }

    /// Book and check in a patient due now.
    pub async fn arrive(&self) -> (Appointment, QueueEntry) {
        let appointment = self.book_in(0).await;
        let receipt = self.engine.check_in(appointment.id).await.unwrap();
        (receipt.appointment, receipt.entry)
    }

    pub fn appointment(&self, id: Uuid) -> Appointment {
        self.memory.snapshot().unwrap().appointment(id).unwrap()
    }

    pub fn entry_for(&self, appointment_id: Uuid) -> QueueEntry {
        self.memory
            .snapshot()
            .unwrap()
            .queue_entry_for_appointment(appointment_id)
            .unwrap()
    }

    pub fn room(&self, id: Uuid) -> Room {
        self.memory.snapshot().unwrap().room(id).unwrap()
    }

    pub fn practitioner(&self, id: Uuid) -> Practitioner {
        self.memory.snapshot().unwrap().practitioner(id).unwrap()
    }

    fn clock_now(&self) -> DateTime<Utc> {
        use patient_flow_cell::Clock;
        self.clock.now()
    }
}
