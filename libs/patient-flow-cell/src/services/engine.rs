//! Entry point for every patient-flow operation.
//!
//! Each operation reads its [`OperationContext`] up front, runs its mutations
//! as one atomic unit with bounded retry on contention, and only after the
//! unit commits forwards audit records, publishes transition events and
//! hands notifications to a background task.

use chrono::NaiveDate;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shared_database::{run_atomic, ClinicStore, Committed, UnitScope};
use shared_models::{Appointment, AppointmentStatus, AuditRecord};

use crate::context::{Clock, FlowSettings, OperationContext, SystemClock};
use crate::error::FlowError;
use crate::models::{
    Assignment, BookAppointmentRequest, CheckInReceipt, Notification, QueueSnapshot, TransitionEvent,
    TransitionOutcome, NOTIFICATION_TOPIC, TRANSITION_TOPIC,
};
use crate::services::audit::{AuditSink, TracingAuditSink};
use crate::services::catalog::{InMemoryServiceCatalog, ServiceCatalog};
use crate::services::events::EventBus;
use crate::services::notifier::{self, LogNotifier, Notifier};
use crate::services::pause::{InMemoryPauseFlags, PauseFlags};
use crate::services::{assignment, check_in, eta, lifecycle, snapshot, sweeper};

#[derive(Clone)]
pub struct PatientFlowEngine {
    store: ClinicStore,
    settings: FlowSettings,
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn ServiceCatalog>,
    notifier: Arc<dyn Notifier>,
    audit_sink: Arc<dyn AuditSink>,
    pause_flags: Arc<dyn PauseFlags>,
    events: EventBus,
}

impl PatientFlowEngine {
    /// Engine with in-process collaborators; swap them with the `with_*` builders.
    pub fn new(store: ClinicStore, settings: FlowSettings) -> Self {
        Self {
            store,
            settings,
            clock: Arc::new(SystemClock),
            catalog: Arc::new(InMemoryServiceCatalog::new()),
            notifier: Arc::new(LogNotifier),
            audit_sink: Arc::new(TracingAuditSink),
            pause_flags: Arc::new(InMemoryPauseFlags::new()),
            events: EventBus::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_audit_sink(mut self, audit_sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = audit_sink;
        self
    }

    pub fn with_pause_flags(mut self, pause_flags: Arc<dyn PauseFlags>) -> Self {
        self.pause_flags = pause_flags;
        self
    }

    pub fn store(&self) -> &ClinicStore {
        &self.store
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    // ==========================================================================
    // APPOINTMENTS
    // ==========================================================================

    /// Put an already-booked appointment on the books of the same-day flow.
    #[instrument(skip(self, request))]
    pub async fn book_appointment(&self, request: BookAppointmentRequest) -> Result<Appointment, FlowError> {
        let patient_name = request.patient_name.trim().to_string();
        if patient_name.is_empty() {
            return Err(FlowError::ValidationError("Patient name is required".to_string()));
        }
        if request.patient_contact.trim().is_empty() {
            return Err(FlowError::ValidationError("Patient contact is required".to_string()));
        }
        let status = request.status.unwrap_or(AppointmentStatus::Booked);
        if !matches!(status, AppointmentStatus::Booked | AppointmentStatus::Confirmed) {
            return Err(FlowError::ValidationError(format!(
                "New appointments must be booked or confirmed, not {}",
                status
            )));
        }

        let ctx = self.context();
        let scope = UnitScope::none();
        let committed = run_atomic(&self.store, &scope, &self.settings.transaction_retry, "book_appointment", |tx| {
            let appointment = Appointment {
                id: Uuid::new_v4(),
                location_id: request.location_id,
                patient_name: patient_name.clone(),
                patient_contact: request.patient_contact.clone(),
                scheduled_start: request.scheduled_start,
                service_id: request.service_id,
                status,
                practitioner_id: request.practitioner_id,
                room_label: None,
                is_late: false,
                checked_in_at: None,
                treatment_started_at: None,
                treatment_ended_at: None,
                created_at: ctx.now,
                updated_at: ctx.now,
            };
            tx.put_appointment(appointment.clone());
            tx.record_audit(
                AuditRecord::new(
                    "appointment.book",
                    "appointment",
                    appointment.id,
                    format!("{} at {}", status, appointment.scheduled_start),
                    ctx.now,
                )
                .with_change(None, Some(json!(appointment))),
            );
            Ok::<_, FlowError>(appointment)
        })
        .await?;

        let appointment = self.dispatch(committed).await;
        info!(appointment_id = %appointment.id, "Appointment added to the day's flow");
        Ok(appointment)
    }

    pub async fn get_appointment(&self, appointment_id: Uuid) -> Result<Appointment, FlowError> {
        self.store
            .snapshot(&UnitScope::appointment(appointment_id))
            .await?
            .appointment(appointment_id)
            .ok_or(FlowError::AppointmentNotFound(appointment_id))
    }

    #[instrument(skip(self, reason))]
    pub async fn transition(
        &self,
        appointment_id: Uuid,
        target: AppointmentStatus,
        reason: &str,
    ) -> Result<TransitionOutcome, FlowError> {
        let location_id = self.get_appointment(appointment_id).await?.location_id;
        let ctx = self.context_for(location_id).await?;
        let scope = UnitScope::appointment(appointment_id).with_day(location_id, ctx.today());

        let committed = run_atomic(&self.store, &scope, &self.settings.transaction_retry, "transition", |tx| {
            lifecycle::apply_transition(tx, &ctx, appointment_id, target, reason)
        })
        .await?;
        Ok(self.dispatch(committed).await)
    }

    // ==========================================================================
    // QUEUE
    // ==========================================================================

    #[instrument(skip(self))]
    pub async fn check_in(&self, appointment_id: Uuid) -> Result<CheckInReceipt, FlowError> {
        let location_id = self.get_appointment(appointment_id).await?.location_id;
        let ctx = self.context_for(location_id).await?;
        let early = self.settings.check_in_early;
        let scope = UnitScope::appointment(appointment_id).with_day(location_id, ctx.today());

        let committed = run_atomic(&self.store, &scope, &self.settings.transaction_retry, "check_in", |tx| {
            check_in::check_in(tx, &ctx, early, appointment_id)
        })
        .await?;
        Ok(self.dispatch(committed).await)
    }

    #[instrument(skip(self))]
    pub async fn assign_next(&self, location_id: Uuid) -> Result<Assignment, FlowError> {
        let ctx = self.context_for(location_id).await?;
        let scope = UnitScope::day(location_id, ctx.today());

        let committed = run_atomic(&self.store, &scope, &self.settings.transaction_retry, "assign_next", |tx| {
            assignment::assign_next(tx, &ctx, location_id, "assigned from queue")
        })
        .await?;
        Ok(self.dispatch(committed).await)
    }

    /// Staff-directed assignment of one queue entry.
    #[instrument(skip(self))]
    pub async fn assign(&self, entry_id: Uuid) -> Result<Assignment, FlowError> {
        let scope = UnitScope::queue_entry(entry_id);
        let location_id = self
            .store
            .snapshot(&scope)
            .await?
            .queue_entry(entry_id)
            .ok_or(FlowError::QueueEntryNotFound(entry_id))?
            .location_id;
        let ctx = self.context_for(location_id).await?;
        let scope = scope.with_day(location_id, ctx.today());

        let committed = run_atomic(&self.store, &scope, &self.settings.transaction_retry, "assign", |tx| {
            assignment::assign_entry(tx, &ctx, entry_id, "called by staff")
        })
        .await?;
        Ok(self.dispatch(committed).await)
    }

    /// Expected wait in minutes; `None` before check-in or after the visit.
    pub async fn estimate_wait(&self, appointment_id: Uuid) -> Result<Option<u32>, FlowError> {
        let snapshot = self.store.snapshot(&UnitScope::appointment(appointment_id)).await?;
        let appointment = snapshot
            .appointment(appointment_id)
            .ok_or(FlowError::AppointmentNotFound(appointment_id))?;
        let inputs = eta::collect_inputs(&snapshot, &appointment);

        let mut durations = HashMap::new();
        for service_id in inputs.service_ids() {
            durations.insert(service_id, self.service_minutes(service_id).await);
        }
        let default_minutes = self.settings.default_service_minutes;

        Ok(eta::estimate(&inputs, self.clock.now(), |service_id| {
            durations.get(&service_id).copied().unwrap_or(default_minutes)
        }))
    }

    pub async fn queue_snapshot(&self, location_id: Uuid, date: Option<NaiveDate>) -> Result<QueueSnapshot, FlowError> {
        let clinic_date = date.unwrap_or_else(|| self.context().today());
        let snapshot = self.store.snapshot(&UnitScope::day(location_id, clinic_date)).await?;
        Ok(snapshot::build_snapshot(&snapshot, location_id, clinic_date))
    }

    pub async fn pause(&self, location_id: Uuid) -> Result<(), FlowError> {
        self.set_paused(location_id, true).await
    }

    pub async fn resume(&self, location_id: Uuid) -> Result<(), FlowError> {
        self.set_paused(location_id, false).await
    }

    async fn set_paused(&self, location_id: Uuid, paused: bool) -> Result<(), FlowError> {
        self.pause_flags
            .set_paused(location_id, paused)
            .await
            .map_err(|e| FlowError::Collaborator(format!("pause flags: {}", e)))?;

        let action = if paused { "queue.pause" } else { "queue.resume" };
        let record = AuditRecord::new(action, "location", location_id, action, self.clock.now());
        if let Err(e) = self.audit_sink.record(&record).await {
            warn!("Audit sink rejected {}: {}", action, e);
        }
        info!("Queue for location {} {}", location_id, if paused { "paused" } else { "resumed" });
        Ok(())
    }

    // ==========================================================================
    // SWEEPS
    // ==========================================================================

    /// Flag booked/confirmed appointments whose patient has not arrived.
    pub async fn mark_late(&self) -> Result<usize, FlowError> {
        let ctx = self.context();
        let threshold = self.settings.late_threshold;
        let due = sweeper::late_candidates(&self.store.snapshot(&UnitScope::none()).await?, ctx.now, threshold);

        let mut marked = 0;
        for appointment_id in due {
            let scope = UnitScope::appointment(appointment_id);
            let result = run_atomic(&self.store, &scope, &self.settings.transaction_retry, "mark_late", |tx| {
                sweeper::flag_late(tx, &ctx, appointment_id, threshold)
            })
            .await
            .map_err(FlowError::from);

            match result {
                Ok(committed) => {
                    if self.dispatch(committed).await {
                        marked += 1;
                    }
                }
                Err(e) if e.is_invariant_violation() => return Err(e),
                Err(e) => warn!("Late sweep skipped appointment {}: {}", appointment_id, e),
            }
        }

        if marked > 0 {
            info!("Late sweep flagged {} appointments", marked);
        }
        Ok(marked)
    }

    /// Move confirmed appointments that never arrived to `no_show`.
    pub async fn mark_no_show(&self) -> Result<usize, FlowError> {
        let ctx = self.context();
        let threshold = self.settings.no_show_threshold;
        let due = sweeper::no_show_candidates(&self.store.snapshot(&UnitScope::none()).await?, ctx.now, threshold);

        let mut marked = 0;
        for appointment_id in due {
            let scope = UnitScope::appointment(appointment_id);
            let result = run_atomic(&self.store, &scope, &self.settings.transaction_retry, "mark_no_show", |tx| {
                sweeper::mark_no_show(tx, &ctx, appointment_id, threshold)
            })
            .await
            .map_err(FlowError::from);

            match result {
                Ok(committed) => {
                    if self.dispatch(committed).await {
                        marked += 1;
                    }
                }
                Err(e) if e.is_invariant_violation() => return Err(e),
                Err(e) => warn!("No-show sweep skipped appointment {}: {}", appointment_id, e),
            }
        }

        if marked > 0 {
            info!("No-show sweep marked {} appointments", marked);
        }
        Ok(marked)
    }

    // ==========================================================================
    // INTERNALS
    // ==========================================================================

    fn context(&self) -> OperationContext {
        OperationContext::new(self.clock.now(), self.settings.utc_offset)
    }

    async fn context_for(&self, location_id: Uuid) -> Result<OperationContext, FlowError> {
        let ctx = self.context();
        let paused = self
            .pause_flags
            .is_paused(location_id)
            .await
            .map_err(|e| FlowError::Collaborator(format!("pause flags: {}", e)))?;
        Ok(if paused { ctx.with_paused(location_id) } else { ctx })
    }

    async fn service_minutes(&self, service_id: Uuid) -> u32 {
        match self.catalog.estimated_duration_minutes(service_id).await {
            Ok(Some(minutes)) => minutes,
            Ok(None) => {
                debug!("Service {} not in catalog, using default duration", service_id);
                self.settings.default_service_minutes
            }
            Err(e) => {
                warn!("Service catalog lookup for {} failed: {}", service_id, e);
                self.settings.default_service_minutes
            }
        }
    }

    /// Release what a committed unit produced.
    async fn dispatch<T>(&self, committed: Committed<T>) -> T {
        let Committed { value, audit, outbox } = committed;

        for record in &audit {
            if let Err(e) = self.audit_sink.record(record).await {
                warn!("Audit sink rejected {} for {}: {}", record.action, record.entity_id, e);
            }
        }

        for message in outbox {
            match message.topic.as_str() {
                TRANSITION_TOPIC => match serde_json::from_value::<TransitionEvent>(message.payload) {
                    Ok(event) => self.events.publish(event),
                    Err(e) => warn!("Malformed transition event in outbox: {}", e),
                },
                NOTIFICATION_TOPIC => match serde_json::from_value::<Notification>(message.payload) {
                    Ok(notification) => {
                        let sender = Arc::clone(&self.notifier);
                        let policy = self.settings.notification_retry.clone();
                        tokio::spawn(async move {
                            notifier::deliver(sender.as_ref(), &policy, &notification).await;
                        });
                    }
                    Err(e) => warn!("Malformed notification in outbox: {}", e),
                },
                other => warn!("Unknown outbox topic {}", other),
            }
        }

        value
    }
}
