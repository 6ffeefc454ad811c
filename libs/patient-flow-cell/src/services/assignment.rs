// libs/patient-flow-cell/src/services/assignment.rs
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use resource_cell::practitioner::{eligible_practitioners, select_practitioner};
use resource_cell::room::eligible_rooms;
use shared_database::Transaction;
use shared_models::{Appointment, AppointmentStatus, AuditRecord, QueueEntry, QueueStatus};

use crate::context::OperationContext;
use crate::error::FlowError;
use crate::models::{Assignment, UnavailableReason};
use crate::services::lifecycle;

/// Assign the lowest-numbered waiting entry of today's queue. If that entry
/// cannot be matched the call reports unavailability; later entries are never
/// tried in its place.
pub fn assign_next(
    tx: &mut Transaction,
    ctx: &OperationContext,
    location_id: Uuid,
    reason: &str,
) -> Result<Assignment, FlowError> {
    if ctx.is_paused(location_id) {
        return Ok(Assignment::Unavailable(UnavailableReason::QueuePaused));
    }

    let head = tx
        .queue_entries_for_day(location_id, ctx.today())
        .into_iter()
        .find(|entry| is_waiting(tx, entry));

    match head {
        Some(entry) => assign_entry(tx, ctx, entry.id, reason),
        None => Ok(Assignment::Unavailable(UnavailableReason::NoWaitingEntry)),
    }
}

/// Assign a specific queue entry, bypassing FIFO selection. Eligibility and
/// atomicity are the same as for [`assign_next`].
pub fn assign_entry(
    tx: &mut Transaction,
    ctx: &OperationContext,
    entry_id: Uuid,
    reason: &str,
) -> Result<Assignment, FlowError> {
    let entry = tx
        .queue_entry(entry_id)
        .ok_or(FlowError::QueueEntryNotFound(entry_id))?;
    let location_id = entry.location_id;

    if ctx.is_paused(location_id) {
        return Ok(Assignment::Unavailable(UnavailableReason::QueuePaused));
    }
    if !is_waiting(tx, &entry) {
        return Ok(Assignment::Unavailable(UnavailableReason::EntryNotWaiting));
    }
    let appointment = tx
        .appointment(entry.appointment_id)
        .ok_or(FlowError::AppointmentNotFound(entry.appointment_id))?;

    let eligible = eligible_practitioners(tx, location_id, entry.clinic_date);
    let Some(practitioner) = select_practitioner(&eligible, appointment.practitioner_id) else {
        return Ok(Assignment::Unavailable(UnavailableReason::NoEligiblePractitioner));
    };
    let Some(room) = eligible_rooms(tx, location_id).into_iter().next() else {
        return Ok(Assignment::Unavailable(UnavailableReason::NoEligibleRoom));
    };

    // Lock order: queue entry, room, practitioner.
    let mut entry = tx.lock_queue_entry(entry_id)?;
    let room = tx.lock_room(room.id)?;
    let practitioner = tx.lock_practitioner(practitioner.id)?;

    if !is_waiting(tx, &entry) || entry.room_id.is_some() {
        debug!("Queue entry {} was taken by a concurrent assignment", entry_id);
        return Ok(Assignment::Unavailable(UnavailableReason::EntryNotWaiting));
    }
    if !eligible_rooms(tx, location_id).iter().any(|r| r.id == room.id) {
        return Ok(Assignment::Unavailable(UnavailableReason::NoEligibleRoom));
    }
    if !eligible_practitioners(tx, location_id, entry.clinic_date)
        .iter()
        .any(|p| p.id == practitioner.id)
    {
        return Ok(Assignment::Unavailable(UnavailableReason::NoEligiblePractitioner));
    }

    entry.room_id = Some(room.id);
    entry.practitioner_id = Some(practitioner.id);
    tx.put_queue_entry(entry.clone());
    tx.record_audit(
        AuditRecord::new(
            "queue.assign",
            "queue_entry",
            entry.id,
            format!(
                "queue #{} assigned to {} with {}",
                entry.queue_number,
                room.label(),
                practitioner.name
            ),
            ctx.now,
        )
        .with_change(
            None,
            Some(json!({ "room_id": room.id, "practitioner_id": practitioner.id })),
        ),
    );

    lifecycle::apply_transition(tx, ctx, appointment.id, AppointmentStatus::InTreatment, reason)
        .map_err(|e| {
            warn!(
                appointment_id = %appointment.id,
                "Assignment of queue entry {} aborted: {}", entry_id, e
            );
            e
        })?;

    let assigned = verify_assignment(tx, entry_id)?;
    info!(
        appointment_id = %appointment.id,
        queue_number = assigned.queue_number,
        "Assigned {} and practitioner {}",
        room.label(),
        practitioner.id
    );
    Ok(Assignment::Assigned(assigned))
}

/// Re-read an entry after assignment and fail loudly on any inconsistency.
pub fn verify_assignment(tx: &Transaction, entry_id: Uuid) -> Result<QueueEntry, FlowError> {
    let entry = tx
        .queue_entry(entry_id)
        .ok_or(FlowError::QueueEntryNotFound(entry_id))?;
    let appointment = tx
        .appointment(entry.appointment_id)
        .ok_or(FlowError::AppointmentNotFound(entry.appointment_id))?;
    check_consistency(tx, &entry, &appointment)?;
    Ok(entry)
}

pub fn check_consistency(tx: &Transaction, entry: &QueueEntry, appointment: &Appointment) -> Result<(), FlowError> {
    if entry.is_in_treatment() && (entry.room_id.is_none() || entry.practitioner_id.is_none()) {
        return Err(violation(format!(
            "queue entry {} is in treatment without room or practitioner",
            entry.id
        )));
    }
    if appointment.status == AppointmentStatus::InTreatment && appointment.practitioner_id.is_none() {
        return Err(violation(format!(
            "appointment {} is in treatment without a practitioner",
            appointment.id
        )));
    }
    if QueueStatus::for_appointment(appointment.status) != Some(entry.queue_status) {
        return Err(violation(format!(
            "appointment {} is {} but its queue entry is {:?}",
            appointment.id, appointment.status, entry.queue_status
        )));
    }

    if entry.is_in_treatment() {
        let others: Vec<QueueEntry> = tx
            .entries_in_treatment()
            .into_iter()
            .filter(|other| other.id != entry.id)
            .collect();
        if others.iter().any(|other| other.room_id == entry.room_id) {
            return Err(violation(format!("room of queue entry {} is double-booked", entry.id)));
        }
        if others.iter().any(|other| other.practitioner_id == entry.practitioner_id) {
            return Err(violation(format!(
                "practitioner of queue entry {} is treating two patients",
                entry.id
            )));
        }
    }
    Ok(())
}

fn is_waiting(tx: &Transaction, entry: &QueueEntry) -> bool {
    entry.queue_status == QueueStatus::Waiting
        && tx
            .appointment(entry.appointment_id)
            .is_some_and(|appointment| appointment.status.is_queued())
}

fn violation(message: String) -> FlowError {
    error!("Invariant violation: {}", message);
    FlowError::InvariantViolation(message)
}
