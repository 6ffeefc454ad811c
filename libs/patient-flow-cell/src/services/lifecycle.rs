//! Appointment state machine.
//!
//! A transition validates the requested edge against the status table, writes
//! the new status with an audit record and then runs the automation attached
//! to the destination status. Automation may request one follow-up
//! transition (checked_in -> waiting, completed -> feedback_scheduled); the
//! chain runs inside the caller's atomic unit and is capped at
//! [`MAX_CHAIN_STEPS`]. Everything here is synchronous: side effects that
//! leave the process are queued on the unit's outbox.

use serde_json::json;
use tracing::{debug, error, info};
use uuid::Uuid;

use resource_cell::practitioner::{mark_busy, release_practitioner};
use resource_cell::room::{occupy_room, release_room};
use shared_database::{StoreError, Transaction};
use shared_models::{Appointment, AppointmentStatus, AuditRecord, QueueEntry, QueueStatus};

use crate::context::OperationContext;
use crate::error::{FlowError, TransitionRejection};
use crate::models::{
    Assignment, Notification, TransitionEvent, TransitionOutcome, NOTIFICATION_TOPIC, TRANSITION_TOPIC,
};
use crate::services::assignment;

pub const MAX_CHAIN_STEPS: usize = 8;

type FollowUp = Option<(AppointmentStatus, String)>;

pub fn validate_transition(
    from: AppointmentStatus,
    to: AppointmentStatus,
) -> Result<(), TransitionRejection> {
    if from.is_terminal() {
        return Err(TransitionRejection::Terminal(from));
    }
    if !from.can_transition_to(to) {
        return Err(TransitionRejection::NotPermitted { from, to });
    }
    Ok(())
}

/// Transition an appointment inside the caller's unit, following any
/// automatic follow-up transitions. A rejection at any step leaves the unit
/// to be discarded by the caller.
pub fn apply_transition(
    tx: &mut Transaction,
    ctx: &OperationContext,
    appointment_id: Uuid,
    target: AppointmentStatus,
    reason: &str,
) -> Result<TransitionOutcome, FlowError> {
    let previous_status = lock_appointment(tx, appointment_id)?.status;
    let mut pending: FollowUp = Some((target, reason.to_string()));
    let mut steps = 0;

    while let Some((to, why)) = pending.take() {
        if steps == MAX_CHAIN_STEPS {
            error!(appointment_id = %appointment_id, "Automation chain exceeded {} steps", MAX_CHAIN_STEPS);
            return Err(FlowError::InvariantViolation(format!(
                "automation chain for appointment {} exceeded {} steps",
                appointment_id, MAX_CHAIN_STEPS
            )));
        }
        steps += 1;

        let current = lock_appointment(tx, appointment_id)?;
        validate_transition(current.status, to)?;
        if to == AppointmentStatus::InTreatment {
            require_assigned_resources(tx, &current)?;
        }

        let mut updated = current.clone();
        updated.status = to;
        updated.updated_at = ctx.now;
        tx.put_appointment(updated.clone());
        tx.record_audit(
            AuditRecord::new(
                "appointment.transition",
                "appointment",
                appointment_id,
                format!("{} -> {}: {}", current.status, to, why),
                ctx.now,
            )
            .with_change(
                Some(json!({ "status": current.status })),
                Some(json!({ "status": to })),
            ),
        );
        debug!(appointment_id = %appointment_id, "{} -> {} ({})", current.status, to, why);

        pending = run_automation(tx, ctx, current.status, updated)?;
    }

    let appointment = tx
        .appointment(appointment_id)
        .ok_or(FlowError::AppointmentNotFound(appointment_id))?;
    let final_status = appointment.status;

    tx.enqueue(
        TRANSITION_TOPIC,
        json!(TransitionEvent {
            appointment_id,
            previous_status,
            final_status,
            reason: reason.to_string(),
            timestamp: ctx.now,
        }),
    );

    info!(
        appointment_id = %appointment_id,
        "Appointment moved {} -> {} (requested {})",
        previous_status, final_status, target
    );

    Ok(TransitionOutcome {
        appointment,
        previous_status,
        final_status,
    })
}

pub(crate) fn lock_appointment(tx: &mut Transaction, appointment_id: Uuid) -> Result<Appointment, FlowError> {
    tx.lock_appointment(appointment_id).map_err(|e| match e {
        StoreError::NotFound(_) => FlowError::AppointmentNotFound(appointment_id),
        other => FlowError::Store(other),
    })
}

fn require_assigned_resources(tx: &Transaction, appointment: &Appointment) -> Result<(), TransitionRejection> {
    match tx.queue_entry_for_appointment(appointment.id) {
        Some(entry) if entry.room_id.is_some() && entry.practitioner_id.is_some() => Ok(()),
        _ => Err(TransitionRejection::ResourcesNotAssigned),
    }
}

fn run_automation(
    tx: &mut Transaction,
    ctx: &OperationContext,
    from: AppointmentStatus,
    appointment: Appointment,
) -> Result<FollowUp, FlowError> {
    match appointment.status {
        AppointmentStatus::CheckedIn => {
            ensure_queue_entry(tx, ctx, appointment)?;
            Ok(Some((AppointmentStatus::Waiting, "queued after check-in".to_string())))
        }
        AppointmentStatus::Waiting if from == AppointmentStatus::InTreatment => {
            let location_id = appointment.location_id;
            return_to_queue(tx, appointment)?;
            try_auto_assign(tx, ctx, location_id)?;
            Ok(None)
        }
        AppointmentStatus::Waiting => {
            sync_queue_status(tx, &appointment)?;
            try_auto_assign(tx, ctx, appointment.location_id)?;
            Ok(None)
        }
        AppointmentStatus::InTreatment => {
            start_treatment(tx, ctx, appointment)?;
            Ok(None)
        }
        AppointmentStatus::Completed => {
            finish_treatment(tx, ctx, appointment)?;
            Ok(Some((
                AppointmentStatus::FeedbackScheduled,
                "feedback scheduled after treatment".to_string(),
            )))
        }
        _ => {
            sync_queue_status(tx, &appointment)?;
            Ok(None)
        }
    }
}

/// Create the appointment's queue entry unless it already has one.
fn ensure_queue_entry(
    tx: &mut Transaction,
    ctx: &OperationContext,
    mut appointment: Appointment,
) -> Result<QueueEntry, FlowError> {
    if let Some(existing) = tx.queue_entry_for_appointment(appointment.id) {
        return Ok(existing);
    }

    let clinic_date = appointment.clinic_date(ctx.utc_offset);
    let queue_number = tx.next_queue_number(appointment.location_id, clinic_date);
    let entry = QueueEntry {
        id: Uuid::new_v4(),
        appointment_id: appointment.id,
        location_id: appointment.location_id,
        clinic_date,
        queue_number,
        queue_status: QueueStatus::Waiting,
        room_id: None,
        practitioner_id: None,
        checked_in_at: ctx.now,
        started_at: None,
        completed_at: None,
    };
    tx.put_queue_entry(entry.clone());

    appointment.checked_in_at = Some(ctx.now);
    tx.put_appointment(appointment);

    debug!(queue_number, "Queue entry {} created", entry.id);
    Ok(entry)
}

fn sync_queue_status(tx: &mut Transaction, appointment: &Appointment) -> Result<(), FlowError> {
    let Some(status) = QueueStatus::for_appointment(appointment.status) else {
        return Ok(());
    };
    let Some(entry) = tx.queue_entry_for_appointment(appointment.id) else {
        return Ok(());
    };
    if entry.queue_status != status {
        let mut entry = tx.lock_queue_entry(entry.id)?;
        entry.queue_status = status;
        tx.put_queue_entry(entry);
    }
    Ok(())
}

fn try_auto_assign(tx: &mut Transaction, ctx: &OperationContext, location_id: Uuid) -> Result<(), FlowError> {
    if ctx.is_paused(location_id) {
        debug!("Queue {} paused, skipping auto-assignment", location_id);
        return Ok(());
    }

    let savepoint = tx.savepoint();
    match assignment::assign_next(tx, ctx, location_id, "auto-assigned from queue") {
        Ok(Assignment::Assigned(entry)) => {
            debug!(queue_number = entry.queue_number, "Auto-assigned queue entry {}", entry.id);
        }
        Ok(Assignment::Unavailable(reason)) => {
            tx.rollback_to(savepoint);
            debug!("Auto-assignment skipped: {:?}", reason);
        }
        Err(e) if e.is_invariant_violation() => return Err(e),
        Err(e) => {
            tx.rollback_to(savepoint);
            debug!("Auto-assignment failed, patient stays waiting: {}", e);
        }
    }
    Ok(())
}

fn start_treatment(
    tx: &mut Transaction,
    ctx: &OperationContext,
    mut appointment: Appointment,
) -> Result<(), FlowError> {
    let mut entry = lock_entry_of(tx, &appointment)?;
    let (Some(room_id), Some(practitioner_id)) = (entry.room_id, entry.practitioner_id) else {
        return Err(TransitionRejection::ResourcesNotAssigned.into());
    };

    let room = occupy_room(tx, room_id)?;
    let practitioner = mark_busy(tx, practitioner_id)?;

    entry.queue_status = QueueStatus::InTreatment;
    entry.started_at = Some(ctx.now);
    tx.put_queue_entry(entry);

    appointment.practitioner_id = Some(practitioner.id);
    appointment.room_label = Some(room.label());
    appointment.treatment_started_at = Some(ctx.now);
    appointment.treatment_ended_at = None;

    tx.enqueue(
        NOTIFICATION_TOPIC,
        json!(Notification {
            appointment_id: appointment.id,
            contact: appointment.patient_contact.clone(),
            message: format!(
                "{}, please proceed to {} where {} is ready to see you.",
                appointment.patient_name,
                room.label(),
                practitioner.name
            ),
        }),
    );
    tx.put_appointment(appointment);
    Ok(())
}

fn finish_treatment(
    tx: &mut Transaction,
    ctx: &OperationContext,
    mut appointment: Appointment,
) -> Result<(), FlowError> {
    let mut entry = lock_entry_of(tx, &appointment)?;
    release_resources(tx, &mut entry)?;
    entry.queue_status = QueueStatus::Completed;
    entry.completed_at = Some(ctx.now);
    tx.put_queue_entry(entry);

    appointment.treatment_ended_at = Some(ctx.now);
    tx.put_appointment(appointment);
    Ok(())
}

/// Recovery path: the patient leaves the room and rejoins the FIFO at their
/// original queue number. The practitioner stays on the appointment as the
/// preferred one for the next assignment, which runs straight after unless
/// the queue is paused.
fn return_to_queue(tx: &mut Transaction, mut appointment: Appointment) -> Result<(), FlowError> {
    let mut entry = lock_entry_of(tx, &appointment)?;
    release_resources(tx, &mut entry)?;
    entry.queue_status = QueueStatus::Waiting;
    entry.started_at = None;
    tx.put_queue_entry(entry);

    appointment.room_label = None;
    appointment.treatment_started_at = None;
    tx.put_appointment(appointment);
    Ok(())
}

fn release_resources(tx: &mut Transaction, entry: &mut QueueEntry) -> Result<(), FlowError> {
    if let Some(room_id) = entry.room_id.take() {
        release_room(tx, room_id)?;
    }
    if let Some(practitioner_id) = entry.practitioner_id.take() {
        release_practitioner(tx, practitioner_id)?;
    }
    Ok(())
}

fn lock_entry_of(tx: &mut Transaction, appointment: &Appointment) -> Result<QueueEntry, FlowError> {
    let entry = tx.queue_entry_for_appointment(appointment.id).ok_or_else(|| {
        error!(appointment_id = %appointment.id, "Appointment is {} without a queue entry", appointment.status);
        FlowError::InvariantViolation(format!(
            "appointment {} is {} without a queue entry",
            appointment.id, appointment.status
        ))
    })?;
    Ok(tx.lock_queue_entry(entry.id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use AppointmentStatus::*;

    #[test]
    fn terminal_statuses_reject_everything() {
        for from in [Cancelled, NoShow, FeedbackSent] {
            for to in AppointmentStatus::ALL {
                assert_eq!(validate_transition(from, to), Err(TransitionRejection::Terminal(from)));
            }
        }
    }

    #[test]
    fn missing_edges_are_rejected() {
        assert_eq!(
            validate_transition(Booked, InTreatment),
            Err(TransitionRejection::NotPermitted {
                from: Booked,
                to: InTreatment
            })
        );
        assert!(validate_transition(Called, Waiting).is_ok());
        assert!(validate_transition(InTreatment, Waiting).is_ok());
        assert!(validate_transition(Completed, Waiting).is_err());
    }
}
