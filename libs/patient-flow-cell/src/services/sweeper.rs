// libs/patient-flow-cell/src/services/sweeper.rs
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use shared_database::Transaction;
use shared_models::{Appointment, AppointmentStatus, AuditRecord};

use crate::context::OperationContext;
use crate::error::FlowError;
use crate::services::lifecycle;

fn is_overdue(appointment: &Appointment, now: DateTime<Utc>, threshold: Duration) -> bool {
    now > appointment.scheduled_start + threshold
}

fn should_flag_late(appointment: &Appointment, now: DateTime<Utc>, threshold: Duration) -> bool {
    matches!(
        appointment.status,
        AppointmentStatus::Booked | AppointmentStatus::Confirmed
    ) && !appointment.is_late
        && is_overdue(appointment, now, threshold)
}

fn should_mark_no_show(appointment: &Appointment, now: DateTime<Utc>, threshold: Duration) -> bool {
    appointment.status == AppointmentStatus::Confirmed && is_overdue(appointment, now, threshold)
}

fn candidates(
    tx: &Transaction,
    now: DateTime<Utc>,
    threshold: Duration,
    select: fn(&Appointment, DateTime<Utc>, Duration) -> bool,
) -> Vec<Uuid> {
    let mut due: Vec<Appointment> = tx
        .appointments()
        .into_iter()
        .filter(|appointment| select(appointment, now, threshold))
        .collect();
    due.sort_by_key(|appointment| appointment.scheduled_start);
    due.into_iter().map(|appointment| appointment.id).collect()
}

/// Appointments not yet arrived `threshold` after their start, and not yet flagged.
pub fn late_candidates(tx: &Transaction, now: DateTime<Utc>, threshold: Duration) -> Vec<Uuid> {
    candidates(tx, now, threshold, should_flag_late)
}

pub fn no_show_candidates(tx: &Transaction, now: DateTime<Utc>, threshold: Duration) -> Vec<Uuid> {
    candidates(tx, now, threshold, should_mark_no_show)
}

/// Set the late flag if the appointment still qualifies. Returns whether
/// anything changed.
pub fn flag_late(
    tx: &mut Transaction,
    ctx: &OperationContext,
    appointment_id: Uuid,
    threshold: Duration,
) -> Result<bool, FlowError> {
    let mut appointment = lifecycle::lock_appointment(tx, appointment_id)?;
    if !should_flag_late(&appointment, ctx.now, threshold) {
        debug!("Appointment {} no longer needs a late flag", appointment_id);
        return Ok(false);
    }

    appointment.is_late = true;
    appointment.updated_at = ctx.now;
    tx.put_appointment(appointment);
    tx.record_audit(
        AuditRecord::new(
            "appointment.late",
            "appointment",
            appointment_id,
            "patient has not arrived",
            ctx.now,
        )
        .with_change(Some(json!({ "is_late": false })), Some(json!({ "is_late": true }))),
    );
    Ok(true)
}

/// Move a confirmed appointment to no_show if it still qualifies.
pub fn mark_no_show(
    tx: &mut Transaction,
    ctx: &OperationContext,
    appointment_id: Uuid,
    threshold: Duration,
) -> Result<bool, FlowError> {
    let appointment = lifecycle::lock_appointment(tx, appointment_id)?;
    if !should_mark_no_show(&appointment, ctx.now, threshold) {
        return Ok(false);
    }
    lifecycle::apply_transition(
        tx,
        ctx,
        appointment_id,
        AppointmentStatus::NoShow,
        "no-show sweep",
    )?;
    Ok(true)
}
