use chrono::Duration;
use tracing::info;
use uuid::Uuid;

use shared_database::Transaction;
use shared_models::AppointmentStatus;

use crate::context::OperationContext;
use crate::error::{CheckInRejection, FlowError};
use crate::models::CheckInReceipt;
use crate::services::lifecycle;

/// Check a patient in. The appointment row is locked first, so concurrent
/// attempts for the same appointment serialize: the first creates the queue
/// entry, later ones get that entry back unchanged.
pub fn check_in(
    tx: &mut Transaction,
    ctx: &OperationContext,
    early_allowance: Duration,
    appointment_id: Uuid,
) -> Result<CheckInReceipt, FlowError> {
    let appointment = lifecycle::lock_appointment(tx, appointment_id)?;
    let status = appointment.status;

    if ctx.is_paused(appointment.location_id) {
        return Err(CheckInRejection::QueuePaused.into());
    }
    if matches!(status, AppointmentStatus::Cancelled | AppointmentStatus::NoShow) {
        return Err(CheckInRejection::Closed(status).into());
    }

    if let Some(entry) = tx.queue_entry_for_appointment(appointment_id) {
        if !is_live_visit(status) {
            return Err(CheckInRejection::AlreadyCheckedIn(status).into());
        }
        info!(
            appointment_id = %appointment_id,
            queue_number = entry.queue_number,
            "Duplicate check-in, returning existing queue entry"
        );
        return Ok(CheckInReceipt {
            entry,
            appointment,
            duplicate: true,
        });
    }
    if !matches!(status, AppointmentStatus::Booked | AppointmentStatus::Confirmed) {
        return Err(CheckInRejection::AlreadyCheckedIn(status).into());
    }

    let scheduled = appointment.clinic_date(ctx.utc_offset);
    let today = ctx.today();
    if scheduled != today {
        return Err(CheckInRejection::NotToday { scheduled, today }.into());
    }
    let opens_at = appointment.scheduled_start - early_allowance;
    if ctx.now < opens_at {
        return Err(CheckInRejection::TooEarly { opens_at }.into());
    }

    let outcome = lifecycle::apply_transition(
        tx,
        ctx,
        appointment_id,
        AppointmentStatus::CheckedIn,
        "patient checked in",
    )?;
    let entry = tx.queue_entry_for_appointment(appointment_id).ok_or_else(|| {
        FlowError::InvariantViolation(format!(
            "check-in of appointment {} produced no queue entry",
            appointment_id
        ))
    })?;

    Ok(CheckInReceipt {
        entry,
        appointment: outcome.appointment,
        duplicate: false,
    })
}

/// Statuses in which an earlier check-in is still the patient's current visit.
fn is_live_visit(status: AppointmentStatus) -> bool {
    matches!(
        status,
        AppointmentStatus::CheckedIn
            | AppointmentStatus::Waiting
            | AppointmentStatus::Called
            | AppointmentStatus::InTreatment
    )
}
