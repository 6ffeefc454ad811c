use chrono::NaiveDate;
use uuid::Uuid;

use shared_database::Transaction;
use shared_models::QueueStatus;

use crate::models::{QueueCounts, QueueSnapshot, TreatmentSlot, WaitingPosition};

/// Read-only view of one clinic-day for display surfaces.
pub fn build_snapshot(tx: &Transaction, location_id: Uuid, clinic_date: NaiveDate) -> QueueSnapshot {
    let entries = tx.queue_entries_for_day(location_id, clinic_date);
    let mut waiting = Vec::new();
    let mut in_treatment = Vec::new();
    let mut counts = QueueCounts::default();

    for entry in entries {
        let Some(appointment) = tx.appointment(entry.appointment_id) else {
            continue;
        };
        match entry.queue_status {
            QueueStatus::Waiting => {
                counts.waiting += 1;
                waiting.push(WaitingPosition {
                    position: counts.waiting,
                    queue_number: entry.queue_number,
                    entry_id: entry.id,
                    appointment_id: appointment.id,
                    patient_name: appointment.patient_name,
                    status: appointment.status,
                    is_late: appointment.is_late,
                    checked_in_at: entry.checked_in_at,
                });
            }
            QueueStatus::InTreatment => {
                counts.in_treatment += 1;
                in_treatment.push(TreatmentSlot {
                    queue_number: entry.queue_number,
                    entry_id: entry.id,
                    appointment_id: appointment.id,
                    patient_name: appointment.patient_name,
                    room_number: entry.room_id.and_then(|id| tx.room(id)).map(|room| room.number),
                    practitioner_name: entry
                        .practitioner_id
                        .and_then(|id| tx.practitioner(id))
                        .map(|practitioner| practitioner.name),
                    started_at: entry.started_at,
                });
            }
            QueueStatus::Completed => counts.completed += 1,
            QueueStatus::Paused => {}
        }
    }

    QueueSnapshot {
        location_id,
        clinic_date,
        waiting,
        in_treatment,
        counts,
    }
}
