use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_models::{Appointment, AppointmentStatus, QueueEntry};

// ==============================================================================
// REQUESTS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub location_id: Uuid,
    pub patient_name: String,
    pub patient_contact: String,
    pub scheduled_start: DateTime<Utc>,
    pub service_id: Uuid,
    /// `booked` unless the booking was already confirmed.
    pub status: Option<AppointmentStatus>,
    pub practitioner_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub target: AppointmentStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueQuery {
    pub date: Option<NaiveDate>,
}

// ==============================================================================
// OUTCOMES
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionOutcome {
    pub appointment: Appointment,
    pub previous_status: AppointmentStatus,
    pub final_status: AppointmentStatus,
}

/// Result of an assignment attempt. Not finding a room or practitioner is an
/// ordinary outcome, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Assignment {
    Assigned(QueueEntry),
    Unavailable(UnavailableReason),
}

impl Assignment {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Assignment::Assigned(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    QueuePaused,
    NoWaitingEntry,
    EntryNotWaiting,
    NoEligiblePractitioner,
    NoEligibleRoom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInReceipt {
    pub entry: QueueEntry,
    pub appointment: Appointment,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EtaResponse {
    pub appointment_id: Uuid,
    pub estimated_wait_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepResponse {
    pub marked: usize,
}

// ==============================================================================
// QUEUE SNAPSHOT
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub location_id: Uuid,
    pub clinic_date: NaiveDate,
    pub waiting: Vec<WaitingPosition>,
    pub in_treatment: Vec<TreatmentSlot>,
    pub counts: QueueCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitingPosition {
    /// 1-based position in the FIFO.
    pub position: usize,
    pub queue_number: u32,
    pub entry_id: Uuid,
    pub appointment_id: Uuid,
    pub patient_name: String,
    pub status: AppointmentStatus,
    pub is_late: bool,
    pub checked_in_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreatmentSlot {
    pub queue_number: u32,
    pub entry_id: Uuid,
    pub appointment_id: Uuid,
    pub patient_name: String,
    pub room_number: Option<u32>,
    pub practitioner_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub in_treatment: usize,
    pub completed: usize,
}

// ==============================================================================
// POST-COMMIT MESSAGES
// ==============================================================================

pub const TRANSITION_TOPIC: &str = "appointment.transition";
pub const NOTIFICATION_TOPIC: &str = "patient.notification";

/// Published after a transition commits. `final_status` reflects any
/// automatic follow-up transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionEvent {
    pub appointment_id: Uuid,
    pub previous_status: AppointmentStatus,
    pub final_status: AppointmentStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub appointment_id: Uuid,
    pub contact: String,
    pub message: String,
}
