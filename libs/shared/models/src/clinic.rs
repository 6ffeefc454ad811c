use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// APPOINTMENTS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub location_id: Uuid,
    pub patient_name: String,
    pub patient_contact: String,
    pub scheduled_start: DateTime<Utc>,
    pub service_id: Uuid,
    pub status: AppointmentStatus,
    pub practitioner_id: Option<Uuid>,
    pub room_label: Option<String>,
    pub is_late: bool,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub treatment_started_at: Option<DateTime<Utc>>,
    pub treatment_ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Calendar date of the appointment as seen from the clinic.
    pub fn clinic_date(&self, offset: FixedOffset) -> NaiveDate {
        self.scheduled_start.with_timezone(&offset).date_naive()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Booked,
    Confirmed,
    CheckedIn,
    Waiting,
    Called,
    InTreatment,
    Completed,
    FeedbackScheduled,
    FeedbackSent,
    NoShow,
    Cancelled,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 11] = [
        AppointmentStatus::Booked,
        AppointmentStatus::Confirmed,
        AppointmentStatus::CheckedIn,
        AppointmentStatus::Waiting,
        AppointmentStatus::Called,
        AppointmentStatus::InTreatment,
        AppointmentStatus::Completed,
        AppointmentStatus::FeedbackScheduled,
        AppointmentStatus::FeedbackSent,
        AppointmentStatus::NoShow,
        AppointmentStatus::Cancelled,
    ];

    /// Destinations reachable from this status in a single transition.
    pub fn permitted_targets(&self) -> &'static [AppointmentStatus] {
        use AppointmentStatus::*;
        match self {
            Booked => &[Confirmed, CheckedIn, Cancelled],
            Confirmed => &[CheckedIn, NoShow, Cancelled],
            CheckedIn => &[Waiting, Cancelled],
            Waiting => &[Called, InTreatment, Cancelled],
            Called => &[InTreatment, Waiting, Cancelled],
            InTreatment => &[Completed, Waiting],
            Completed => &[FeedbackScheduled],
            FeedbackScheduled => &[FeedbackSent],
            FeedbackSent | NoShow | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: AppointmentStatus) -> bool {
        self.permitted_targets().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.permitted_targets().is_empty()
    }

    /// Statuses in which the patient holds a live place in the clinic-day queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, AppointmentStatus::Waiting | AppointmentStatus::Called)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::CheckedIn => "checked_in",
            AppointmentStatus::Waiting => "waiting",
            AppointmentStatus::Called => "called",
            AppointmentStatus::InTreatment => "in_treatment",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::FeedbackScheduled => "feedback_scheduled",
            AppointmentStatus::FeedbackSent => "feedback_sent",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// QUEUE LEDGER
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub location_id: Uuid,
    pub clinic_date: NaiveDate,
    pub queue_number: u32,
    pub queue_status: QueueStatus,
    pub room_id: Option<Uuid>,
    pub practitioner_id: Option<Uuid>,
    pub checked_in_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn is_in_treatment(&self) -> bool {
        self.queue_status == QueueStatus::InTreatment
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    InTreatment,
    Completed,
    Paused,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::InTreatment => "in_treatment",
            QueueStatus::Completed => "completed",
            QueueStatus::Paused => "paused",
        }
    }

    /// Queue status mirrored from the appointment status, if it has one.
    pub fn for_appointment(status: AppointmentStatus) -> Option<QueueStatus> {
        match status {
            AppointmentStatus::CheckedIn | AppointmentStatus::Waiting | AppointmentStatus::Called => {
                Some(QueueStatus::Waiting)
            }
            AppointmentStatus::InTreatment => Some(QueueStatus::InTreatment),
            AppointmentStatus::Completed
            | AppointmentStatus::FeedbackScheduled
            | AppointmentStatus::FeedbackSent => Some(QueueStatus::Completed),
            AppointmentStatus::Cancelled | AppointmentStatus::NoShow => Some(QueueStatus::Paused),
            AppointmentStatus::Booked | AppointmentStatus::Confirmed => None,
        }
    }
}

// ==============================================================================
// RESOURCES
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: Uuid,
    pub location_id: Uuid,
    pub number: u32,
    pub capacity: u32,
    pub is_active: bool,
    pub status: RoomStatus,
}

impl Room {
    pub fn label(&self) -> String {
        format!("Room {}", self.number)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Available,
    Occupied,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Practitioner {
    pub id: Uuid,
    pub name: String,
    pub location_ids: Vec<Uuid>,
    pub is_active: bool,
    pub status: PractitionerStatus,
    pub leave: Vec<LeavePeriod>,
}

impl Practitioner {
    pub fn works_at(&self, location_id: Uuid) -> bool {
        self.location_ids.contains(&location_id)
    }

    pub fn is_on_leave(&self, date: NaiveDate) -> bool {
        self.leave.iter().any(|period| period.covers(date))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PractitionerStatus {
    Available,
    Busy,
}

/// Inclusive date range during which a practitioner is away.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeavePeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reason: Option<String>,
}

impl LeavePeriod {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

// ==============================================================================
// AUDIT
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub description: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Uuid,
        description: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id,
            description: description.into(),
            before: None,
            after: None,
            recorded_at,
        }
    }

    pub fn with_change(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}
