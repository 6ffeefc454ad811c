use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use shared_database::{RetryError, StoreError, Transient};
use shared_models::{AppError, AppointmentStatus};

/// Why the state machine refused a transition. Nothing was mutated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionRejection {
    #[error("appointment is {0} and accepts no further transitions")]
    Terminal(AppointmentStatus),

    #[error("transition from {from} to {to} is not permitted")]
    NotPermitted {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("in_treatment requires a room and practitioner assigned by the queue")]
    ResourcesNotAssigned,
}

/// User-facing reasons a check-in was refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckInRejection {
    #[error("the clinic queue is paused")]
    QueuePaused,

    #[error("appointment is {0}")]
    Closed(AppointmentStatus),

    #[error("appointment was already checked in and is now {0}")]
    AlreadyCheckedIn(AppointmentStatus),

    #[error("appointment is on {scheduled}, not today ({today})")]
    NotToday { scheduled: NaiveDate, today: NaiveDate },

    #[error("check-in opens at {opens_at}")]
    TooEarly { opens_at: DateTime<Utc> },
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Appointment not found: {0}")]
    AppointmentNotFound(Uuid),

    #[error("Queue entry not found: {0}")]
    QueueEntryNotFound(Uuid),

    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionRejection),

    #[error("Check-in rejected: {0}")]
    CheckIn(#[from] CheckInRejection),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation kept conflicting after {0} attempts")]
    ContentionExhausted(u32),

    #[error("Collaborator unavailable: {0}")]
    Collaborator(String),
}

impl FlowError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, FlowError::InvariantViolation(_))
    }
}

impl Transient for FlowError {
    fn is_transient(&self) -> bool {
        matches!(self, FlowError::Store(e) if e.is_contention())
    }
}

impl From<RetryError<FlowError>> for FlowError {
    fn from(err: RetryError<FlowError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, .. } => FlowError::ContentionExhausted(attempts),
            RetryError::Aborted(e) => e,
        }
    }
}

impl From<FlowError> for AppError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::AppointmentNotFound(_) | FlowError::QueueEntryNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            FlowError::CheckIn(CheckInRejection::QueuePaused) => AppError::Unavailable(err.to_string()),
            FlowError::CheckIn(CheckInRejection::NotToday { .. })
            | FlowError::CheckIn(CheckInRejection::TooEarly { .. }) => AppError::BadRequest(err.to_string()),
            FlowError::CheckIn(_) | FlowError::Transition(_) | FlowError::ContentionExhausted(_) => {
                AppError::Conflict(err.to_string())
            }
            FlowError::ValidationError(msg) => AppError::ValidationError(msg),
            FlowError::Collaborator(msg) => AppError::ExternalService(msg),
            FlowError::InvariantViolation(_) | FlowError::Store(_) => AppError::Internal(err.to_string()),
        }
    }
}
