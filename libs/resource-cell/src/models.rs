use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use shared_database::{RetryError, StoreError, Transient};
use shared_models::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub location_id: Uuid,
    pub number: u32,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePractitionerRequest {
    pub name: String,
    pub location_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLeaveRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Room not found: {0}")]
    RoomNotFound(Uuid),

    #[error("Practitioner not found: {0}")]
    PractitionerNotFound(Uuid),

    #[error("Room {number} already exists at location {location_id}")]
    DuplicateRoom { location_id: Uuid, number: u32 },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry update kept conflicting after {0} attempts")]
    ContentionExhausted(u32),
}

impl Transient for ResourceError {
    fn is_transient(&self) -> bool {
        matches!(self, ResourceError::Store(e) if e.is_contention())
    }
}

impl From<RetryError<ResourceError>> for ResourceError {
    fn from(err: RetryError<ResourceError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, .. } => ResourceError::ContentionExhausted(attempts),
            RetryError::Aborted(e) => e,
        }
    }
}

impl From<ResourceError> for AppError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::RoomNotFound(_) | ResourceError::PractitionerNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            ResourceError::DuplicateRoom { .. } => AppError::Conflict(err.to_string()),
            ResourceError::ValidationError(msg) => AppError::ValidationError(msg),
            ResourceError::ContentionExhausted(_) => AppError::Conflict(err.to_string()),
            ResourceError::Store(e) => AppError::Internal(e.to_string()),
        }
    }
}
