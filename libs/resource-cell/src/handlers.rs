use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_database::ClinicStore;
use shared_models::{AppError, Practitioner, Room};

use crate::models::{CreateLeaveRequest, CreatePractitionerRequest, CreateRoomRequest, SetActiveRequest};
use crate::services::{PractitionerService, RoomService};

/// Register a treatment room
pub async fn create_room(
    State(store): State<ClinicStore>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<Room>), AppError> {
    info!("Create room request for location {}", request.location_id);

    let room = RoomService::new(store).register_room(request).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

/// List rooms at a clinic location
pub async fn list_rooms(
    State(store): State<ClinicStore>,
    Path(location_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let rooms = RoomService::new(store).list_rooms(location_id).await?;

    Ok(Json(json!({
        "location_id": location_id,
        "total": rooms.len(),
        "rooms": rooms,
    })))
}

pub async fn set_room_active(
    State(store): State<ClinicStore>,
    Path(room_id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> Result<Json<Room>, AppError> {
    let room = RoomService::new(store)
        .set_room_active(room_id, request.is_active)
        .await?;
    Ok(Json(room))
}

/// Register a practitioner
pub async fn create_practitioner(
    State(store): State<ClinicStore>,
    Json(request): Json<CreatePractitionerRequest>,
) -> Result<(StatusCode, Json<Practitioner>), AppError> {
    info!("Create practitioner request: {}", request.name);

    let practitioner = PractitionerService::new(store)
        .register_practitioner(request)
        .await?;
    Ok((StatusCode::CREATED, Json(practitioner)))
}

pub async fn list_practitioners(
    State(store): State<ClinicStore>,
    Path(location_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let practitioners = PractitionerService::new(store).list_practitioners(location_id).await?;

    Ok(Json(json!({
        "location_id": location_id,
        "total": practitioners.len(),
        "practitioners": practitioners,
    })))
}

pub async fn set_practitioner_active(
    State(store): State<ClinicStore>,
    Path(practitioner_id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> Result<Json<Practitioner>, AppError> {
    let practitioner = PractitionerService::new(store)
        .set_practitioner_active(practitioner_id, request.is_active)
        .await?;
    Ok(Json(practitioner))
}

/// Record a leave period for a practitioner
pub async fn add_leave(
    State(store): State<ClinicStore>,
    Path(practitioner_id): Path<Uuid>,
    Json(request): Json<CreateLeaveRequest>,
) -> Result<Json<Practitioner>, AppError> {
    let practitioner = PractitionerService::new(store)
        .add_leave(practitioner_id, request)
        .await?;
    Ok(Json(practitioner))
}
