use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::{AppError, Appointment};

use crate::models::{
    Assignment, BookAppointmentRequest, CheckInReceipt, EtaResponse, QueueQuery, QueueSnapshot,
    SweepResponse, TransitionOutcome, TransitionRequest,
};
use crate::services::PatientFlowEngine;

/// Add an existing booking to the day's flow
pub async fn book_appointment(
    State(engine): State<Arc<PatientFlowEngine>>,
    Json(request): Json<BookAppointmentRequest>,
) -> Result<(StatusCode, Json<Appointment>), AppError> {
    info!("Book appointment request for location {}", request.location_id);

    let appointment = engine.book_appointment(request).await?;
    Ok((StatusCode::CREATED, Json(appointment)))
}

pub async fn get_appointment(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Appointment>, AppError> {
    Ok(Json(engine.get_appointment(appointment_id).await?))
}

/// Patient arrival at the front desk
pub async fn check_in(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<CheckInReceipt>, AppError> {
    let receipt = engine.check_in(appointment_id).await?;
    Ok(Json(receipt))
}

pub async fn transition(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(appointment_id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<TransitionOutcome>, AppError> {
    let reason = request.reason.unwrap_or_else(|| "staff update".to_string());
    let outcome = engine
        .transition(appointment_id, request.target, &reason)
        .await?;
    Ok(Json(outcome))
}

pub async fn estimate_wait(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<EtaResponse>, AppError> {
    let estimated_wait_minutes = engine.estimate_wait(appointment_id).await?;
    Ok(Json(EtaResponse {
        appointment_id,
        estimated_wait_minutes,
    }))
}

/// Assign the head of a clinic's queue
pub async fn assign_next(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(location_id): Path<Uuid>,
) -> Result<Json<Assignment>, AppError> {
    Ok(Json(engine.assign_next(location_id).await?))
}

/// Staff call a specific patient
pub async fn assign_entry(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<Assignment>, AppError> {
    Ok(Json(engine.assign(entry_id).await?))
}

pub async fn queue_snapshot(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(location_id): Path<Uuid>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<QueueSnapshot>, AppError> {
    Ok(Json(engine.queue_snapshot(location_id, query.date).await?))
}

pub async fn pause_queue(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(location_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    engine.pause(location_id).await?;
    Ok(Json(json!({ "location_id": location_id, "paused": true })))
}

pub async fn resume_queue(
    State(engine): State<Arc<PatientFlowEngine>>,
    Path(location_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    engine.resume(location_id).await?;
    Ok(Json(json!({ "location_id": location_id, "paused": false })))
}

pub async fn sweep_late(
    State(engine): State<Arc<PatientFlowEngine>>,
) -> Result<Json<SweepResponse>, AppError> {
    let marked = engine.mark_late().await?;
    Ok(Json(SweepResponse { marked }))
}

pub async fn sweep_no_show(
    State(engine): State<Arc<PatientFlowEngine>>,
) -> Result<Json<SweepResponse>, AppError> {
    let marked = engine.mark_no_show().await?;
    Ok(Json(SweepResponse { marked }))
}
