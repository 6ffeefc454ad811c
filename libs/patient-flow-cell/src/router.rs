use std::sync::Arc;
use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{
    assign_entry, assign_next, book_appointment, check_in, estimate_wait, get_appointment,
    pause_queue, queue_snapshot, resume_queue, sweep_late, sweep_no_show, transition,
};
use crate::services::PatientFlowEngine;

pub fn patient_flow_routes(engine: Arc<PatientFlowEngine>) -> Router {
    Router::new()
        .route("/appointments", post(book_appointment))
        .route("/appointments/{appointment_id}", get(get_appointment))
        .route("/appointments/{appointment_id}/check-in", post(check_in))
        .route("/appointments/{appointment_id}/transition", post(transition))
        .route("/appointments/{appointment_id}/eta", get(estimate_wait))
        .route("/locations/{location_id}/assign-next", post(assign_next))
        .route("/locations/{location_id}/queue", get(queue_snapshot))
        .route("/locations/{location_id}/pause", post(pause_queue))
        .route("/locations/{location_id}/resume", post(resume_queue))
        .route("/queue-entries/{entry_id}/assign", post(assign_entry))
        .route("/sweeps/late", post(sweep_late))
        .route("/sweeps/no-show", post(sweep_no_show))
        .with_state(engine)
}
