use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use patient_flow_cell::{patient_flow_routes, PatientFlowEngine};
use resource_cell::resource_routes;
use shared_database::ClinicStore;

pub fn create_router(store: ClinicStore, engine: Arc<PatientFlowEngine>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic flow API is running!" }))
        .merge(resource_routes(store))
        .merge(patient_flow_routes(engine))
}
