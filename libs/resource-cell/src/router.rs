use axum::{
    routing::{get, patch, post},
    Router,
};

use shared_database::ClinicStore;

use crate::handlers::{
    add_leave, create_practitioner, create_room, list_practitioners, list_rooms,
    set_practitioner_active, set_room_active,
};

pub fn resource_routes(store: ClinicStore) -> Router {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/{room_id}/active", patch(set_room_active))
        .route("/locations/{location_id}/rooms", get(list_rooms))
        .route("/practitioners", post(create_practitioner))
        .route("/practitioners/{practitioner_id}/active", patch(set_practitioner_active))
        .route("/practitioners/{practitioner_id}/leave", post(add_leave))
        .route("/locations/{location_id}/practitioners", get(list_practitioners))
        .with_state(store)
}
