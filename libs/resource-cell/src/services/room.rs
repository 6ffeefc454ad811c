// libs/resource-cell/src/services/room.rs
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use shared_database::{run_atomic, ClinicStore, RetryPolicy, StoreError, Transaction, UnitScope};
use shared_models::{AuditRecord, Room, RoomStatus};

use crate::models::{CreateRoomRequest, ResourceError};

pub struct RoomService {
    store: ClinicStore,
    retry: RetryPolicy,
}

impl RoomService {
    pub fn new(store: ClinicStore) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a treatment room. Room numbers are unique per location.
    pub async fn register_room(&self, request: CreateRoomRequest) -> Result<Room, ResourceError> {
        debug!("Registering room {} at location {}", request.number, request.location_id);

        let capacity = request.capacity.unwrap_or(1);
        if capacity == 0 {
            return Err(ResourceError::ValidationError(
                "Room capacity must be at least 1".to_string(),
            ));
        }

        let committed = run_atomic(&self.store, &UnitScope::none(), &self.retry, "register_room", |tx| {
            let duplicate = tx
                .rooms()
                .iter()
                .any(|room| room.location_id == request.location_id && room.number == request.number);
            if duplicate {
                return Err(ResourceError::DuplicateRoom {
                    location_id: request.location_id,
                    number: request.number,
                });
            }

            let room = Room {
                id: Uuid::new_v4(),
                location_id: request.location_id,
                number: request.number,
                capacity,
                is_active: true,
                status: RoomStatus::Available,
            };
            tx.put_room(room.clone());
            tx.record_audit(
                AuditRecord::new("room.register", "room", room.id, room.label(), Utc::now())
                    .with_change(None, Some(json!(room))),
            );
            Ok::<_, ResourceError>(room)
        })
        .await?;

        info!("Room {} registered with ID {}", committed.value.number, committed.value.id);
        Ok(committed.value)
    }

    pub async fn set_room_active(&self, room_id: Uuid, is_active: bool) -> Result<Room, ResourceError> {
        let committed = run_atomic(&self.store, &UnitScope::none(), &self.retry, "set_room_active", |tx| {
            let before = tx
                .lock_room(room_id)
                .map_err(|_| ResourceError::RoomNotFound(room_id))?;
            let mut room = before.clone();
            room.is_active = is_active;
            tx.put_room(room.clone());
            tx.record_audit(
                AuditRecord::new(
                    if is_active { "room.activate" } else { "room.deactivate" },
                    "room",
                    room_id,
                    room.label(),
                    Utc::now(),
                )
                .with_change(
                    Some(json!({ "is_active": before.is_active })),
                    Some(json!({ "is_active": is_active })),
                ),
            );
            Ok::<_, ResourceError>(room)
        })
        .await?;

        info!("Room {} is_active set to {}", room_id, is_active);
        Ok(committed.value)
    }

    pub async fn list_rooms(&self, location_id: Uuid) -> Result<Vec<Room>, ResourceError> {
        let snapshot = self.store.snapshot(&UnitScope::none()).await?;
        let mut rooms: Vec<Room> = snapshot
            .rooms()
            .into_iter()
            .filter(|room| room.location_id == location_id)
            .collect();
        rooms.sort_by_key(|room| room.number);
        Ok(rooms)
    }
}

/// Rooms a patient can be placed in right now, ordered by room number.
///
/// A room is held only by a live in-treatment queue entry; an `Occupied`
/// flag left behind by a finished treatment does not block it.
pub fn eligible_rooms(tx: &Transaction, location_id: Uuid) -> Vec<Room> {
    let held = rooms_in_treatment(tx);
    let mut rooms: Vec<Room> = tx
        .rooms()
        .into_iter()
        .filter(|room| room.location_id == location_id && room.is_active && !held.contains(&room.id))
        .collect();
    rooms.sort_by_key(|room| room.number);
    rooms
}

pub fn rooms_in_treatment(tx: &Transaction) -> HashSet<Uuid> {
    tx.entries_in_treatment()
        .iter()
        .filter_map(|entry| entry.room_id)
        .collect()
}

pub fn active_room_count(tx: &Transaction, location_id: Uuid) -> usize {
    tx.rooms()
        .iter()
        .filter(|room| room.location_id == location_id && room.is_active)
        .count()
}

pub fn occupy_room(tx: &mut Transaction, room_id: Uuid) -> Result<Room, StoreError> {
    set_room_status(tx, room_id, RoomStatus::Occupied)
}

pub fn release_room(tx: &mut Transaction, room_id: Uuid) -> Result<Room, StoreError> {
    set_room_status(tx, room_id, RoomStatus::Available)
}

fn set_room_status(tx: &mut Transaction, room_id: Uuid, status: RoomStatus) -> Result<Room, StoreError> {
    let mut room = tx.lock_room(room_id)?;
    room.status = status;
    tx.put_room(room.clone());
    Ok(room)
}
