//! Runs against the database named by `DATABASE_URL`; skipped when it is unset.

use assert_matches::assert_matches;
use chrono::{NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use shared_database::{ClinicStore, PostgresStore, RowKey, StoreError, UnitScope};
use shared_models::{Appointment, AppointmentStatus, Room, RoomStatus};

/// Two handles on separate pools, like two API instances.
async fn instances() -> Option<(ClinicStore, ClinicStore)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let first = PostgresStore::connect(&url, 2).await.unwrap();
    first.migrate().await.unwrap();
    let second = PostgresStore::connect(&url, 2).await.unwrap();
    Some((
        ClinicStore::new(first.into_backend()),
        ClinicStore::new(second.into_backend()),
    ))
}

fn clinic_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn appointment(location_id: Uuid) -> Appointment {
    let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
    Appointment {
        id: Uuid::new_v4(),
        location_id,
        patient_name: "Ama".to_string(),
        patient_contact: "ama@example.com".to_string(),
        scheduled_start: at,
        service_id: Uuid::new_v4(),
        status: AppointmentStatus::Booked,
        practitioner_id: None,
        room_label: None,
        is_late: false,
        checked_in_at: None,
        treatment_started_at: None,
        treatment_ended_at: None,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn test_rows_committed_by_one_instance_are_seen_by_another() {
    let Some((north, south)) = instances().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let row = appointment(Uuid::new_v4());
    let id = row.id;

    north
        .atomic(&UnitScope::none(), |tx| {
            tx.put_appointment(row);
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap();

    let seen = south.snapshot(&UnitScope::appointment(id)).await.unwrap();
    assert_eq!(seen.appointment(id).unwrap().patient_name, "Ama");
}

#[tokio::test]
async fn test_queue_numbers_are_unique_across_instances() {
    let Some((north, south)) = instances().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let location = Uuid::new_v4();
    let scope = UnitScope::day(location, clinic_day());

    let mut first = north.begin(&scope).await.unwrap();
    let mut second = south.begin(&scope).await.unwrap();
    assert_eq!(first.next_queue_number(location, clinic_day()), 1);
    assert_eq!(second.next_queue_number(location, clinic_day()), 1);

    north.commit(first).await.unwrap();
    let rejected = south.commit(second).await;
    assert!(rejected.unwrap_err().is_contention());

    let mut third = south.begin(&scope).await.unwrap();
    assert_eq!(third.next_queue_number(location, clinic_day()), 2);
}

#[tokio::test]
async fn test_second_writer_of_a_locked_row_is_rejected() {
    let Some((north, south)) = instances().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let room = Room {
        id: Uuid::new_v4(),
        location_id: Uuid::new_v4(),
        number: 1,
        capacity: 1,
        is_active: true,
        status: RoomStatus::Available,
    };
    let room_id = room.id;
    north
        .atomic(&UnitScope::none(), |tx| {
            tx.put_room(room);
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap();

    let mut first = north.begin(&UnitScope::none()).await.unwrap();
    let mut second = south.begin(&UnitScope::none()).await.unwrap();
    for tx in [&mut first, &mut second] {
        let mut locked = tx.lock_room(room_id).unwrap();
        locked.status = RoomStatus::Occupied;
        tx.put_room(locked);
    }

    let (a, b) = tokio::join!(north.commit(first), south.commit(second));
    let failures: Vec<StoreError> = [a, b].into_iter().filter_map(Result::err).collect();
    assert_eq!(failures.len(), 1);
    assert_matches!(&failures[0], StoreError::Contention(RowKey::Room(id)) if *id == room_id);

    let committed = north.snapshot(&UnitScope::none()).await.unwrap();
    assert_eq!(committed.room(room_id).unwrap().status, RoomStatus::Occupied);
}

#[tokio::test]
async fn test_duplicate_room_numbers_conflict_in_the_database() {
    let Some((north, south)) = instances().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let location = Uuid::new_v4();
    let room = |number| Room {
        id: Uuid::new_v4(),
        location_id: location,
        number,
        capacity: 1,
        is_active: true,
        status: RoomStatus::Available,
    };

    let mut first = north.begin(&UnitScope::none()).await.unwrap();
    let mut second = south.begin(&UnitScope::none()).await.unwrap();
    first.put_room(room(7));
    second.put_room(room(7));

    north.commit(first).await.unwrap();
    assert_matches!(south.commit(second).await, Err(StoreError::Conflict(_)));
}
