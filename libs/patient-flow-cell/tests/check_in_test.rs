mod common;

use assert_matches::assert_matches;
use chrono::{Duration, TimeZone, Utc};
use futures::future::join_all;

use patient_flow_cell::{CheckInRejection, FlowError};
use shared_models::{AppointmentStatus, QueueStatus};

use common::Clinic;

#[tokio::test]
async fn test_check_in_creates_a_waiting_entry() {
    let clinic = Clinic::new();
    let appointment = clinic.book_confirmed_in(10).await;

    let receipt = clinic.engine.check_in(appointment.id).await.unwrap();

    assert!(!receipt.duplicate);
    assert_eq!(receipt.entry.queue_number, 1);
    assert_eq!(receipt.entry.queue_status, QueueStatus::Waiting);
    assert_eq!(receipt.entry.appointment_id, appointment.id);
    assert_eq!(receipt.entry.checked_in_at, common::opening_time());
    assert_eq!(receipt.appointment.status, AppointmentStatus::Waiting);
    assert_eq!(receipt.appointment.checked_in_at, Some(common::opening_time()));
}

#[tokio::test]
async fn test_check_in_window_opens_thirty_minutes_before_start() {
    let clinic = Clinic::new();
    let too_early = clinic.book_in(31).await;
    let on_the_boundary = clinic.book_in(30).await;

    let result = clinic.engine.check_in(too_early.id).await;
    let expected_opening = Utc.with_ymd_and_hms(2026, 10, 19, 9, 1, 0).unwrap();
    assert_matches!(
        result,
        Err(FlowError::CheckIn(CheckInRejection::TooEarly { opens_at })) if opens_at == expected_opening
    );
    assert_eq!(clinic.appointment(too_early.id).status, AppointmentStatus::Booked);
    assert!(clinic
        .memory
        .snapshot()
        .unwrap()
        .queue_entry_for_appointment(too_early.id)
        .is_none());

    let receipt = clinic.engine.check_in(on_the_boundary.id).await.unwrap();
    assert_eq!(receipt.appointment.status, AppointmentStatus::Waiting);
}

#[tokio::test]
async fn test_late_patient_can_still_check_in() {
    let clinic = Clinic::new();
    let appointment = clinic.book_in(-90).await;

    let receipt = clinic.engine.check_in(appointment.id).await.unwrap();
    assert_eq!(receipt.appointment.status, AppointmentStatus::Waiting);
}

#[tokio::test]
async fn test_check_in_only_on_the_appointment_day() {
    let clinic = Clinic::new();
    let tomorrow = clinic.book_in(24 * 60).await;

    let result = clinic.engine.check_in(tomorrow.id).await;
    assert_matches!(
        result,
        Err(FlowError::CheckIn(CheckInRejection::NotToday { scheduled, today }))
            if scheduled == today + Duration::days(1)
    );
}

#[tokio::test]
async fn test_cancelled_and_no_show_appointments_cannot_check_in() {
    let clinic = Clinic::new();
    let appointment = clinic.book_in(0).await;
    clinic
        .engine
        .transition(appointment.id, AppointmentStatus::Cancelled, "cancelled by phone")
        .await
        .unwrap();

    let result = clinic.engine.check_in(appointment.id).await;
    assert_matches!(
        result,
        Err(FlowError::CheckIn(CheckInRejection::Closed(AppointmentStatus::Cancelled)))
    );
}

#[tokio::test]
async fn test_paused_queue_rejects_check_in_until_resumed() {
    let clinic = Clinic::new();
    let appointment = clinic.book_in(0).await;

    clinic.engine.pause(clinic.location_id).await.unwrap();
    let result = clinic.engine.check_in(appointment.id).await;
    assert_matches!(result, Err(FlowError::CheckIn(CheckInRejection::QueuePaused)));
    assert_eq!(clinic.appointment(appointment.id).status, AppointmentStatus::Booked);

    clinic.engine.resume(clinic.location_id).await.unwrap();
    let receipt = clinic.engine.check_in(appointment.id).await.unwrap();
    assert_eq!(receipt.entry.queue_number, 1);
}

#[tokio::test]
async fn test_second_check_in_returns_the_existing_entry() {
    let clinic = Clinic::new();
    let (appointment, entry) = clinic.arrive().await;
    let audit_before = clinic.memory.audit_log().unwrap().len();

    let again = clinic.engine.check_in(appointment.id).await.unwrap();

    assert!(again.duplicate);
    assert_eq!(again.entry.id, entry.id);
    assert_eq!(again.entry.queue_number, entry.queue_number);
    assert_eq!(clinic.memory.audit_log().unwrap().len(), audit_before);
}

#[tokio::test]
async fn test_finished_visit_cannot_check_in_again() {
    let clinic = Clinic::new();
    clinic.add_rooms(1).await;
    clinic.add_practitioner("Dr. Addo").await;
    let (appointment, _) = clinic.arrive().await;
    clinic
        .engine
        .transition(appointment.id, AppointmentStatus::Completed, "done")
        .await
        .unwrap();

    let result = clinic.engine.check_in(appointment.id).await;
    assert_matches!(
        result,
        Err(FlowError::CheckIn(CheckInRejection::AlreadyCheckedIn(
            AppointmentStatus::FeedbackScheduled
        )))
    );
}

#[tokio::test]
async fn test_unknown_appointment_is_not_found() {
    let clinic = Clinic::new();
    let missing = uuid::Uuid::new_v4();

    let result = clinic.engine.check_in(missing).await;
    assert_matches!(result, Err(FlowError::AppointmentNotFound(id)) if id == missing);
}

#[tokio::test]
async fn test_concurrent_check_ins_of_one_appointment_create_one_entry() {
    let clinic = Clinic::new();
    let appointment = clinic.book_in(0).await;

    let receipts: Vec<_> = join_all((0..4).map(|_| clinic.engine.check_in(appointment.id)))
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    assert_eq!(receipts.iter().filter(|receipt| !receipt.duplicate).count(), 1);
    assert!(receipts.iter().all(|receipt| receipt.entry.id == receipts[0].entry.id));
    assert!(receipts.iter().all(|receipt| receipt.entry.queue_number == 1));

    let snapshot = clinic.engine.queue_snapshot(clinic.location_id, None).await.unwrap();
    assert_eq!(snapshot.counts.waiting, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_check_ins_get_distinct_consecutive_numbers() {
    let clinic = Clinic::new();
    let mut appointments = Vec::new();
    for _ in 0..10 {
        appointments.push(clinic.book_in(0).await);
    }

    let handles: Vec<_> = appointments
        .iter()
        .map(|appointment| {
            let engine = clinic.engine.clone();
            let id = appointment.id;
            tokio::spawn(async move { engine.check_in(id).await })
        })
        .collect();

    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().entry.queue_number);
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=10).collect::<Vec<u32>>());
}
