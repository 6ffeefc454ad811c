mod common;

use chrono::Duration;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use patient_flow_cell::{SweepReport, SweepWorker};
use shared_models::AppointmentStatus;

use common::Clinic;

#[tokio::test]
async fn test_late_sweep_flags_overdue_appointments_once() {
    let clinic = Clinic::new();
    let booked = clinic.book_in(0).await;
    let confirmed = clinic.book_confirmed_in(0).await;
    let later = clinic.book_in(30).await;

    clinic.clock.advance(Duration::minutes(15));
    assert_eq!(clinic.engine.mark_late().await.unwrap(), 0);

    clinic.clock.advance(Duration::minutes(1));
    assert_eq!(clinic.engine.mark_late().await.unwrap(), 2);
    assert!(clinic.appointment(booked.id).is_late);
    assert!(clinic.appointment(confirmed.id).is_late);
    assert!(!clinic.appointment(later.id).is_late);
    assert_eq!(clinic.appointment(booked.id).status, AppointmentStatus::Booked);

    assert_eq!(clinic.engine.mark_late().await.unwrap(), 0);
    let flagged = clinic
        .audit
        .actions()
        .into_iter()
        .filter(|action| action == "appointment.late")
        .count();
    assert_eq!(flagged, 2);
}

#[tokio::test]
async fn test_no_show_sweep_only_moves_confirmed_appointments() {
    let clinic = Clinic::new();
    let booked = clinic.book_in(0).await;
    let confirmed = clinic.book_confirmed_in(0).await;
    let mut events = clinic.engine.subscribe();

    clinic.clock.advance(Duration::minutes(31));
    assert_eq!(clinic.engine.mark_no_show().await.unwrap(), 1);

    assert_eq!(clinic.appointment(confirmed.id).status, AppointmentStatus::NoShow);
    assert_eq!(clinic.appointment(booked.id).status, AppointmentStatus::Booked);

    let event = events.try_recv().unwrap();
    assert_eq!(event.appointment_id, confirmed.id);
    assert_eq!(event.final_status, AppointmentStatus::NoShow);
    assert_eq!(event.reason, "no-show sweep");

    assert_eq!(clinic.engine.mark_no_show().await.unwrap(), 0);
}

#[tokio::test]
async fn test_arrived_patients_are_never_swept() {
    let clinic = Clinic::new();
    let (waiting, _) = clinic.arrive().await;
    let confirmed = clinic.book_confirmed_in(0).await;
    clinic.engine.check_in(confirmed.id).await.unwrap();

    clinic.clock.advance(Duration::minutes(90));

    assert_eq!(clinic.engine.mark_late().await.unwrap(), 0);
    assert_eq!(clinic.engine.mark_no_show().await.unwrap(), 0);
    assert_eq!(clinic.appointment(waiting.id).status, AppointmentStatus::Waiting);
    assert_eq!(clinic.appointment(confirmed.id).status, AppointmentStatus::Waiting);
}

#[tokio::test]
async fn test_late_patient_is_flagged_then_still_served() {
    let clinic = Clinic::new();
    let appointment = clinic.book_confirmed_in(0).await;

    clinic.clock.advance(Duration::minutes(20));
    assert_eq!(clinic.engine.mark_late().await.unwrap(), 1);

    let receipt = clinic.engine.check_in(appointment.id).await.unwrap();
    assert!(receipt.appointment.is_late);
    assert_eq!(receipt.appointment.status, AppointmentStatus::Waiting);

    clinic.clock.advance(Duration::minutes(20));
    assert_eq!(clinic.engine.mark_no_show().await.unwrap(), 0);
}

#[tokio::test]
async fn test_worker_pass_runs_both_sweeps() {
    let clinic = Clinic::new();
    clinic.book_in(0).await;
    clinic.book_confirmed_in(0).await;
    clinic.clock.advance(Duration::minutes(45));

    let worker = SweepWorker::new(Arc::new(clinic.engine.clone()), StdDuration::from_secs(60));
    let report = worker.run_once().await.unwrap();

    assert_eq!(report, SweepReport { late: 2, no_show: 1 });
    assert_eq!(worker.run_once().await.unwrap(), SweepReport::default());
}
