//! Wait-time estimation.
//!
//! The estimate models rooms working in parallel: patients ahead are spread
//! over the rooms that are free, and only when every room is busy does the
//! patient wait for the first treatment to finish.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use resource_cell::room::active_room_count;
use shared_database::Transaction;
use shared_models::{Appointment, AppointmentStatus, QueueStatus};

/// Shortest service duration used for estimates.
pub const MIN_SERVICE_MINUTES: u32 = 15;

pub fn floor_service_minutes(minutes: u32) -> u32 {
    minutes.max(MIN_SERVICE_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLoad {
    pub waiting_ahead: u32,
    pub active_rooms: u32,
    pub rooms_in_treatment: u32,
    /// Longest time still to run among current treatments, in minutes.
    pub longest_remaining_minutes: u32,
}

impl QueueLoad {
    pub fn available_rooms(&self) -> u32 {
        self.active_rooms.saturating_sub(self.rooms_in_treatment)
    }
}

/// Expected wait for a queued patient whose own service takes `service_minutes`.
pub fn wait_minutes(load: &QueueLoad, service_minutes: u32) -> u32 {
    let duration = floor_service_minutes(service_minutes);
    let available = load.available_rooms();

    if available == 0 {
        return load.longest_remaining_minutes + duration;
    }
    if load.waiting_ahead == 0 {
        return 0;
    }
    load.waiting_ahead.div_ceil(available) * duration
}

/// Whole minutes until a treatment started at `started_at` is due to end.
pub fn remaining_minutes(started_at: DateTime<Utc>, duration_minutes: u32, now: DateTime<Utc>) -> u32 {
    let ends_at = started_at + Duration::minutes(i64::from(duration_minutes));
    let seconds = (ends_at - now).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    u32::try_from((seconds + 59) / 60).unwrap_or(u32::MAX)
}

/// A treatment in progress at the patient's clinic.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTreatment {
    pub started_at: DateTime<Utc>,
    pub service_id: Uuid,
}

/// Everything the estimate needs, read from one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum EtaInputs {
    /// Booked, confirmed or finished: no estimate is given.
    NotQueued,
    InTreatment,
    Queued {
        service_id: Uuid,
        waiting_ahead: u32,
        active_rooms: u32,
        rooms_in_treatment: u32,
        treatments: Vec<ActiveTreatment>,
    },
}

impl EtaInputs {
    /// Services whose durations must be known to finish the estimate.
    pub fn service_ids(&self) -> Vec<Uuid> {
        match self {
            EtaInputs::Queued {
                service_id,
                treatments,
                ..
            } => {
                let mut ids: Vec<Uuid> = treatments.iter().map(|t| t.service_id).collect();
                ids.push(*service_id);
                ids.sort();
                ids.dedup();
                ids
            }
            _ => Vec::new(),
        }
    }
}

pub fn collect_inputs(tx: &Transaction, appointment: &Appointment) -> EtaInputs {
    match appointment.status {
        AppointmentStatus::InTreatment => return EtaInputs::InTreatment,
        AppointmentStatus::CheckedIn | AppointmentStatus::Waiting | AppointmentStatus::Called => {}
        _ => return EtaInputs::NotQueued,
    }
    let Some(own) = tx.queue_entry_for_appointment(appointment.id) else {
        return EtaInputs::NotQueued;
    };

    let waiting_ahead = tx
        .queue_entries_for_day(own.location_id, own.clinic_date)
        .iter()
        .filter(|entry| {
            entry.id != own.id
                && entry.queue_status == QueueStatus::Waiting
                && entry.queue_number < own.queue_number
        })
        .count();

    let in_treatment: Vec<_> = tx
        .entries_in_treatment()
        .into_iter()
        .filter(|entry| entry.location_id == own.location_id)
        .collect();
    let occupied: HashSet<Uuid> = in_treatment.iter().filter_map(|entry| entry.room_id).collect();
    let treatments = in_treatment
        .iter()
        .filter_map(|entry| {
            let started_at = entry.started_at?;
            let service_id = tx.appointment(entry.appointment_id)?.service_id;
            Some(ActiveTreatment { started_at, service_id })
        })
        .collect();

    EtaInputs::Queued {
        service_id: appointment.service_id,
        waiting_ahead: count(waiting_ahead),
        active_rooms: count(active_room_count(tx, own.location_id)),
        rooms_in_treatment: count(occupied.len()),
        treatments,
    }
}

/// Finish an estimate once service durations are known. `duration_of`
/// returns the catalog duration in minutes.
pub fn estimate(inputs: &EtaInputs, now: DateTime<Utc>, duration_of: impl Fn(Uuid) -> u32) -> Option<u32> {
    match inputs {
        EtaInputs::NotQueued => None,
        EtaInputs::InTreatment => Some(0),
        EtaInputs::Queued {
            service_id,
            waiting_ahead,
            active_rooms,
            rooms_in_treatment,
            treatments,
        } => {
            let longest_remaining_minutes = treatments
                .iter()
                .map(|t| remaining_minutes(t.started_at, floor_service_minutes(duration_of(t.service_id)), now))
                .max()
                .unwrap_or(0);
            let load = QueueLoad {
                waiting_ahead: *waiting_ahead,
                active_rooms: *active_rooms,
                rooms_in_treatment: *rooms_in_treatment,
                longest_remaining_minutes,
            };
            Some(wait_minutes(&load, duration_of(*service_id)))
        }
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn free_room_and_nobody_ahead_means_no_wait() {
        let load = QueueLoad {
            waiting_ahead: 0,
            active_rooms: 3,
            rooms_in_treatment: 2,
            longest_remaining_minutes: 25,
        };
        assert_eq!(wait_minutes(&load, 30), 0);
    }

    #[test]
    fn patients_ahead_are_spread_over_free_rooms() {
        let load = QueueLoad {
            waiting_ahead: 2,
            active_rooms: 3,
            rooms_in_treatment: 2,
            longest_remaining_minutes: 0,
        };
        assert_eq!(wait_minutes(&load, 30), 60);

        let two_free = QueueLoad {
            rooms_in_treatment: 1,
            ..load
        };
        assert_eq!(wait_minutes(&two_free, 30), 30);

        let five_ahead = QueueLoad {
            waiting_ahead: 5,
            ..two_free
        };
        assert_eq!(wait_minutes(&five_ahead, 30), 90);
    }

    #[test]
    fn full_clinic_waits_for_longest_treatment() {
        let load = QueueLoad {
            waiting_ahead: 4,
            active_rooms: 2,
            rooms_in_treatment: 2,
            longest_remaining_minutes: 12,
        };
        assert_eq!(wait_minutes(&load, 20), 32);
    }

    #[test]
    fn short_services_are_floored() {
        let load = QueueLoad {
            waiting_ahead: 1,
            active_rooms: 1,
            rooms_in_treatment: 0,
            longest_remaining_minutes: 0,
        };
        assert_eq!(wait_minutes(&load, 5), 15);
    }

    #[test]
    fn remaining_time_rounds_up_and_never_goes_negative() {
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let now = start + Duration::seconds(10 * 60 + 30);
        assert_eq!(remaining_minutes(start, 30, now), 20);
        assert_eq!(remaining_minutes(start, 10, now), 0);
    }

    #[test]
    fn estimate_uses_each_treatment_duration() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        let long_service = Uuid::new_v4();
        let short_service = Uuid::new_v4();
        let own_service = Uuid::new_v4();
        let inputs = EtaInputs::Queued {
            service_id: own_service,
            waiting_ahead: 0,
            active_rooms: 2,
            rooms_in_treatment: 2,
            treatments: vec![
                ActiveTreatment {
                    started_at: now - Duration::minutes(10),
                    service_id: long_service,
                },
                ActiveTreatment {
                    started_at: now - Duration::minutes(5),
                    service_id: short_service,
                },
            ],
        };
        let durations = |id: Uuid| {
            if id == long_service {
                60
            } else if id == short_service {
                15
            } else {
                30
            }
        };

        assert_eq!(inputs.service_ids().len(), 3);
        assert_eq!(estimate(&inputs, now, durations), Some(50 + 30));
        assert_eq!(estimate(&EtaInputs::NotQueued, now, durations), None);
        assert_eq!(estimate(&EtaInputs::InTreatment, now, durations), Some(0));
    }
}
