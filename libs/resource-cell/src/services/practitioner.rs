// libs/resource-cell/src/services/practitioner.rs
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use shared_database::{run_atomic, ClinicStore, RetryPolicy, StoreError, Transaction, UnitScope};
use shared_models::{AuditRecord, LeavePeriod, Practitioner, PractitionerStatus};

use crate::models::{CreateLeaveRequest, CreatePractitionerRequest, ResourceError};

pub struct PractitionerService {
    store: ClinicStore,
    retry: RetryPolicy,
}

impl PractitionerService {
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

    pub async fn register_practitioner(
        &self,
        request: CreatePractitionerRequest,
    ) -> Result<Practitioner, ResourceError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ResourceError::ValidationError("Practitioner name is required".to_string()));
        }
        if request.location_ids.is_empty() {
            return Err(ResourceError::ValidationError(
                "Practitioner must be assigned to at least one clinic location".to_string(),
            ));
        }

        let committed = run_atomic(&self.store, &UnitScope::none(), &self.retry, "register_practitioner", |tx| {
            let practitioner = Practitioner {
                id: Uuid::new_v4(),
                name: name.clone(),
                location_ids: request.location_ids.clone(),
                is_active: true,
                status: PractitionerStatus::Available,
                leave: Vec::new(),
            };
            tx.put_practitioner(practitioner.clone());
            tx.record_audit(
                AuditRecord::new(
                    "practitioner.register",
                    "practitioner",
                    practitioner.id,
                    practitioner.name.clone(),
                    Utc::now(),
                )
                .with_change(None, Some(json!(practitioner))),
            );
            Ok::<_, ResourceError>(practitioner)
        })
        .await?;

        info!("Practitioner {} registered with ID {}", committed.value.name, committed.value.id);
        Ok(committed.value)
    }

    pub async fn set_practitioner_active(
        &self,
        practitioner_id: Uuid,
        is_active: bool,
    ) -> Result<Practitioner, ResourceError> {
        let committed = run_atomic(&self.store, &UnitScope::none(), &self.retry, "set_practitioner_active", |tx| {
            let before = tx
                .lock_practitioner(practitioner_id)
                .map_err(|_| ResourceError::PractitionerNotFound(practitioner_id))?;
            let mut practitioner = before.clone();
            practitioner.is_active = is_active;
            tx.put_practitioner(practitioner.clone());
            tx.record_audit(
                AuditRecord::new(
                    if is_active { "practitioner.activate" } else { "practitioner.deactivate" },
                    "practitioner",
                    practitioner_id,
                    practitioner.name.clone(),
                    Utc::now(),
                )
                .with_change(
                    Some(json!({ "is_active": before.is_active })),
                    Some(json!({ "is_active": is_active })),
                ),
            );
            Ok::<_, ResourceError>(practitioner)
        })
        .await?;

        Ok(committed.value)
    }

    pub async fn add_leave(
        &self,
        practitioner_id: Uuid,
        request: CreateLeaveRequest,
    ) -> Result<Practitioner, ResourceError> {
        if request.end_date < request.start_date {
            return Err(ResourceError::ValidationError(
                "Leave must end on or after its start date".to_string(),
            ));
        }

        let committed = run_atomic(&self.store, &UnitScope::none(), &self.retry, "add_leave", |tx| {
            let mut practitioner = tx
                .lock_practitioner(practitioner_id)
                .map_err(|_| ResourceError::PractitionerNotFound(practitioner_id))?;
            let period = LeavePeriod {
                start_date: request.start_date,
                end_date: request.end_date,
                reason: request.reason.clone(),
            };
            practitioner.leave.push(period.clone());
            tx.put_practitioner(practitioner.clone());
            tx.record_audit(
                AuditRecord::new(
                    "practitioner.leave",
                    "practitioner",
                    practitioner_id,
                    format!("{} to {}", period.start_date, period.end_date),
                    Utc::now(),
                )
                .with_change(None, Some(json!(period))),
            );
            Ok::<_, ResourceError>(practitioner)
        })
        .await?;

        debug!("Leave recorded for practitioner {}", practitioner_id);
        Ok(committed.value)
    }

    pub async fn list_practitioners(&self, location_id: Uuid) -> Result<Vec<Practitioner>, ResourceError> {
        let snapshot = self.store.snapshot(&UnitScope::none()).await?;
        let mut practitioners: Vec<Practitioner> = snapshot
            .practitioners()
            .into_iter()
            .filter(|p| p.works_at(location_id))
            .collect();
        sort_for_selection(&mut practitioners);
        Ok(practitioners)
    }
}

/// Practitioners currently attached to a live treatment, at any location.
pub fn practitioners_in_treatment(tx: &Transaction) -> HashSet<Uuid> {
    tx.entries_in_treatment()
        .iter()
        .filter_map(|entry| entry.practitioner_id)
        .collect()
}

/// Practitioners who can take a patient at `location_id` on `date`:
/// active, staffed at the location, not on leave, and not treating anyone
/// anywhere. Ordered by name, then id.
pub fn eligible_practitioners(tx: &Transaction, location_id: Uuid, date: NaiveDate) -> Vec<Practitioner> {
    let treating = practitioners_in_treatment(tx);
    let mut practitioners: Vec<Practitioner> = tx
        .practitioners()
        .into_iter()
        .filter(|p| {
            p.is_active && p.works_at(location_id) && !p.is_on_leave(date) && !treating.contains(&p.id)
        })
        .collect();
    sort_for_selection(&mut practitioners);
    practitioners
}

/// The previously assigned practitioner wins if still eligible.
pub fn select_practitioner(eligible: &[Practitioner], preferred: Option<Uuid>) -> Option<Practitioner> {
    preferred
        .and_then(|id| eligible.iter().find(|p| p.id == id))
        .or_else(|| eligible.first())
        .cloned()
}

pub fn mark_busy(tx: &mut Transaction, practitioner_id: Uuid) -> Result<Practitioner, StoreError> {
    set_practitioner_status(tx, practitioner_id, PractitionerStatus::Busy)
}

pub fn release_practitioner(tx: &mut Transaction, practitioner_id: Uuid) -> Result<Practitioner, StoreError> {
    set_practitioner_status(tx, practitioner_id, PractitionerStatus::Available)
}

fn set_practitioner_status(
    tx: &mut Transaction,
    practitioner_id: Uuid,
    status: PractitionerStatus,
) -> Result<Practitioner, StoreError> {
    let mut practitioner = tx.lock_practitioner(practitioner_id)?;
    practitioner.status = status;
    tx.put_practitioner(practitioner.clone());
    Ok(practitioner)
}

fn sort_for_selection(practitioners: &mut [Practitioner]) {
    practitioners.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}
