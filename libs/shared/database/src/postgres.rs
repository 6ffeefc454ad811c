//! Postgres store backend.
//!
//! A unit reads its rows from one read-only snapshot without holding locks. Commit opens one
//! database transaction, takes `SELECT ... FOR UPDATE` on every row of the lock
//! trail in the order the unit acquired them, compares versions and only then
//! writes. Unique, serialization and deadlock failures come back as
//! [`StoreError::Conflict`] and are retried like any other contention.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use shared_models::{AppointmentStatus, AuditRecord, QueueStatus};

use crate::store::{
    OutboxMessage, RowKey, StoreBackend, StoreError, Tables, Transaction, UnitParts, UnitScope, Versioned,
};

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

const INSERT_APPOINTMENT: &str = r"
    INSERT INTO appointments (id, version, location_id, status, scheduled_start, data)
    VALUES ($1, 1, $2, $3, $4, $5)
";
const UPDATE_APPOINTMENT: &str = r"
    UPDATE appointments
    SET version = version + 1, location_id = $2, status = $3, scheduled_start = $4, data = $5
    WHERE id = $1
";
const INSERT_QUEUE_ENTRY: &str = r"
    INSERT INTO queue_entries
        (id, version, appointment_id, location_id, clinic_date, queue_number, queue_status, data)
    VALUES ($1, 1, $2, $3, $4, $5, $6, $7)
";
const UPDATE_QUEUE_ENTRY: &str = r"
    UPDATE queue_entries
    SET version = version + 1, appointment_id = $2, location_id = $3, clinic_date = $4,
        queue_number = $5, queue_status = $6, data = $7
    WHERE id = $1
";
const INSERT_ROOM: &str = r"
    INSERT INTO rooms (id, version, location_id, number, data)
    VALUES ($1, 1, $2, $3, $4)
";
const UPDATE_ROOM: &str = r"
    UPDATE rooms SET version = version + 1, location_id = $2, number = $3, data = $4
    WHERE id = $1
";
const INSERT_PRACTITIONER: &str = "INSERT INTO practitioners (id, version, data) VALUES ($1, 1, $2)";
const UPDATE_PRACTITIONER: &str = "UPDATE practitioners SET version = version + 1, data = $2 WHERE id = $1";
const INSERT_COUNTER: &str = r"
    INSERT INTO queue_counters (location_id, clinic_date, last_number, version)
    VALUES ($1, $2, $3, 1)
";
const UPDATE_COUNTER: &str = r"
    UPDATE queue_counters SET last_number = $3, version = version + 1
    WHERE location_id = $1 AND clinic_date = $2
";

type VersionedRow = (Uuid, i64, Value);

/// Durable store shared by every API instance pointed at the same database.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect: {e}")))?;

        info!("Connected to Postgres store");
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn into_backend(self) -> Arc<dyn StoreBackend> {
        Arc::new(self)
    }

    async fn load_tables(&self, scope: &UnitScope) -> Result<Tables, StoreError> {
        let terminal: Vec<String> = AppointmentStatus::ALL
            .iter()
            .filter(|status| status.is_terminal())
            .map(|status| status.as_str().to_string())
            .collect();
        let live_queue = vec![
            QueueStatus::Waiting.as_str().to_string(),
            QueueStatus::InTreatment.as_str().to_string(),
        ];
        let (day_locations, day_dates): (Vec<Uuid>, Vec<NaiveDate>) = scope.days.iter().copied().unzip();

        // One snapshot for every read of the unit.
        let mut db = self.pool.begin().await.map_err(from_sqlx)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *db)
            .await
            .map_err(from_sqlx)?;

        let rooms: Vec<VersionedRow> = sqlx::query_as("SELECT id, version, data FROM rooms")
            .fetch_all(&mut *db)
            .await
            .map_err(from_sqlx)?;

        let practitioners: Vec<VersionedRow> = sqlx::query_as("SELECT id, version, data FROM practitioners")
            .fetch_all(&mut *db)
            .await
            .map_err(from_sqlx)?;

        let appointments: Vec<VersionedRow> = sqlx::query_as(
            r"
            SELECT id, version, data
            FROM appointments
            WHERE status <> ALL($1)
               OR id = ANY($2)
               OR id IN (
                   SELECT appointment_id FROM queue_entries
                   WHERE queue_status = ANY($3)
                      OR id = ANY($4)
                      OR (location_id, clinic_date) IN (SELECT * FROM UNNEST($5::uuid[], $6::date[]))
               )
            ",
        )
        .bind(&terminal)
        .bind(scope.appointments.clone())
        .bind(&live_queue)
        .bind(scope.queue_entries.clone())
        .bind(day_locations.clone())
        .bind(day_dates.clone())
        .fetch_all(&mut *db)
        .await
        .map_err(from_sqlx)?;

        let queue_entries: Vec<VersionedRow> = sqlx::query_as(
            r"
            SELECT id, version, data
            FROM queue_entries
            WHERE queue_status = ANY($1)
               OR appointment_id = ANY($2)
               OR id = ANY($3)
               OR (location_id, clinic_date) IN (SELECT * FROM UNNEST($4::uuid[], $5::date[]))
            ",
        )
        .bind(&live_queue)
        .bind(scope.appointments.clone())
        .bind(scope.queue_entries.clone())
        .bind(day_locations.clone())
        .bind(day_dates.clone())
        .fetch_all(&mut *db)
        .await
        .map_err(from_sqlx)?;

        let counters: Vec<(Uuid, NaiveDate, i32, i64)> = sqlx::query_as(
            r"
            SELECT location_id, clinic_date, last_number, version
            FROM queue_counters
            WHERE (location_id, clinic_date) IN (SELECT * FROM UNNEST($1::uuid[], $2::date[]))
            ",
        )
        .bind(day_locations)
        .bind(day_dates)
        .fetch_all(&mut *db)
        .await
        .map_err(from_sqlx)?;

        db.commit().await.map_err(from_sqlx)?;

        let mut tables = Tables {
            appointments: decode(appointments)?,
            queue_entries: decode(queue_entries)?,
            rooms: decode(rooms)?,
            practitioners: decode(practitioners)?,
            queue_counters: HashMap::new(),
        };
        for (location_id, date, last_number, version) in counters {
            tables.queue_counters.insert(
                (location_id, date),
                Versioned {
                    version: from_db_version(version),
                    row: u32::try_from(last_number).unwrap_or(0),
                },
            );
        }
        Ok(tables)
    }
}

#[async_trait]
impl StoreBackend for PostgresStore {
    async fn begin(&self, scope: &UnitScope) -> Result<Transaction, StoreError> {
        let tables = self.load_tables(scope).await?;
        Ok(Transaction::new(Arc::new(tables)))
    }

    async fn commit(&self, tx: Transaction) -> Result<(Vec<AuditRecord>, Vec<OutboxMessage>), StoreError> {
        let UnitParts {
            writes,
            locks,
            audit,
            outbox,
        } = tx.into_parts();

        let mut db = self.pool.begin().await.map_err(from_sqlx)?;

        for (key, seen) in &locks {
            let current = lock_row(&mut db, key).await?;
            if current != *seen {
                debug!("Commit rejected: {} moved from version {} to {}", key, seen, current);
                return Err(StoreError::Contention(key.clone()));
            }
        }

        let seen: HashMap<RowKey, u64> = locks.into_iter().collect();
        let seen_version = |key: RowKey| seen.get(&key).copied().unwrap_or(0);

        for row in writes.appointments.values() {
            let sql = pick(seen_version(RowKey::Appointment(row.id)), INSERT_APPOINTMENT, UPDATE_APPOINTMENT);
            sqlx::query(sql)
                .bind(row.id)
                .bind(row.location_id)
                .bind(row.status.as_str())
                .bind(row.scheduled_start)
                .bind(to_json(row)?)
                .execute(&mut *db)
                .await
                .map_err(from_sqlx)?;
        }

        for row in writes.queue_entries.values() {
            let sql = pick(seen_version(RowKey::QueueEntry(row.id)), INSERT_QUEUE_ENTRY, UPDATE_QUEUE_ENTRY);
            sqlx::query(sql)
                .bind(row.id)
                .bind(row.appointment_id)
                .bind(row.location_id)
                .bind(row.clinic_date)
                .bind(to_db_number(row.queue_number)?)
                .bind(row.queue_status.as_str())
                .bind(to_json(row)?)
                .execute(&mut *db)
                .await
                .map_err(from_sqlx)?;
        }

        for row in writes.rooms.values() {
            let sql = pick(seen_version(RowKey::Room(row.id)), INSERT_ROOM, UPDATE_ROOM);
            sqlx::query(sql)
                .bind(row.id)
                .bind(row.location_id)
                .bind(to_db_number(row.number)?)
                .bind(to_json(row)?)
                .execute(&mut *db)
                .await
                .map_err(from_sqlx)?;
        }

        for row in writes.practitioners.values() {
            let sql = pick(
                seen_version(RowKey::Practitioner(row.id)),
                INSERT_PRACTITIONER,
                UPDATE_PRACTITIONER,
            );
            sqlx::query(sql)
                .bind(row.id)
                .bind(to_json(row)?)
                .execute(&mut *db)
                .await
                .map_err(from_sqlx)?;
        }

        for ((location_id, date), last_number) in &writes.queue_counters {
            let sql = pick(
                seen_version(RowKey::QueueCounter(*location_id, *date)),
                INSERT_COUNTER,
                UPDATE_COUNTER,
            );
            sqlx::query(sql)
                .bind(*location_id)
                .bind(*date)
                .bind(to_db_number(*last_number)?)
                .execute(&mut *db)
                .await
                .map_err(from_sqlx)?;
        }

        for record in &audit {
            insert_audit(&mut db, record).await?;
        }

        db.commit().await.map_err(from_sqlx)?;
        Ok((audit, outbox))
    }
}

/// Exclusive lock on one row; a missing row reads as version 0.
async fn lock_row(conn: &mut PgConnection, key: &RowKey) -> Result<u64, StoreError> {
    let version: Option<i64> = match key {
        RowKey::Appointment(id) => {
            sqlx::query_scalar("SELECT version FROM appointments WHERE id = $1 FOR UPDATE")
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await
        }
        RowKey::QueueEntry(id) => {
            sqlx::query_scalar("SELECT version FROM queue_entries WHERE id = $1 FOR UPDATE")
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await
        }
        RowKey::Room(id) => {
            sqlx::query_scalar("SELECT version FROM rooms WHERE id = $1 FOR UPDATE")
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await
        }
        RowKey::Practitioner(id) => {
            sqlx::query_scalar("SELECT version FROM practitioners WHERE id = $1 FOR UPDATE")
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await
        }
        RowKey::QueueCounter(location_id, date) => {
            sqlx::query_scalar(
                "SELECT version FROM queue_counters WHERE location_id = $1 AND clinic_date = $2 FOR UPDATE",
            )
            .bind(*location_id)
            .bind(*date)
            .fetch_optional(&mut *conn)
            .await
        }
    }
    .map_err(from_sqlx)?;

    Ok(version.map_or(0, from_db_version))
}

async fn insert_audit(conn: &mut PgConnection, record: &AuditRecord) -> Result<(), StoreError> {
    let recorded_at: DateTime<Utc> = record.recorded_at;
    sqlx::query(
        r"
        INSERT INTO flow_audit_log (id, action, entity_type, entity_id, recorded_at, data)
        VALUES ($1, $2, $3, $4, $5, $6)
        ",
    )
    .bind(record.id)
    .bind(&record.action)
    .bind(&record.entity_type)
    .bind(record.entity_id)
    .bind(recorded_at)
    .bind(to_json(record)?)
    .execute(&mut *conn)
    .await
    .map_err(from_sqlx)?;
    Ok(())
}

fn pick(seen: u64, insert: &'static str, update: &'static str) -> &'static str {
    if seen == 0 {
        insert
    } else {
        update
    }
}

fn decode<T: DeserializeOwned>(rows: Vec<VersionedRow>) -> Result<HashMap<Uuid, Versioned<T>>, StoreError> {
    rows.into_iter()
        .map(|(id, version, data)| {
            let row = serde_json::from_value(data)
                .map_err(|e| StoreError::Backend(format!("Corrupt row {id}: {e}")))?;
            Ok((
                id,
                Versioned {
                    version: from_db_version(version),
                    row,
                },
            ))
        })
        .collect()
}

fn to_json<T: Serialize>(row: &T) -> Result<Value, StoreError> {
    serde_json::to_value(row).map_err(|e| StoreError::Backend(format!("Failed to encode row: {e}")))
}

fn to_db_number(number: u32) -> Result<i32, StoreError> {
    i32::try_from(number).map_err(|_| StoreError::Backend(format!("Number {number} exceeds i32::MAX")))
}

fn from_db_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}

fn from_sqlx(err: sqlx::Error) -> StoreError {
    if let Some(db_err) = err.as_database_error() {
        if let Some(code) = db_err.code() {
            if matches!(code.as_ref(), UNIQUE_VIOLATION | SERIALIZATION_FAILURE | DEADLOCK_DETECTED) {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
    }
    StoreError::Backend(err.to_string())
}
