use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;
use tracing::warn;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::RetryPolicy;

/// Values an operation reads once at its start and carries through its
/// atomic unit: the clock reading, the clinic's UTC offset and which clinic
/// queues are administratively paused.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub now: DateTime<Utc>,
    pub utc_offset: FixedOffset,
    pub paused_locations: HashSet<Uuid>,
}

impl OperationContext {
    pub fn new(now: DateTime<Utc>, utc_offset: FixedOffset) -> Self {
        Self {
            now,
            utc_offset,
            paused_locations: HashSet::new(),
        }
    }

    pub fn with_paused(mut self, location_id: Uuid) -> Self {
        self.paused_locations.insert(location_id);
        self
    }

    pub fn is_paused(&self, location_id: Uuid) -> bool {
        self.paused_locations.contains(&location_id)
    }

    /// Calendar date at the clinic.
    pub fn today(&self) -> NaiveDate {
        self.now.with_timezone(&self.utc_offset).date_naive()
    }
}

/// Tunables of the patient-flow engine.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub utc_offset: FixedOffset,
    pub check_in_early: Duration,
    pub late_threshold: Duration,
    pub no_show_threshold: Duration,
    pub default_service_minutes: u32,
    pub transaction_retry: RetryPolicy,
    pub notification_retry: RetryPolicy,
}

impl FlowSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let utc_offset = FixedOffset::east_opt(config.clinic_utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| {
                warn!(
                    "CLINIC_UTC_OFFSET_MINUTES={} is out of range, using UTC",
                    config.clinic_utc_offset_minutes
                );
                utc()
            });

        Self {
            utc_offset,
            check_in_early: Duration::minutes(config.check_in_early_minutes),
            late_threshold: Duration::minutes(config.late_threshold_minutes),
            no_show_threshold: Duration::minutes(config.no_show_threshold_minutes),
            default_service_minutes: config.default_service_duration_minutes,
            transaction_retry: RetryPolicy::new()
                .with_max_attempts(config.transaction_max_attempts)
                .with_initial_delay(StdDuration::from_millis(config.transaction_retry_delay_ms)),
            notification_retry: RetryPolicy::new()
                .with_max_attempts(config.notification_max_attempts)
                .with_initial_delay(StdDuration::from_millis(config.notification_initial_delay_ms)),
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: Duration) {
        let next = self.now() + by;
        self.set(next);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn today_follows_clinic_offset() {
        let late_evening_utc = Utc.with_ymd_and_hms(2026, 10, 19, 23, 30, 0).unwrap();
        let ahead = FixedOffset::east_opt(2 * 3600).unwrap();

        let ctx = OperationContext::new(late_evening_utc, ahead);
        assert_eq!(ctx.today(), NaiveDate::from_ymd_opt(2026, 10, 20).unwrap());

        let ctx = OperationContext::new(late_evening_utc, utc());
        assert_eq!(ctx.today(), NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
    }

    #[test]
    fn pause_is_scoped_to_location() {
        let paused = Uuid::new_v4();
        let ctx = OperationContext::new(Utc::now(), utc()).with_paused(paused);
        assert!(ctx.is_paused(paused));
        assert!(!ctx.is_paused(Uuid::new_v4()));
    }

    #[test]
    fn settings_follow_config() {
        let config = AppConfig {
            clinic_utc_offset_minutes: -300,
            transaction_max_attempts: 5,
            ..AppConfig::default()
        };
        let settings = FlowSettings::from_config(&config);
        assert_eq!(settings.utc_offset.local_minus_utc(), -300 * 60);
        assert_eq!(settings.transaction_retry.max_attempts(), 5);
        assert_eq!(settings.check_in_early, Duration::minutes(30));
        assert_eq!(
            settings.notification_retry.delay_for_attempt(1),
            StdDuration::from_secs(2)
        );
    }

    #[test]
    fn fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        clock.advance(Duration::minutes(20));
        assert_eq!(clock.now(), start + Duration::minutes(20));
    }
}
