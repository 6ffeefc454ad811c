use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_port: u16,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub notifier_webhook_url: Option<String>,
    pub clinic_utc_offset_minutes: i32,
    pub check_in_early_minutes: i64,
    pub transaction_max_attempts: u32,
    pub transaction_retry_delay_ms: u64,
    pub notification_max_attempts: u32,
    pub notification_initial_delay_ms: u64,
    pub sweep_interval_seconds: u64,
    pub late_threshold_minutes: i64,
    pub no_show_threshold_minutes: i64,
    pub default_service_duration_minutes: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_port: 3000,
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            notifier_webhook_url: None,
            clinic_utc_offset_minutes: 0,
            check_in_early_minutes: 30,
            transaction_max_attempts: 3,
            transaction_retry_delay_ms: 25,
            notification_max_attempts: 3,
            notification_initial_delay_ms: 1000,
            sweep_interval_seconds: 300,
            late_threshold_minutes: 15,
            no_show_threshold_minutes: 30,
            default_service_duration_minutes: 30,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            server_port: parsed_or("SERVER_PORT", defaults.server_port),
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, remote audit sink and service catalog disabled");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            database_max_connections: parsed_or(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            notifier_webhook_url: env::var("NOTIFIER_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            clinic_utc_offset_minutes: parsed_or(
                "CLINIC_UTC_OFFSET_MINUTES",
                defaults.clinic_utc_offset_minutes,
            ),
            check_in_early_minutes: parsed_or("CHECK_IN_EARLY_MINUTES", defaults.check_in_early_minutes),
            transaction_max_attempts: parsed_or("TRANSACTION_MAX_ATTEMPTS", defaults.transaction_max_attempts),
            transaction_retry_delay_ms: parsed_or(
                "TRANSACTION_RETRY_DELAY_MS",
                defaults.transaction_retry_delay_ms,
            ),
            notification_max_attempts: parsed_or(
                "NOTIFICATION_MAX_ATTEMPTS",
                defaults.notification_max_attempts,
            ),
            notification_initial_delay_ms: parsed_or(
                "NOTIFICATION_INITIAL_DELAY_MS",
                defaults.notification_initial_delay_ms,
            ),
            sweep_interval_seconds: parsed_or("SWEEP_INTERVAL_SECONDS", defaults.sweep_interval_seconds),
            late_threshold_minutes: parsed_or("LATE_THRESHOLD_MINUTES", defaults.late_threshold_minutes),
            no_show_threshold_minutes: parsed_or(
                "NO_SHOW_THRESHOLD_MINUTES",
                defaults.no_show_threshold_minutes,
            ),
            default_service_duration_minutes: parsed_or(
                "DEFAULT_SERVICE_DURATION_MINUTES",
                defaults.default_service_duration_minutes,
            ),
        };

        if config.transaction_max_attempts == 0 || config.notification_max_attempts == 0 {
            warn!("Retry attempts configured as 0, operations will run once");
        }

        config
    }

    pub fn is_supabase_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn is_database_configured(&self) -> bool {
        self.database_url.is_some()
    }

    pub fn is_redis_configured(&self) -> bool {
        self.redis_url.is_some()
    }
}

fn parsed_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_clinic_policy() {
        let config = AppConfig::default();
        assert_eq!(config.check_in_early_minutes, 30);
        assert_eq!(config.transaction_max_attempts, 3);
        assert_eq!(config.notification_max_attempts, 3);
        assert_eq!(config.notification_initial_delay_ms, 1000);
        assert!(!config.is_supabase_configured());
        assert!(!config.is_redis_configured());
        assert!(!config.is_database_configured());
    }

    #[test]
    fn invalid_numbers_fall_back_to_default() {
        env::set_var("CLINIC_FLOW_TEST_PORT", "not-a-port");
        assert_eq!(parsed_or("CLINIC_FLOW_TEST_PORT", 3000u16), 3000);
        env::set_var("CLINIC_FLOW_TEST_PORT", " 8080 ");
        assert_eq!(parsed_or("CLINIC_FLOW_TEST_PORT", 3000u16), 8080);
        env::remove_var("CLINIC_FLOW_TEST_PORT");
    }
}
