use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tracing::info;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::AuditRecord;

/// Append-only destination for committed audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "audit",
            action = %record.action,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            "{}",
            record.description
        );
        Ok(())
    }
}

/// Inserts into the `audit_logs` table over PostgREST.
pub struct SupabaseAuditSink {
    client: SupabaseClient,
}

impl SupabaseAuditSink {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: SupabaseClient::new(config),
        }
    }
}

#[async_trait]
impl AuditSink for SupabaseAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        self.client
            .execute(Method::POST, "/rest/v1/audit_logs", Some(json!(record)))
            .await
    }
}
