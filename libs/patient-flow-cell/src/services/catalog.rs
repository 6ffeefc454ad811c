use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

/// Source of service durations.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// `None` when the service is unknown.
    async fn estimated_duration_minutes(&self, service_id: Uuid) -> Result<Option<u32>>;
}

#[derive(Debug, Default)]
pub struct InMemoryServiceCatalog {
    durations: RwLock<HashMap<Uuid, u32>>,
}

impl InMemoryServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, service_id: Uuid, minutes: u32) -> Self {
        self.insert(service_id, minutes);
        self
    }

    pub fn insert(&self, service_id: Uuid, minutes: u32) {
        match self.durations.write() {
            Ok(mut durations) => {
                durations.insert(service_id, minutes);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(service_id, minutes);
            }
        }
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryServiceCatalog {
    async fn estimated_duration_minutes(&self, service_id: Uuid) -> Result<Option<u32>> {
        let durations = self
            .durations
            .read()
            .map_err(|_| anyhow!("service catalog lock poisoned"))?;
        Ok(durations.get(&service_id).copied())
    }
}

#[derive(Debug, Deserialize)]
struct ServiceRow {
    estimated_duration_minutes: Option<u32>,
}

/// Reads durations from the `services` table over PostgREST.
pub struct SupabaseServiceCatalog {
    client: SupabaseClient,
}

impl SupabaseServiceCatalog {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: SupabaseClient::new(config),
        }
    }
}

#[async_trait]
impl ServiceCatalog for SupabaseServiceCatalog {
    async fn estimated_duration_minutes(&self, service_id: Uuid) -> Result<Option<u32>> {
        let path = format!(
            "/rest/v1/services?id=eq.{}&select=estimated_duration_minutes",
            service_id
        );
        let rows: Vec<ServiceRow> = self.client.request(Method::GET, &path, None).await?;
        Ok(rows.into_iter().next().and_then(|row| row.estimated_duration_minutes))
    }
}
