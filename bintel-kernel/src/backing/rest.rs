use super::TelemetryTable;
use crate::error::StoreError;
use crate::models::{DeviceId, TelemetryRow};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Table de télémétrie derrière une API HTTP façon PostgREST
/// (`{base_url}/rest/v1/{table}`).
#[derive(Clone)]
pub struct RestTable {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl RestTable {
    pub fn new(base_url: &str, table: &str, api_key: Option<String>) -> Result<Self, StoreError> {
        let client = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("apikey", key).bearer_auth(key),
            None => req,
        }
    }

    async fn select(&self, query: &[(&str, String)]) -> Result<Vec<TelemetryRow>, StoreError> {
        let req = self.authorized(self.client.get(&self.endpoint)).query(query);
        let rows = req.send().await?.error_for_status()?.json::<Vec<TelemetryRow>>().await?;
        debug!(endpoint = %self.endpoint, rows = rows.len(), "fetched telemetry rows");
        Ok(rows)
    }
}

#[async_trait]
impl TelemetryTable for RestTable {
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<TelemetryRow>, StoreError> {
        self.select(&recent_query(limit)).await
    }

    async fn fetch_latest(&self, device_id: DeviceId) -> Result<Option<TelemetryRow>, StoreError> {
        let mut query = recent_query(1);
        query.push(("bin_id", format!("eq.{device_id}")));
        Ok(self.select(&query).await?.into_iter().next())
    }

    async fn insert(&self, row: TelemetryRow) -> Result<(), StoreError> {
        self.authorized(self.client.post(&self.endpoint))
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn recent_query(limit: usize) -> Vec<(&'static str, String)> {
    vec![
        ("select", "*".to_string()),
        ("order", "created_at.desc".to_string()),
        ("limit", limit.to_string()),
    ]
}
