//! Relational configuration store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use permgate_common::error::{Error, Result};
use permgate_common::types::PermissionConfig;

use crate::ConfigStore;

/// Row access the database store needs from a driver.
///
/// Rows are JSON objects; drivers map them to and from their native tables.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Row whose `object` column equals `object`
    async fn find_one(&self, table: &str, object: &str) -> Result<Option<JsonValue>>;

    async fn find_all(&self, table: &str) -> Result<Vec<JsonValue>>;

    /// Insert or replace the row for `object`
    async fn upsert(&self, table: &str, object: &str, row: JsonValue) -> Result<()>;

    async fn delete(&self, table: &str, object: &str) -> Result<()>;
}

/// Configuration kept one row per object in a table
pub struct DatabaseStore {
    driver: Arc<dyn DatabaseDriver>,
    table: String,
}

impl DatabaseStore {
    pub fn new(driver: Arc<dyn DatabaseDriver>, table: &str) -> Self {
        Self {
            driver,
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Decode a row: either the configuration document itself or
/// `{object, config}` with `config` as a JSON document or JSON text.
fn decode_row(row: JsonValue) -> Result<PermissionConfig> {
    match row.get("config") {
        Some(JsonValue::String(text)) => Ok(serde_json::from_str(text)?),
        Some(doc @ JsonValue::Object(_)) => Ok(serde_json::from_value(doc.clone())?),
        Some(other) => Err(Error::Storage(format!(
            "unexpected config column type: {other}"
        ))),
        None => Ok(serde_json::from_value(row)?),
    }
}

#[async_trait]
impl ConfigStore for DatabaseStore {
    async fn load(&self, object: &str) -> Result<Option<PermissionConfig>> {
        self.driver
            .find_one(&self.table, object)
            .await?
            .map(decode_row)
            .transpose()
    }

    async fn load_all(&self) -> Result<HashMap<String, PermissionConfig>> {
        let mut configs = HashMap::new();
        for row in self.driver.find_all(&self.table).await? {
            match decode_row(row) {
                Ok(config) => {
                    configs.insert(config.object.clone(), config);
                }
                Err(e) => warn!("Skipping unreadable row in {}: {}", self.table, e),
            }
        }
        Ok(configs)
    }

    async fn reload(&self) -> Result<()> {
        // Every load goes to the database
        Ok(())
    }

    async fn save(&self, config: PermissionConfig) -> Result<()> {
        let row = serde_json::json!({
            "object": config.object,
            "config": serde_json::to_string(&config)?,
        });
        self.driver.upsert(&self.table, &config.object, row).await
    }

    async fn remove(&self, object: &str) -> Result<()> {
        self.driver.delete(&self.table, object).await
    }

    fn kind(&self) -> &'static str {
        "database"
    }
}
