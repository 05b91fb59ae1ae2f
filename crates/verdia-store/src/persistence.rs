use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use verdia_types::Message;

const PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable history backend. Writes are best-effort: a failure is logged by
/// the store and never surfaces to the shopper.
#[async_trait]
pub trait HistoryPersistence: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn load(
        &self,
        device_id: &str,
        session_date: &str,
    ) -> anyhow::Result<Option<Vec<Message>>>;

    async fn save(
        &self,
        device_id: &str,
        session_date: &str,
        messages: &[Message],
    ) -> anyhow::Result<()>;
}

/// In-memory-only deployments: nothing durable configured.
pub struct NoopPersistence;

#[async_trait]
impl HistoryPersistence for NoopPersistence {
    fn is_configured(&self) -> bool {
        false
    }

    async fn load(&self, _: &str, _: &str) -> anyhow::Result<Option<Vec<Message>>> {
        Ok(None)
    }

    async fn save(&self, _: &str, _: &str, _: &[Message]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// MongoDB Data API client. One document per `(deviceId, sessionDate)`
/// holding the full ordered message list; saves replace the document with
/// upsert, which keeps the partition append-only from the caller's side.
pub struct MongoDataApi {
    base_url: String,
    api_key: String,
    data_source: String,
    database: String,
    collection: String,
    client: Client,
}

impl MongoDataApi {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            data_source: "Cluster0".to_string(),
            database: "chatbot".to_string(),
            collection: "conversations".to_string(),
            client: Client::builder()
                .timeout(PERSIST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn action(&self, action: &str, body: Value) -> anyhow::Result<Value> {
        let mut payload = json!({
            "dataSource": self.data_source,
            "database": self.database,
            "collection": self.collection,
        });
        if let (Some(base), Some(extra)) = (payload.as_object_mut(), body.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        let response = self
            .client
            .post(format!("{}/action/{action}", self.base_url))
            .header("api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("document store {action} failed with status {status}");
        }
        Ok(value)
    }
}

#[async_trait]
impl HistoryPersistence for MongoDataApi {
    fn is_configured(&self) -> bool {
        true
    }

    async fn load(
        &self,
        device_id: &str,
        session_date: &str,
    ) -> anyhow::Result<Option<Vec<Message>>> {
        let value = self
            .action(
                "findOne",
                json!({"filter": {"deviceId": device_id, "sessionDate": session_date}}),
            )
            .await?;
        let Some(document) = value.get("document").filter(|d| !d.is_null()) else {
            return Ok(None);
        };
        let messages = document
            .get("messages")
            .cloned()
            .map(serde_json::from_value::<Vec<Message>>)
            .transpose()?
            .unwrap_or_default();
        Ok(Some(messages))
    }

    async fn save(
        &self,
        device_id: &str,
        session_date: &str,
        messages: &[Message],
    ) -> anyhow::Result<()> {
        self.action(
            "replaceOne",
            json!({
                "filter": {"deviceId": device_id, "sessionDate": session_date},
                "replacement": {
                    "deviceId": device_id,
                    "sessionDate": session_date,
                    "messages": messages,
                    "messageCount": messages.len(),
                },
                "upsert": true,
            }),
        )
        .await?;
        Ok(())
    }
}
