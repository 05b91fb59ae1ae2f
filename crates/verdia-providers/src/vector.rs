use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

pub const DEFAULT_TOP_K: usize = 15;
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// One nearest neighbor returned by the index, metadata attached as stored
/// at ingestion time.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f64,
    pub metadata: Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Nearest-neighbor query. `web_only` limits matches to web stock;
    /// otherwise web or physical stock qualifies. No minimum score is
    /// enforced: every returned neighbor is passed through.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        web_only: bool,
    ) -> anyhow::Result<Vec<VectorMatch>>;
}

/// Pinecone serverless index query client.
pub struct PineconeIndex {
    host: String,
    api_key: String,
    client: Client,
}

impl PineconeIndex {
    pub fn new(host: impl Into<String>, api_key: impl Into<String>) -> Self {
        let host = host.into();
        let host = if host.starts_with("http") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        Self {
            host,
            api_key: api_key.into(),
            client: Client::builder()
                .timeout(QUERY_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn stock_filter(web_only: bool) -> Value {
        if web_only {
            json!({"stock_web": {"$gt": 0}})
        } else {
            json!({"$or": [
                {"stock_web": {"$gt": 0}},
                {"stock_fisico": {"$gt": 0}},
            ]})
        }
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        web_only: bool,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let response = self
            .client
            .post(format!("{}/query", self.host))
            .header("Api-Key", &self.api_key)
            .json(&json!({
                "vector": vector,
                "topK": top_k,
                "includeMetadata": true,
                "filter": Self::stock_filter(web_only),
            }))
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            let detail = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("vector query failed");
            anyhow::bail!("{detail} (status {status})");
        }

        let matches = value
            .get("matches")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let id = row.get("id").and_then(|v| v.as_str())?;
                        Some(VectorMatch {
                            id: id.to_string(),
                            score: row.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
                            metadata: row.get("metadata").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_only_filter_targets_web_stock() {
        let filter = PineconeIndex::stock_filter(true);
        assert!(filter.get("stock_web").is_some());
        assert!(filter.get("$or").is_none());
    }

    #[test]
    fn broad_filter_accepts_web_or_physical_stock() {
        let filter = PineconeIndex::stock_filter(false);
        let branches = filter.get("$or").and_then(|v| v.as_array()).expect("$or");
        assert_eq!(branches.len(), 2);
    }

    #[test]
    fn bare_host_gains_https_scheme() {
        let index = PineconeIndex::new("products-abc123.svc.pinecone.io", "key");
        assert_eq!(index.host, "https://products-abc123.svc.pinecone.io");
    }
}
