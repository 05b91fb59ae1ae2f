use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const EMBEDDING_DIMENSION: usize = 512;
const EMBED_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenAI embeddings client. The index was populated with 512-dimension
/// `text-embedding-3-small` vectors, so queries must match both.
pub struct EmbeddingClient {
    api_key: String,
    client: Client,
}

impl EmbeddingClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::builder()
                .timeout(EMBED_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn embed(&self, input: &str) -> anyhow::Result<Vec<f32>> {
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": EMBEDDING_MODEL,
                "input": input,
                "dimensions": EMBEDDING_DIMENSION,
            }))
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            let detail = value
                .get("error")
                .and_then(|v| v.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("embedding request failed");
            anyhow::bail!("{detail} (status {status})");
        }

        let embedding = value
            .get("data")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("embedding"))
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if embedding.len() != EMBEDDING_DIMENSION {
            anyhow::bail!(
                "embedding dimension mismatch: expected {}, got {}",
                EMBEDDING_DIMENSION,
                embedding.len()
            );
        }
        Ok(embedding)
    }
}
