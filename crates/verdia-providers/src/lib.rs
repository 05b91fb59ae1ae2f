use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use verdia_types::{ToolCall, ToolSchema};

mod embeddings;
mod vector;

pub use embeddings::EmbeddingClient;
pub use vector::{PineconeIndex, VectorIndex, VectorMatch, DEFAULT_TOP_K};

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const CHAT_TIMEOUT: Duration = Duration::from_secs(30);

/// One transcript entry on the completion wire. Assistant entries may carry
/// tool calls; tool entries answer one call by id.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant turn requesting tool calls. The model may emit content
    /// alongside the calls; it is kept so later rounds see it.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.unwrap_or_default(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: output.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    fn to_wire(&self) -> Value {
        let mut entry = json!({"role": self.role});
        if self.tool_calls.is_empty() {
            entry["content"] = Value::String(self.content.clone());
        } else {
            // Tool-calling assistant turns carry null content on the wire.
            entry["content"] = if self.content.is_empty() {
                Value::Null
            } else {
                Value::String(self.content.clone())
            };
            entry["tool_calls"] = self
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect();
        }
        if let Some(call_id) = &self.tool_call_id {
            entry["tool_call_id"] = Value::String(call_id.clone());
        }
        entry
    }
}

/// One completion round: the assistant content (possibly absent) and any
/// tool calls the model requested.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<ChatOutcome>;
}

/// OpenAI-compatible chat-completions client, non-streaming, with function
/// tools. One instance per process; `reqwest::Client` is internally pooled.
pub struct OpenAiChatProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiChatProvider {
    pub fn new(api_key: impl Into<String>, model: Option<String>) -> Self {
        Self::with_base_url("https://api.openai.com/v1", api_key, model)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            base_url: normalize_base(&base_url.into()),
            api_key: api_key.into(),
            model: model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            client: Client::builder()
                .timeout(CHAT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<ChatOutcome> {
        let wire_messages = messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>();
        let wire_tools = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": 700,
            "temperature": 0.7,
        });
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("chat request failed with status {status}"));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }

        Ok(parse_chat_outcome(&value))
    }
}

fn parse_chat_outcome(value: &Value) -> ChatOutcome {
    let message = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"));

    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty());

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id").and_then(|v| v.as_str())?;
                    let function = call.get("function")?;
                    let name = function.get("name").and_then(|v| v.as_str())?;
                    let arguments = function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("{}");
                    Some(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: arguments.to_string(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    ChatOutcome {
        content,
        tool_calls,
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_content_reply() {
        let value = json!({
            "choices": [{"message": {"content": "Tenemos varios cipreses."}}]
        });
        let outcome = parse_chat_outcome(&value);
        assert_eq!(outcome.content.as_deref(), Some("Tenemos varios cipreses."));
        assert!(outcome.tool_calls.is_empty());
    }

    #[test]
    fn parses_tool_calls_with_null_content() {
        let value = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "search_products", "arguments": "{\"query\":\"cipres\"}"}
                }]
            }}]
        });
        let outcome = parse_chat_outcome(&value);
        assert!(outcome.content.is_none());
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "search_products");
    }

    #[test]
    fn empty_content_string_is_treated_as_none() {
        let value = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(parse_chat_outcome(&value).content.is_none());
    }

    #[test]
    fn error_body_is_surfaced() {
        let value = json!({"error": {"message": "invalid api key"}});
        assert_eq!(
            extract_openai_error(&value).as_deref(),
            Some("invalid api key")
        );
    }

    #[test]
    fn base_url_normalization_appends_v1_once() {
        assert_eq!(
            normalize_base("https://api.openai.com/v1"),
            "https://api.openai.com/v1"
        );
        assert_eq!(
            normalize_base("https://api.openai.com/"),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn tool_result_message_carries_call_id_on_wire() {
        let wire = ChatMessage::tool_result("call_1", "Sin resultados.").to_wire();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
        assert_eq!(wire["content"], "Sin resultados.");
    }

    #[test]
    fn tool_calling_assistant_turn_has_null_content() {
        let wire = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "search_products".to_string(),
                arguments: "{}".to_string(),
            }],
        )
        .to_wire();
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "search_products");
    }

    #[test]
    fn tool_calling_assistant_turn_keeps_its_content() {
        let wire = ChatMessage::assistant_tool_calls(
            Some("Voy a buscar en el catálogo.".to_string()),
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "search_products".to_string(),
                arguments: "{}".to_string(),
            }],
        )
        .to_wire();
        assert_eq!(wire["content"], "Voy a buscar en el catálogo.");
        assert_eq!(wire["tool_calls"][0]["id"], "call_1");
    }
}
