use std::sync::Arc;

use serde_json::{json, Value};

use verdia_catalog::ProductSearch;
use verdia_providers::{ChatMessage, ChatProvider};
use verdia_types::{Message, MessageRole, Product, ToolCall, ToolResult, ToolSchema};

/// Completion rounds allowed per turn. On the cap, the last model content
/// (or the fallback string) is final regardless of pending tool calls.
pub const DEFAULT_MAX_ITERATIONS: usize = 6;

/// Prior turns included in the model context; older history is dropped to
/// bound token cost.
pub const CONTEXT_WINDOW_TURNS: usize = 14;

pub const FALLBACK_REPLY: &str =
    "Lo siento, no he podido completar la consulta. ¿Puedes reformularla?";

pub const SEARCH_TOOL_NAME: &str = "search_products";

/// Turn progress. `Searching` holds the calls still to execute plus any
/// content the model emitted alongside them; the loop only ever moves
/// Thinking -> Searching -> Thinking -> ... -> Done.
#[derive(Debug, Clone)]
enum TurnPhase {
    Thinking,
    Searching(Vec<ToolCall>, Option<String>),
    Done(String),
}

/// Final result of one user turn: the assistant reply plus every product
/// surfaced by executed searches, concatenated across tool calls without
/// id deduplication.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub products: Vec<Product>,
}

pub struct Orchestrator {
    provider: Arc<dyn ChatProvider>,
    search: Arc<dyn ProductSearch>,
    system_prompt: String,
    max_iterations: usize,
    context_window: usize,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        search: Arc<dyn ProductSearch>,
        system_prompt: String,
    ) -> Self {
        Self {
            provider,
            search,
            system_prompt,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            context_window: CONTEXT_WINDOW_TURNS,
        }
    }

    pub fn with_limits(mut self, max_iterations: usize, context_window: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self.context_window = context_window.max(1);
        self
    }

    /// Run one user turn to completion. Errors only on a failed completion
    /// call; search failures inside the loop degrade to empty tool results.
    pub async fn run_turn(
        &self,
        history: &[Message],
        user_message: &str,
    ) -> anyhow::Result<TurnOutcome> {
        let mut transcript = self.base_context(history, user_message);
        let tools = [search_tool_schema()];
        let mut accumulated: Vec<Product> = Vec::new();
        let mut last_content: Option<String> = None;
        let mut rounds = 0usize;
        let mut phase = TurnPhase::Thinking;

        loop {
            phase = match phase {
                TurnPhase::Thinking => {
                    if rounds == self.max_iterations {
                        // Cap reached with tool calls still pending.
                        tracing::warn!(
                            target: "verdia.orchestrator",
                            cap = self.max_iterations,
                            "turn hit the iteration cap"
                        );
                        TurnPhase::Done(last_content.clone().unwrap_or_else(fallback_reply))
                    } else {
                        rounds += 1;
                        let outcome = self.provider.complete(&transcript, &tools).await?;
                        if let Some(content) = outcome.content.clone() {
                            last_content = Some(content);
                        }
                        if outcome.tool_calls.is_empty() {
                            TurnPhase::Done(last_content.clone().unwrap_or_else(fallback_reply))
                        } else {
                            tracing::debug!(
                                target: "verdia.orchestrator",
                                round = rounds,
                                calls = outcome.tool_calls.len(),
                                "model requested product searches"
                            );
                            TurnPhase::Searching(outcome.tool_calls, outcome.content)
                        }
                    }
                }
                TurnPhase::Searching(calls, content) => {
                    transcript.push(ChatMessage::assistant_tool_calls(content, calls.clone()));
                    for call in &calls {
                        let (result, products) = self.execute_call(call).await;
                        accumulated.extend(products);
                        transcript.push(ChatMessage::tool_result(result.call_id, result.output));
                    }
                    TurnPhase::Thinking
                }
                TurnPhase::Done(reply) => {
                    return Ok(TurnOutcome {
                        reply,
                        products: accumulated,
                    });
                }
            };
        }
    }

    fn base_context(&self, history: &[Message], user_message: &str) -> Vec<ChatMessage> {
        let mut transcript = vec![ChatMessage::system(self.system_prompt.clone())];
        let start = history.len().saturating_sub(self.context_window);
        for message in &history[start..] {
            transcript.push(match message.role {
                MessageRole::User => ChatMessage::user(message.content.clone()),
                MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
            });
        }
        transcript.push(ChatMessage::user(user_message));
        transcript
    }

    /// Execute one tool call. A malformed argument payload or an unknown
    /// tool fails only this call, with an empty result.
    async fn execute_call(&self, call: &ToolCall) -> (ToolResult, Vec<Product>) {
        let result = |output: String| ToolResult {
            call_id: call.id.clone(),
            output,
        };
        if call.name != SEARCH_TOOL_NAME {
            tracing::warn!(target: "verdia.orchestrator", tool = %call.name, "unknown tool requested");
            return (result("Herramienta desconocida.".to_string()), Vec::new());
        }
        let Some((query, web_only)) = parse_search_args(&call.arguments) else {
            tracing::warn!(
                target: "verdia.orchestrator",
                arguments = %call.arguments,
                "malformed search arguments"
            );
            return (result(render_candidates(&[])), Vec::new());
        };

        let products = self.search.search(&query, web_only).await;
        (result(render_candidates(&products)), products)
    }
}

fn fallback_reply() -> String {
    FALLBACK_REPLY.to_string()
}

pub fn search_tool_schema() -> ToolSchema {
    ToolSchema {
        name: SEARCH_TOOL_NAME.to_string(),
        description: "Busca productos del catálogo por texto libre. Úsala siempre que el \
                      cliente pregunte por plantas, precios o disponibilidad."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Término de búsqueda, p. ej. 'ciprés de seto'",
                },
                "web_only": {
                    "type": "boolean",
                    "description": "Limitar a productos con stock web",
                },
            },
            "required": ["query"],
        }),
    }
}

/// Validate tool-call arguments against the declared schema: a required
/// non-empty `query` string and an optional boolean `web_only`.
fn parse_search_args(raw: &str) -> Option<(String, bool)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let query = value
        .get("query")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|q| !q.is_empty())?
        .to_string();
    let web_only = match value.get("web_only") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return None,
    };
    Some((query, web_only))
}

/// Serialize candidates into the tool-result text handed back to the model.
fn render_candidates(products: &[Product]) -> String {
    if products.is_empty() {
        return "Sin resultados.".to_string();
    }
    let mut lines = Vec::with_capacity(products.len());
    for product in products {
        let stock = match product.stock {
            Some(quantity) => quantity.to_string(),
            None => "desconocido".to_string(),
        };
        lines.push(format!(
            "- {} (ref {}) — {:.2} € IVA incl. — stock: {}",
            product.name, product.reference, product.price_tax_incl, stock
        ));
    }
    lines.join("\n")
}
