use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use verdia_store::{current_session_date, is_valid_device_id, resolve_device_id, IDLE_EVICTION};
use verdia_types::Message;

use crate::AppState;

const EMBED_JS: &str = include_str!("../../../assets/embed.js");
const WIDGET_JS: &str = include_str!("../../../assets/widget.js");

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Deserialize)]
struct ChatInput {
    message: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClearInput {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let sweeper_state = state.clone();
    let sweeper = tokio::spawn(async move {
        loop {
            tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
            let evicted = sweeper_state.store.sweep_idle(IDLE_EVICTION).await;
            if evicted > 0 {
                tracing::info!(target: "verdia.http", evicted, "evicted idle sessions");
            }
        }
    });

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "verdia.http", %addr, "listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    sweeper.abort();
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    Router::new()
        .route("/api/config", get(widget_config))
        .route("/api/chat", post(chat))
        .route("/api/chat/history", get(chat_history))
        .route("/api/chat/clear", post(chat_clear))
        .route("/api/chat/image/{product_id}/{image_id}", get(product_image))
        .route(
            "/api/articulos/image/{product_id}/{image_id}",
            get(product_image),
        )
        .route("/health", get(health))
        .route("/embed.js", get(embed_js))
        .route("/widget.js", get(widget_js))
        .layer(cors)
        .with_state(state)
}

/// Allow-list CORS: an empty configured list allows any origin, matching
/// the widget's default deployment.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| origin.trim().parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn widget_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.widget))
}

async fn chat(
    State(state): State<AppState>,
    Json(input): Json<ChatInput>,
) -> Result<Json<Value>, Response> {
    let message = input
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, "El mensaje es requerido")
        })?
        .to_string();

    let Some(orchestrator) = state.orchestrator.clone() else {
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "El asistente no está configurado (falta la API key del modelo)",
        ));
    };

    let device_id = resolve_device_id(input.device_id.as_deref());
    let history = state.store.load(&device_id).await;

    // The user turn is stored before calling the model, so a failed
    // completion still leaves the shopper's message in history. The reply
    // is returned before the durable writes confirm; the store spawns
    // those.
    state.store.append(&device_id, Message::user(&message)).await;

    let outcome = orchestrator
        .run_turn(&history, &message)
        .await
        .map_err(|error| {
            tracing::error!(target: "verdia.http", %error, "chat turn failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error al procesar el mensaje",
            )
        })?;

    let products = if outcome.products.is_empty() {
        None
    } else {
        Some(outcome.products.clone())
    };
    state
        .store
        .append(
            &device_id,
            Message::assistant(&outcome.reply, products.clone()),
        )
        .await;

    let mut body = json!({
        "message": outcome.reply,
        "deviceId": device_id,
    });
    if let Some(products) = products {
        body["products"] = json!(products);
    }
    Ok(Json(body))
}

async fn chat_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let session_date = current_session_date();
    let valid = query
        .device_id
        .as_deref()
        .map(is_valid_device_id)
        .unwrap_or(false);
    if !valid {
        // Invalid or missing ids get an empty history, never an error.
        return Json(json!({
            "messages": [],
            "sessionDate": session_date,
            "messageCount": 0,
        }));
    }

    let device_id = query.device_id.unwrap_or_default();
    let messages = state.store.load(device_id.trim()).await;
    Json(json!({
        "messages": messages,
        "sessionDate": session_date,
        "messageCount": messages.len(),
    }))
}

async fn chat_clear(
    State(state): State<AppState>,
    Json(input): Json<ClearInput>,
) -> Json<Value> {
    let device_id = resolve_device_id(input.device_id.as_deref());
    state.store.clear_cache(&device_id).await;
    Json(json!({"success": true}))
}

async fn product_image(
    State(state): State<AppState>,
    Path((product_id, image_id)): Path<(String, String)>,
) -> Response {
    let Some(shop) = state.shop.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match shop.fetch_image(&product_id, &image_id).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Err(error) => {
            tracing::warn!(target: "verdia.http", %error, "image proxy failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let catalog_ready = match &state.catalog {
        Some(cache) => cache.is_populated().await,
        None => false,
    };
    Json(json!({
        "status": "ok",
        "chatConfigured": state.orchestrator.is_some(),
        "catalogReady": catalog_ready,
        "persistenceConfigured": state.store.persistence_configured(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn embed_js() -> Response {
    js_asset(EMBED_JS)
}

async fn widget_js() -> Response {
    js_asset(WIDGET_JS)
}

fn js_asset(body: &'static str) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        body,
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;
    use verdia_catalog::ProductSearch;
    use verdia_orchestrator::Orchestrator;
    use verdia_providers::{ChatMessage, ChatOutcome, ChatProvider};
    use verdia_store::{ConversationStore, NoopPersistence};
    use verdia_types::{Product, ToolSchema, WidgetConfig};

    struct FixedProvider(String);

    #[async_trait]
    impl ChatProvider for FixedProvider {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSchema],
        ) -> anyhow::Result<ChatOutcome> {
            Ok(ChatOutcome {
                content: Some(self.0.clone()),
                tool_calls: Vec::new(),
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ChatProvider for FailingProvider {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSchema],
        ) -> anyhow::Result<ChatOutcome> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct EmptySearch;

    #[async_trait]
    impl ProductSearch for EmptySearch {
        async fn search(&self, _term: &str, _web_only: bool) -> Vec<Product> {
            Vec::new()
        }
    }

    fn base_state() -> AppState {
        AppState::new(
            WidgetConfig::default(),
            Arc::new(ConversationStore::new(Arc::new(NoopPersistence))),
        )
    }

    fn state_with_chat(reply: &str) -> AppState {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedProvider(reply.to_string())),
            Arc::new(EmptySearch),
            "Eres un asistente.".to_string(),
        );
        base_state().with_orchestrator(Arc::new(orchestrator))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn config_endpoint_returns_widget_settings() {
        let app = app_router(base_state());
        let response = app
            .oneshot(
                Request::get("/api/config")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["botName"], "Asistente Virtual");
        assert_eq!(body["position"], "right");
    }

    #[tokio::test]
    async fn chat_without_message_is_a_400() {
        let app = app_router(state_with_chat("hola"));
        let response = app
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "El mensaje es requerido");
    }

    #[tokio::test]
    async fn chat_without_llm_key_reports_not_configured() {
        let app = app_router(base_state());
        let response = app
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"hola"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap_or_default()
            .contains("no está configurado"));
    }

    #[tokio::test]
    async fn chat_replies_and_falls_back_to_anonymous_device() {
        let app = app_router(state_with_chat("¡Hola! ¿Qué buscas?"));
        let response = app
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"hola","deviceId":"abc"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["message"], "¡Hola! ¿Qué buscas?");
        assert_eq!(body["deviceId"], "anonymous");
        assert!(body.get("products").is_none());
    }

    #[tokio::test]
    async fn history_with_invalid_device_id_is_empty_not_an_error() {
        let app = app_router(base_state());
        let response = app
            .oneshot(
                Request::get("/api/chat/history?deviceId=abc")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["messages"], json!([]));
        assert_eq!(body["messageCount"], 0);
        assert_eq!(body["sessionDate"], current_session_date());
    }

    #[tokio::test]
    async fn chat_then_history_round_trips_for_a_valid_device() {
        let state = state_with_chat("Claro, tenemos rosales.");
        let app = app_router(state.clone());
        let device = "dev_9b2f1c3a-4d5e-4f6a-8b9c-0d1e2f3a4b5c";
        let request = Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(format!(
                r#"{{"message":"¿rosales?","deviceId":"{device}"}}"#
            )))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get(format!("/api/chat/history?deviceId={device}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(body["messageCount"], 2);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "Claro, tenemos rosales.");
    }

    #[tokio::test]
    async fn failed_completion_keeps_the_user_message_in_history() {
        let orchestrator = Orchestrator::new(
            Arc::new(FailingProvider),
            Arc::new(EmptySearch),
            "Eres un asistente.".to_string(),
        );
        let state = base_state().with_orchestrator(Arc::new(orchestrator));
        let app = app_router(state);
        let device = "dev_9b2f1c3a-4d5e-4f6a-8b9c-0d1e2f3a4b5c";
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(format!(
                        r#"{{"message":"¿rosales?","deviceId":"{device}"}}"#
                    )))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = app
            .oneshot(
                Request::get(format!("/api/chat/history?deviceId={device}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(body["messageCount"], 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "¿rosales?");
    }

    #[tokio::test]
    async fn clear_only_touches_the_memory_cache() {
        let state = state_with_chat("ok");
        let app = app_router(state);
        let response = app
            .oneshot(
                Request::post("/api/chat/clear")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"deviceId":"abc"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn health_reports_degraded_mode_flags() {
        let app = app_router(base_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["chatConfigured"], false);
        assert_eq!(body["catalogReady"], false);
        assert_eq!(body["persistenceConfigured"], false);
    }

    #[tokio::test]
    async fn embed_script_is_served_as_javascript() {
        let app = app_router(base_state());
        let response = app
            .oneshot(
                Request::get("/embed.js")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("application/javascript"));
    }
}
