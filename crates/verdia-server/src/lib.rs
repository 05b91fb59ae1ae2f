use std::sync::Arc;

use verdia_catalog::{CatalogCache, ShopClient};
use verdia_orchestrator::Orchestrator;
use verdia_store::ConversationStore;
use verdia_types::WidgetConfig;

mod http;

pub use http::{app_router, serve};

/// Everything the handlers need, constructed once at startup and passed
/// explicitly. `orchestrator` is `None` when no LLM key is configured: the
/// service still serves the widget and history in that degraded mode.
#[derive(Clone)]
pub struct AppState {
    pub widget: WidgetConfig,
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub store: Arc<ConversationStore>,
    pub catalog: Option<Arc<CatalogCache>>,
    pub shop: Option<Arc<ShopClient>>,
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(widget: WidgetConfig, store: Arc<ConversationStore>) -> Self {
        Self {
            widget,
            orchestrator: None,
            store,
            catalog: None,
            shop: None,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<CatalogCache>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_shop(mut self, shop: Arc<ShopClient>) -> Self {
        self.shop = Some(shop);
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}
